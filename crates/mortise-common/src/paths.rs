//! Host locations the mount engine reads from.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Live mount table of the calling process.
pub static MOUNTINFO: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("MORTISE_MOUNTINFO")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/proc/self/mountinfo"))
});

/// Host cgroup hierarchy root.
pub static CGROUP_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("MORTISE_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/sys/fs/cgroup"))
});

/// Host sysfs root, bound into containers that have no network namespace.
pub static SYSFS_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("MORTISE_SYSFS_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/sys"))
});

/// Host paths used while assembling a container's mounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    /// Mount table consulted for ambient flags (default: /proc/self/mountinfo).
    pub mountinfo: PathBuf,
    /// Host cgroup hierarchy (default: /sys/fs/cgroup).
    pub cgroup_root: PathBuf,
    /// Host sysfs (default: /sys).
    pub sysfs_root: PathBuf,
    /// Empty character device used to mask files (default: /dev/null).
    pub dev_null: PathBuf,
}

impl HostPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different mount table file.
    #[must_use]
    pub fn with_mountinfo(mut self, path: impl Into<PathBuf>) -> Self {
        self.mountinfo = path.into();
        self
    }

    /// Use a different host cgroup hierarchy.
    #[must_use]
    pub fn with_cgroup_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.cgroup_root = path.into();
        self
    }
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            mountinfo: MOUNTINFO.clone(),
            cgroup_root: CGROUP_ROOT.clone(),
            sysfs_root: SYSFS_ROOT.clone(),
            dev_null: PathBuf::from("/dev/null"),
        }
    }
}
