//! `proc`, `sysfs` and cgroup mounts.
//!
//! A fresh sysfs can only be mounted by a process that owns its network
//! namespace, and a fresh cgroup filesystem needs a cgroup namespace on most
//! hosts. When the kernel refuses, the host's tree is bound instead. The
//! cgroup destination always ends up read-only, whatever path was taken.

use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, symlink};
use std::path::Path;

use mortise_common::{HostPaths, MortiseResult};
use rustix::mount::MountFlags;
use serde::{Deserialize, Serialize};

use crate::inherit::inherit_flags;
use crate::mountinfo::MountTable;
use crate::namespace::NamespacePolicy;
use crate::sys;

/// Layout of the host cgroup hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupLayout {
    /// cgroup v2 mounted directly at the cgroup root.
    Unified,
    /// cgroup v1 controllers (possibly next to a v2 mount) under a tmpfs.
    Legacy,
}

/// How the cgroup destination is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CgroupStrategy {
    /// A new read-only `cgroup2` instance.
    Fresh,
    /// A read-only recursive bind of the host hierarchy.
    BindHost,
    /// A tmpfs holding read-only binds of each host controller.
    Synthetic,
}

/// Inspect the mount at `cgroup_root` to tell v2 from v1 hosts.
///
/// # Errors
///
/// Fails if the mount table cannot be read.
pub fn detect_cgroup_layout<T: MountTable + ?Sized>(
    table: &T,
    cgroup_root: &Path,
) -> MortiseResult<CgroupLayout> {
    let unified = table
        .enclosing(cgroup_root)?
        .is_some_and(|r| r.target == cgroup_root && r.fs_type == "cgroup2");
    Ok(if unified {
        CgroupLayout::Unified
    } else {
        CgroupLayout::Legacy
    })
}

/// Pick how to provide the cgroup filesystem.
///
/// The synthetic tree is only built for legacy hosts when the container has
/// its own network namespace. Without one, the host hierarchy is used
/// directly and no intermediate tmpfs is ever visible.
#[must_use]
pub fn choose_cgroup_strategy(layout: CgroupLayout, policy: &NamespacePolicy) -> CgroupStrategy {
    match (layout, policy.net) {
        (CgroupLayout::Unified, _) => CgroupStrategy::Fresh,
        (CgroupLayout::Legacy, true) => CgroupStrategy::Synthetic,
        (CgroupLayout::Legacy, false) => CgroupStrategy::BindHost,
    }
}

/// Mounts virtual filesystems for one container.
pub struct VirtualFs<'a> {
    policy: NamespacePolicy,
    host: &'a HostPaths,
    table: &'a dyn MountTable,
}

impl<'a> VirtualFs<'a> {
    /// Create a handler for a container with the given namespaces.
    pub fn new(policy: NamespacePolicy, host: &'a HostPaths, table: &'a dyn MountTable) -> Self {
        Self {
            policy,
            host,
            table,
        }
    }

    /// Mount a fresh procfs.
    ///
    /// # Errors
    ///
    /// Returns the failing mount call's error.
    pub fn mount_proc(&self, target: &Path, flags: MountFlags, data: &str) -> MortiseResult<()> {
        sys::mount_fs(Path::new("proc"), target, "proc", flags, data)
    }

    /// Mount sysfs, binding the host's when a fresh instance is refused.
    /// Returns whether the host tree was bound.
    ///
    /// # Errors
    ///
    /// Returns the failing mount call's error.
    pub fn mount_sysfs(&self, target: &Path, flags: MountFlags, data: &str) -> MortiseResult<bool> {
        if self.policy.net {
            match sys::mount_fs(Path::new("sysfs"), target, "sysfs", flags, data) {
                Ok(()) => return Ok(false),
                Err(e) if e.errno() == Some(libc::EPERM) => {
                    tracing::debug!(target = %target.display(), "Fresh sysfs refused, binding host /sys");
                }
                Err(e) => return Err(e),
            }
        }

        sys::bind(&self.host.sysfs_root, target, true)?;
        sys::remount_bind(target, self.remount_flags(target, flags)?)?;
        if flags.contains(MountFlags::RDONLY) {
            sys::make_readonly_recursive(target, flags)?;
        } else {
            let cgroup = target.join("fs/cgroup");
            if self.is_mount_point(&cgroup)? {
                sys::make_readonly_recursive(&cgroup, flags | MountFlags::RDONLY)?;
            }
        }
        Ok(true)
    }

    /// Mount the cgroup filesystem read-only. Returns the strategy that was
    /// finally used.
    ///
    /// # Errors
    ///
    /// Returns the failing mount call's error.
    pub fn mount_cgroup(
        &self,
        target: &Path,
        flags: MountFlags,
        data: &str,
    ) -> MortiseResult<CgroupStrategy> {
        let layout = detect_cgroup_layout(self.table, &self.host.cgroup_root)?;
        let strategy = choose_cgroup_strategy(layout, &self.policy);
        let flags = flags | MountFlags::RDONLY;
        tracing::debug!(target = %target.display(), ?layout, ?strategy, "Mounting cgroup filesystem");

        match strategy {
            CgroupStrategy::Fresh => {
                match sys::mount_fs(Path::new("cgroup2"), target, "cgroup2", flags, data) {
                    Ok(()) => {
                        sys::remount_bind(target, self.remount_flags(target, flags)?)?;
                        Ok(CgroupStrategy::Fresh)
                    }
                    Err(e) if matches!(e.errno(), Some(libc::EPERM | libc::EBUSY)) => {
                        tracing::debug!(
                            target = %target.display(),
                            error = %e,
                            "Fresh cgroup2 refused, binding host hierarchy"
                        );
                        self.bind_host_cgroup(target, flags)?;
                        Ok(CgroupStrategy::BindHost)
                    }
                    Err(e) => Err(e),
                }
            }
            CgroupStrategy::BindHost => {
                self.bind_host_cgroup(target, flags)?;
                Ok(CgroupStrategy::BindHost)
            }
            CgroupStrategy::Synthetic => {
                self.synthetic_cgroup(target, flags)?;
                Ok(CgroupStrategy::Synthetic)
            }
        }
    }

    fn bind_host_cgroup(&self, target: &Path, flags: MountFlags) -> MortiseResult<()> {
        sys::bind(&self.host.cgroup_root, target, true)?;
        sys::remount_bind(target, self.remount_flags(target, flags)?)?;
        sys::make_readonly_recursive(target, flags)
    }

    fn synthetic_cgroup(&self, target: &Path, flags: MountFlags) -> MortiseResult<()> {
        const DATA: &str = "mode=755";

        sys::mount_fs(
            Path::new("tmpfs"),
            target,
            "tmpfs",
            flags - MountFlags::RDONLY,
            DATA,
        )?;

        let mut builder = fs::DirBuilder::new();
        builder.mode(0o755);
        for entry in fs::read_dir(&self.host.cgroup_root)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let dest = target.join(entry.file_name());
            if file_type.is_symlink() {
                symlink(fs::read_link(entry.path())?, &dest)?;
            } else if file_type.is_dir() {
                match builder.create(&dest) {
                    Err(e) if e.kind() != io::ErrorKind::AlreadyExists => return Err(e.into()),
                    _ => {}
                }
                sys::bind(&entry.path(), &dest, false)?;
                sys::remount_bind(&dest, self.remount_flags(&dest, flags)?)?;
            }
        }

        sys::remount(target, flags, DATA)
    }

    fn remount_flags(&self, target: &Path, flags: MountFlags) -> MortiseResult<MountFlags> {
        inherit_flags(self.table, target, flags)
    }

    fn is_mount_point(&self, path: &Path) -> MortiseResult<bool> {
        Ok(self
            .table
            .enclosing(path)?
            .is_some_and(|record| record.target == path))
    }
}
