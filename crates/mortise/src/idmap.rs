#![allow(unsafe_code)]
//! Id-mapped mounts.
//!
//! An id-mapped mount presents on-disk ownership through a user namespace's
//! mapping without touching the files. The kernel takes that mapping from a
//! user namespace descriptor, so for every id-mapped bind a short-lived
//! child process unshares a user namespace, the parent writes the mapping
//! into it, and its `/proc/<pid>/ns/user` descriptor is attached to a
//! detached copy of the source tree with `mount_setattr(2)`.

use std::fmt;
use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;

use mortise_common::{MortiseError, MortiseResult};
use rustix::pipe::PipeFlags;
use serde::{Deserialize, Serialize};

use crate::sys::{self, MountAttr, mount_attr};

/// One contiguous range of an identity mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdRange {
    /// First id of the range as seen from inside (on disk, for mounts).
    pub container_id: u32,
    /// First id of the range as presented on the host side.
    pub host_id: u32,
    /// Number of ids in the range.
    pub size: u32,
}

impl IdRange {
    /// Create a new range.
    #[must_use]
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    fn container_span(&self) -> (u64, u64) {
        let start = u64::from(self.container_id);
        (start, start + u64::from(self.size))
    }

    fn host_span(&self) -> (u64, u64) {
        let start = u64::from(self.host_id);
        (start, start + u64::from(self.size))
    }
}

impl From<mortise_oci::runtime::IdMapping> for IdRange {
    fn from(m: mortise_oci::runtime::IdMapping) -> Self {
        Self::new(m.container_id, m.host_id, m.size)
    }
}

/// An ordered, validated list of id ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityMapping {
    ranges: Vec<IdRange>,
}

impl IdentityMapping {
    /// Build a mapping, rejecting malformed or overlapping ranges.
    ///
    /// # Errors
    ///
    /// Returns [`MortiseError::InvalidIdMapping`] if a range is empty, runs
    /// past the 32-bit id space, or overlaps another range on either side.
    pub fn new(ranges: Vec<IdRange>) -> MortiseResult<Self> {
        for (i, range) in ranges.iter().enumerate() {
            if range.size == 0 {
                return Err(invalid(format!("range {i} has size 0")));
            }
            let limit = u64::from(u32::MAX) + 1;
            if range.container_span().1 > limit || range.host_span().1 > limit {
                return Err(invalid(format!("range {i} exceeds the 32-bit id space")));
            }
            for (j, other) in ranges.iter().enumerate().take(i) {
                if overlaps(range.container_span(), other.container_span()) {
                    return Err(invalid(format!(
                        "ranges {j} and {i} overlap on the container side"
                    )));
                }
                if overlaps(range.host_span(), other.host_span()) {
                    return Err(invalid(format!("ranges {j} and {i} overlap on the host side")));
                }
            }
        }
        Ok(Self { ranges })
    }

    /// Build a mapping from OCI `uidMappings`/`gidMappings` entries.
    /// Returns `None` for an empty list.
    ///
    /// # Errors
    ///
    /// Same as [`IdentityMapping::new`].
    pub fn from_oci(mappings: &[mortise_oci::runtime::IdMapping]) -> MortiseResult<Option<Self>> {
        if mappings.is_empty() {
            return Ok(None);
        }
        Self::new(mappings.iter().copied().map(IdRange::from).collect()).map(Some)
    }

    /// The ranges, in declaration order.
    #[must_use]
    pub fn ranges(&self) -> &[IdRange] {
        &self.ranges
    }

    /// Whether the mapping has no ranges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Host id presented for an inside id, if mapped.
    #[must_use]
    pub fn map_to_host(&self, id: u32) -> Option<u32> {
        self.ranges.iter().find_map(|r| {
            let offset = id.checked_sub(r.container_id)?;
            (offset < r.size).then(|| r.host_id + offset)
        })
    }

    /// Lines for the helper namespace's `uid_map`/`gid_map`.
    ///
    /// An id-mapped mount treats an on-disk id as an id inside the helper
    /// namespace and presents the id it maps to outside, so on-disk
    /// `container_id + k` shows up as `host_id + k`.
    fn helper_map(&self) -> String {
        self.ranges
            .iter()
            .map(|r| format!("{} {} {}\n", r.container_id, r.host_id, r.size))
            .collect()
    }
}

fn overlaps(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

fn invalid(message: String) -> MortiseError {
    MortiseError::InvalidIdMapping { message }
}

/// The uid and gid mappings used for one id-mapped mount.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountIdMapping {
    /// Uid mapping.
    pub uid: IdentityMapping,
    /// Gid mapping.
    pub gid: IdentityMapping,
}

impl MountIdMapping {
    /// Pick the mapping for a mount: per-mount tables where given, the
    /// container's own otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`MortiseError::InvalidIdMapping`] when either axis ends up
    /// without any range; a half-resolved mapping is never used.
    pub fn select(
        mount_uid: Option<&IdentityMapping>,
        mount_gid: Option<&IdentityMapping>,
        container_uid: &IdentityMapping,
        container_gid: &IdentityMapping,
    ) -> MortiseResult<Self> {
        let uid = mount_uid.unwrap_or(container_uid).clone();
        let gid = mount_gid.unwrap_or(container_gid).clone();
        if uid.is_empty() || gid.is_empty() {
            return Err(invalid(
                "id-mapped mount needs uid and gid mappings, from the mount or the container"
                    .to_string(),
            ));
        }
        Ok(Self { uid, gid })
    }
}

/// Result of probing for id-mapped mount support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdmapSupport {
    /// The kernel and filesystem accept id-mapped mounts.
    Supported,
    /// The kernel or filesystem rejects them; callers should skip.
    Unsupported,
    /// The probe could not decide (e.g. missing privileges).
    Indeterminate,
}

impl fmt::Display for IdmapSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdmapSupport::Supported => write!(f, "supported"),
            IdmapSupport::Unsupported => write!(f, "unsupported"),
            IdmapSupport::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

fn classify(err: &io::Error) -> IdmapSupport {
    match err.raw_os_error() {
        Some(libc::ENOSYS | libc::EINVAL | libc::EOPNOTSUPP | libc::EPERM) => {
            IdmapSupport::Unsupported
        }
        _ => IdmapSupport::Indeterminate,
    }
}

/// Probe whether an id-mapped mount of `path` would work on this host.
#[must_use]
pub fn probe_idmapped_mounts(path: &Path) -> IdmapSupport {
    use caps::{CapSet, Capability};

    match caps::has_cap(None, CapSet::Effective, Capability::CAP_SYS_ADMIN) {
        Ok(true) => {}
        Ok(false) => return IdmapSupport::Indeterminate,
        Err(e) => {
            tracing::debug!(error = %e, "Cannot read capabilities");
            return IdmapSupport::Indeterminate;
        }
    }

    let probe = IdentityMapping {
        ranges: vec![IdRange::new(0, 0, 1)],
    };
    let userns = match MappedUserNamespace::create(&probe, &probe) {
        Ok(ns) => ns,
        Err(e) => {
            tracing::debug!(error = %e, "Cannot create probe user namespace");
            return IdmapSupport::Indeterminate;
        }
    };

    let tree = match sys::clone_tree(path, false) {
        Ok(tree) => tree,
        Err(e) => return classify(&e),
    };
    let attr = MountAttr {
        attr_set: mount_attr::IDMAP,
        userns_fd: userns_fd_arg(userns.as_fd()),
        ..Default::default()
    };
    let support = match sys::mount_setattr(
        Some(tree.as_fd()),
        Path::new(""),
        libc::AT_EMPTY_PATH as libc::c_uint,
        &attr,
    ) {
        Ok(()) => IdmapSupport::Supported,
        Err(e) => classify(&e),
    };
    tracing::debug!(path = %path.display(), %support, "Probed id-mapped mounts");
    support
}

/// Kernels older than 3.19 have no `setgroups` file, and need no denial.
fn deny_setgroups(pid: libc::pid_t) -> MortiseResult<()> {
    match fs::write(format!("/proc/{pid}/setgroups"), "deny") {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            Err(invalid(format!("failed to write setgroups: {e}")))
        }
        _ => Ok(()),
    }
}

fn userns_fd_arg(fd: BorrowedFd<'_>) -> u64 {
    u64::try_from(fd.as_raw_fd()).unwrap_or_default()
}

/// A user namespace owned by a helper process, carrying a fixed mapping.
#[derive(Debug)]
pub struct MappedUserNamespace {
    fd: OwnedFd,
}

/// Reaps the helper child however `create` exits.
struct HelperChild {
    pid: libc::pid_t,
    release: Option<OwnedFd>,
}

impl Drop for HelperChild {
    fn drop(&mut self) {
        self.release.take();
        let mut status = 0;
        unsafe {
            libc::waitpid(self.pid, &mut status, 0);
        }
    }
}

impl MappedUserNamespace {
    /// Create a user namespace with the given uid and gid mappings.
    ///
    /// # Errors
    ///
    /// Fails if the helper cannot be forked, cannot unshare, or the mapping
    /// is refused by the kernel.
    pub fn create(uid: &IdentityMapping, gid: &IdentityMapping) -> MortiseResult<Self> {
        let (ready_read, ready_write) =
            rustix::pipe::pipe_with(PipeFlags::CLOEXEC).map_err(io::Error::from)?;
        let (release_read, release_write) =
            rustix::pipe::pipe_with(PipeFlags::CLOEXEC).map_err(io::Error::from)?;

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if pid == 0 {
            // Only async-signal-safe calls until _exit.
            unsafe {
                libc::close(ready_read.as_raw_fd());
                libc::close(release_write.as_raw_fd());
                let status = [u8::from(libc::unshare(libc::CLONE_NEWUSER) == 0)];
                libc::write(ready_write.as_raw_fd(), status.as_ptr().cast(), 1);
                let mut buf = [0u8; 1];
                libc::read(release_read.as_raw_fd(), buf.as_mut_ptr().cast(), 1);
                libc::_exit(0);
            }
        }

        drop(ready_write);
        drop(release_read);
        let _child = HelperChild {
            pid,
            release: Some(release_write),
        };

        let mut status = [0u8; 1];
        let n = rustix::io::read(&ready_read, &mut status[..]).map_err(io::Error::from)?;
        if n != 1 || status[0] != 1 {
            return Err(MortiseError::Unsupported {
                feature: "user namespaces".to_string(),
            });
        }

        fs::write(format!("/proc/{pid}/uid_map"), uid.helper_map())
            .map_err(|e| invalid(format!("failed to write uid_map: {e}")))?;
        deny_setgroups(pid)?;
        fs::write(format!("/proc/{pid}/gid_map"), gid.helper_map())
            .map_err(|e| invalid(format!("failed to write gid_map: {e}")))?;

        let fd = OwnedFd::from(fs::File::open(format!("/proc/{pid}/ns/user"))?);
        tracing::debug!(pid, "Created id-mapping user namespace");
        Ok(Self { fd })
    }
}

impl AsFd for MappedUserNamespace {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Bind `source` onto `target` through an id-mapped, detached mount tree.
///
/// `attr_set` carries additional `MOUNT_ATTR_*` flags (read-only, nosuid,
/// ...) applied in the same call, and `attr_clr` the flags to drop from
/// the cloned tree. Anything in neither is kept from the source mount. A
/// new atime mode needs `MOUNT_ATTR__ATIME` in `attr_clr`. With `recursive` (`ridmap`, or `rbind`
/// combined with `idmap`), submounts of the source are cloned and mapped
/// too; without submounts this behaves like the non-recursive case.
///
/// # Errors
///
/// Returns [`MortiseError::Mount`] carrying the failing call's errno.
pub fn idmapped_bind(
    source: &Path,
    target: &Path,
    recursive: bool,
    mapping: &MountIdMapping,
    attr_set: u64,
    attr_clr: u64,
) -> MortiseResult<()> {
    let userns = MappedUserNamespace::create(&mapping.uid, &mapping.gid)?;

    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        recursive,
        "Creating id-mapped bind mount"
    );
    let tree = sys::clone_tree(source, recursive)
        .map_err(|e| MortiseError::mount("open_tree", source, e))?;

    let mut flags = libc::AT_EMPTY_PATH as libc::c_uint;
    if recursive {
        flags |= libc::AT_RECURSIVE as libc::c_uint;
    }
    let attr = MountAttr {
        attr_set: mount_attr::IDMAP | attr_set,
        attr_clr,
        userns_fd: userns_fd_arg(userns.as_fd()),
        ..Default::default()
    };
    sys::mount_setattr(Some(tree.as_fd()), Path::new(""), flags, &attr)
        .map_err(|e| MortiseError::mount("mount_setattr idmap", target, e))?;

    sys::attach_tree(&tree, target).map_err(|e| MortiseError::mount("move_mount", target, e))
}
