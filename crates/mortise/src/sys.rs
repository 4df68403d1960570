#![allow(unsafe_code)]
//! Thin wrappers around the mount system calls.
//!
//! Classic `mount(2)` goes through libc so that source, filesystem type and
//! data can be passed as NULL where the kernel expects it. The new mount API
//! (`open_tree`, `move_mount`) comes from rustix; `mount_setattr(2)` is not
//! wrapped by rustix yet, so it is issued as a raw syscall.

use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use mortise_common::{MortiseError, MortiseResult};
use rustix::mount::{MountFlags, MoveMountFlags, OpenTreeFlags};

use crate::options::Propagation;

/// `MOUNT_ATTR_*` constants for `mount_setattr(2)`.
pub mod mount_attr {
    /// Read-only.
    pub const RDONLY: u64 = 0x0000_0001;
    /// Ignore set-uid bits.
    pub const NOSUID: u64 = 0x0000_0002;
    /// Ignore device nodes.
    pub const NODEV: u64 = 0x0000_0004;
    /// Deny execution.
    pub const NOEXEC: u64 = 0x0000_0008;
    /// Mask covering the atime mode.
    pub const ATIME: u64 = 0x0000_0070;
    /// Relative atime (the zero value of the atime field).
    pub const RELATIME: u64 = 0x0000_0000;
    /// Never update atime.
    pub const NOATIME: u64 = 0x0000_0010;
    /// Always update atime.
    pub const STRICTATIME: u64 = 0x0000_0020;
    /// Never update directory atime.
    pub const NODIRATIME: u64 = 0x0000_0080;
    /// Id-mapped mount.
    pub const IDMAP: u64 = 0x0010_0000;
}

/// Argument of `mount_setattr(2)`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MountAttr {
    /// Attributes to set.
    pub attr_set: u64,
    /// Attributes to clear.
    pub attr_clr: u64,
    /// Propagation type (`MS_SHARED`, ...) or 0.
    pub propagation: u64,
    /// User namespace descriptor for `MOUNT_ATTR_IDMAP`.
    pub userns_fd: u64,
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn optional_cstring(value: Option<&str>) -> io::Result<Option<CString>> {
    value
        .map(|v| CString::new(v).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e)))
        .transpose()
}

fn raw_mount(
    source: Option<&Path>,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> io::Result<()> {
    let source = source.map(cstring).transpose()?;
    let target = cstring(target)?;
    let fstype = optional_cstring(fstype)?;
    let data = optional_cstring(data.filter(|d| !d.is_empty()))?;

    let ret = unsafe {
        libc::mount(
            source.as_deref().map_or(std::ptr::null(), CStr::as_ptr),
            target.as_ptr(),
            fstype.as_deref().map_or(std::ptr::null(), CStr::as_ptr),
            flags,
            data.as_deref()
                .map_or(std::ptr::null(), |d| d.as_ptr().cast::<libc::c_void>()),
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn ms(flags: MountFlags) -> libc::c_ulong {
    libc::c_ulong::from(flags.bits())
}

/// Mount a fresh filesystem instance.
pub fn mount_fs(
    source: &Path,
    target: &Path,
    fstype: &str,
    flags: MountFlags,
    data: &str,
) -> MortiseResult<()> {
    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        fstype,
        ?flags,
        data,
        "Mounting filesystem"
    );
    raw_mount(Some(source), target, Some(fstype), ms(flags), Some(data))
        .map_err(|e| MortiseError::mount("mount", target, e))
}

/// Bind `source` onto `target`, optionally including submounts.
pub fn bind(source: &Path, target: &Path, recursive: bool) -> MortiseResult<()> {
    let mut flags = MountFlags::BIND;
    if recursive {
        flags |= MountFlags::REC;
    }
    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        recursive,
        "Creating bind mount"
    );
    raw_mount(Some(source), target, None, ms(flags), None)
        .map_err(|e| MortiseError::mount("bind mount", target, e))
}

/// Change the per-mount flags of an existing bind mount.
pub fn remount_bind(target: &Path, flags: MountFlags) -> MortiseResult<()> {
    tracing::debug!(target = %target.display(), ?flags, "Remounting bind mount");
    raw_mount(
        None,
        target,
        None,
        ms(flags | MountFlags::BIND) | libc::MS_REMOUNT,
        None,
    )
    .map_err(|e| MortiseError::mount("bind remount", target, e))
}

/// Change the superblock and per-mount flags of a mounted filesystem.
pub fn remount(target: &Path, flags: MountFlags, data: &str) -> MortiseResult<()> {
    tracing::debug!(target = %target.display(), ?flags, data, "Remounting filesystem");
    raw_mount(None, target, None, ms(flags) | libc::MS_REMOUNT, Some(data))
        .map_err(|e| MortiseError::mount("remount", target, e))
}

/// Set the propagation type of the mount at `target`.
pub fn set_propagation(target: &Path, propagation: Propagation) -> MortiseResult<()> {
    let mut flags = match propagation {
        Propagation::Private | Propagation::Rprivate => libc::MS_PRIVATE,
        Propagation::Shared | Propagation::Rshared => libc::MS_SHARED,
        Propagation::Slave | Propagation::Rslave => libc::MS_SLAVE,
        Propagation::Unbindable | Propagation::Runbindable => libc::MS_UNBINDABLE,
    };
    if propagation.is_recursive() {
        flags |= libc::MS_REC;
    }
    tracing::debug!(target = %target.display(), %propagation, "Setting mount propagation");
    raw_mount(None, target, None, flags, None)
        .map_err(|e| MortiseError::mount("set propagation", target, e))
}

/// Issue `mount_setattr(2)` on `path` relative to `dirfd`.
///
/// An empty `path` with `AT_EMPTY_PATH` in `flags` addresses `dirfd` itself.
pub fn mount_setattr(
    dirfd: Option<BorrowedFd<'_>>,
    path: &Path,
    flags: libc::c_uint,
    attr: &MountAttr,
) -> io::Result<()> {
    let path = cstring(path)?;
    let dirfd = dirfd.map_or(libc::AT_FDCWD, |fd| fd.as_raw_fd());
    let ret = unsafe {
        libc::syscall(
            libc::SYS_mount_setattr,
            dirfd,
            path.as_ptr(),
            flags,
            std::ptr::from_ref(attr),
            std::mem::size_of::<MountAttr>(),
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Create a detached copy of the mount tree at `source`.
pub fn clone_tree(source: &Path, recursive: bool) -> io::Result<OwnedFd> {
    let mut flags = OpenTreeFlags::OPEN_TREE_CLONE | OpenTreeFlags::OPEN_TREE_CLOEXEC;
    if recursive {
        flags |= OpenTreeFlags::AT_RECURSIVE;
    }
    Ok(rustix::mount::open_tree(rustix::fs::CWD, source, flags)?)
}

/// Attach a detached mount tree at `target`.
pub fn attach_tree(tree: &OwnedFd, target: &Path) -> io::Result<()> {
    rustix::mount::move_mount(
        tree.as_fd(),
        "",
        rustix::fs::CWD,
        target,
        MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
    )?;
    Ok(())
}

/// Make every mount under `target` read-only.
///
/// Falls back to a non-recursive read-only bind remount on kernels
/// without `mount_setattr(2)`.
pub fn make_readonly_recursive(target: &Path, ambient: MountFlags) -> MortiseResult<()> {
    let attr = MountAttr {
        attr_set: mount_attr::RDONLY,
        ..Default::default()
    };
    let flags = libc::AT_RECURSIVE as libc::c_uint;
    tracing::debug!(target = %target.display(), "Applying recursive read-only");
    match mount_setattr(None, target, flags, &attr) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOSYS) => {
            tracing::warn!(
                target = %target.display(),
                "mount_setattr unavailable, only the top mount is made read-only"
            );
            remount_bind(target, ambient | MountFlags::RDONLY)
        }
        Err(e) => Err(MortiseError::mount("recursive read-only", target, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_attr_layout_matches_kernel() {
        assert_eq!(std::mem::size_of::<MountAttr>(), 32);
    }

    #[test]
    fn mount_flags_fit_libc() {
        assert_eq!(ms(MountFlags::RDONLY), libc::MS_RDONLY);
        assert_eq!(ms(MountFlags::BIND | MountFlags::REC), libc::MS_BIND | libc::MS_REC);
        assert_eq!(ms(MountFlags::STRICTATIME), libc::MS_STRICTATIME);
    }

    #[test]
    fn interior_nul_is_rejected() {
        let err = cstring(Path::new("/bad\0path")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
