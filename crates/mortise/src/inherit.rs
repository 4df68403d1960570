//! Flag inheritance for remounts.
//!
//! A bind remount replaces every per-mount flag at once. Remounting a path
//! read-only with just `MS_RDONLY` would silently drop `nosuid` or `noexec`
//! enforced by the mount it sits on, and inside a user namespace the kernel
//! refuses to clear such locked flags at all. Remounts therefore start from
//! the flags of the enclosing live mount and add to them. Only an axis the
//! request names explicitly (`rw`, `suid`, `dev`, `exec`) is cleared.

use std::path::Path;

use mortise_common::MortiseResult;
use rustix::mount::MountFlags;

use crate::mountinfo::{LiveMountRecord, MountTable};

/// The atime mode bits; a mount carries exactly one mode.
pub const ATIME_FLAGS: MountFlags = MountFlags::NOATIME
    .union(MountFlags::RELATIME)
    .union(MountFlags::STRICTATIME);

/// Per-mount flags a live record enforces.
#[must_use]
pub fn ambient_flags(record: &LiveMountRecord) -> MountFlags {
    record
        .vfs_options
        .iter()
        .fold(MountFlags::empty(), |flags, option| {
            flags
                | match option.as_str() {
                    "ro" => MountFlags::RDONLY,
                    "nosuid" => MountFlags::NOSUID,
                    "nodev" => MountFlags::NODEV,
                    "noexec" => MountFlags::NOEXEC,
                    "noatime" => MountFlags::NOATIME,
                    "nodiratime" => MountFlags::NODIRATIME,
                    "relatime" => MountFlags::RELATIME,
                    _ => MountFlags::empty(),
                }
        })
}

/// Merge `demanded` on top of the flags of the mount enclosing `target`.
///
/// An explicitly demanded atime mode replaces the ambient one, since the
/// kernel keeps a single atime mode per mount. Everything else is a union.
///
/// # Errors
///
/// Fails if the mount table cannot be read.
pub fn inherit_flags<T: MountTable + ?Sized>(
    table: &T,
    target: &Path,
    demanded: MountFlags,
) -> MortiseResult<MountFlags> {
    let mut ambient = table
        .enclosing(target)?
        .map(|record| ambient_flags(&record))
        .unwrap_or_else(MountFlags::empty);
    if demanded.intersects(ATIME_FLAGS) {
        ambient.remove(ATIME_FLAGS);
    }
    let flags = ambient | demanded;
    tracing::trace!(target = %target.display(), ?ambient, ?demanded, "Inherited mount flags");
    Ok(flags)
}

/// Like [`inherit_flags`], but axes in `relaxed` are cleared afterwards.
///
/// A request that explicitly says `rw`, `suid`, `dev` or `exec` gets that
/// axis even when the mount it copies enforces the opposite. Inside a user
/// namespace the kernel may still refuse to clear a locked flag.
///
/// # Errors
///
/// Fails if the mount table cannot be read.
pub fn inherit_relaxed<T: MountTable + ?Sized>(
    table: &T,
    target: &Path,
    demanded: MountFlags,
    relaxed: MountFlags,
) -> MortiseResult<MountFlags> {
    let mut flags = inherit_flags(table, target, demanded)?;
    flags.remove(relaxed);
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use super::*;

    fn record(target: &str, vfs: &str) -> LiveMountRecord {
        LiveMountRecord {
            target: PathBuf::from(target),
            fs_type: "tmpfs".to_string(),
            source: "tmpfs".to_string(),
            vfs_options: vfs.split(',').map(str::to_string).collect(),
            fs_options: BTreeSet::new(),
        }
    }

    #[test]
    fn readonly_child_keeps_parent_restrictions() {
        let table = vec![
            record("/", "rw,relatime"),
            record("/rootfs/test", "rw,nosuid,nodev,noexec,relatime"),
        ];
        let flags = inherit_flags(&table, Path::new("/rootfs/test/world"), MountFlags::RDONLY)
            .unwrap();
        assert_eq!(
            flags,
            MountFlags::RDONLY
                | MountFlags::NOSUID
                | MountFlags::NODEV
                | MountFlags::NOEXEC
                | MountFlags::RELATIME
        );
    }

    #[test]
    fn demanded_atime_replaces_ambient() {
        let table = vec![record("/", "rw,noatime,nosuid")];
        let flags = inherit_flags(&table, Path::new("/x"), MountFlags::STRICTATIME).unwrap();
        assert_eq!(flags, MountFlags::STRICTATIME | MountFlags::NOSUID);
    }

    #[test]
    fn relaxed_axes_beat_ambient() {
        let table = vec![record("/src", "ro,nosuid,nodev,noexec,relatime")];
        let flags = inherit_relaxed(
            &table,
            Path::new("/src"),
            MountFlags::NOSUID,
            MountFlags::RDONLY | MountFlags::NOEXEC,
        )
        .unwrap();
        assert_eq!(flags, MountFlags::NOSUID | MountFlags::NODEV | MountFlags::RELATIME);
    }

    #[test]
    fn bind_remount_keeps_source_restrictions() {
        // After `bind,ro` the new mount is the nearest record and carries
        // the source's flags.
        let table = vec![
            record("/", "rw,relatime"),
            record("/rootfs/b", "rw,nosuid,nodev,noexec,relatime"),
        ];
        let flags =
            inherit_relaxed(&table, Path::new("/rootfs/b"), MountFlags::RDONLY, MountFlags::empty())
                .unwrap();
        assert!(flags.contains(MountFlags::RDONLY | MountFlags::NOSUID | MountFlags::NOEXEC));
    }

    #[test]
    fn no_enclosing_mount_means_demanded_only() {
        let table: Vec<LiveMountRecord> = Vec::new();
        let flags = inherit_flags(&table, Path::new("/x"), MountFlags::NODEV).unwrap();
        assert_eq!(flags, MountFlags::NODEV);
    }
}
