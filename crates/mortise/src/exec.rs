//! Plan execution.
//!
//! Operations run strictly in plan order and the first failure aborts the
//! whole setup. Nothing is rolled back; the caller discards the mount
//! namespace instead.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use mortise_common::{HostPaths, MortiseError, MortiseResult};
use rustix::mount::MountFlags;
use serde::Serialize;

use crate::idmap;
use crate::inherit::{ATIME_FLAGS, inherit_flags, inherit_relaxed};
use crate::mountinfo::MountTable;
use crate::namespace::NamespacePolicy;
use crate::options::{
    AtimeMode, DevMode, ExecMode, IdmapMode, ParsedOptions, Propagation, SuidMode, SyncMode,
};
use crate::plan::{MountKind, MountPlan, OverlayKind, ResolvedMountOp, SourceKind};
use crate::resolve::{NodeKind, RootResolver};
use crate::special::FileKind;
use crate::sys::{self, mount_attr};
use crate::vfs::{CgroupStrategy, VirtualFs};

/// Kernel flags requested by `options`, without bind semantics.
#[must_use]
pub fn mount_flags(options: &ParsedOptions) -> MountFlags {
    let mut flags = MountFlags::empty();
    if options.is_readonly() {
        flags |= MountFlags::RDONLY;
    }
    if options.suid == SuidMode::Nosuid {
        flags |= MountFlags::NOSUID;
    }
    if options.dev == DevMode::Nodev {
        flags |= MountFlags::NODEV;
    }
    if options.exec == ExecMode::Noexec {
        flags |= MountFlags::NOEXEC;
    }
    flags |= match options.atime {
        AtimeMode::Default => MountFlags::empty(),
        AtimeMode::Relatime => MountFlags::RELATIME,
        AtimeMode::Strictatime => MountFlags::STRICTATIME,
        AtimeMode::Noatime => MountFlags::NOATIME,
    };
    flags |= match options.sync {
        SyncMode::Default => MountFlags::empty(),
        SyncMode::Sync => MountFlags::SYNCHRONOUS,
        SyncMode::Dirsync => MountFlags::DIRSYNC,
    };
    flags
}

/// `MOUNT_ATTR_*` bits requested by `options`.
#[must_use]
pub fn mount_attr_bits(options: &ParsedOptions) -> u64 {
    let mut attr = 0;
    if options.is_readonly() {
        attr |= mount_attr::RDONLY;
    }
    if options.suid == SuidMode::Nosuid {
        attr |= mount_attr::NOSUID;
    }
    if options.dev == DevMode::Nodev {
        attr |= mount_attr::NODEV;
    }
    if options.exec == ExecMode::Noexec {
        attr |= mount_attr::NOEXEC;
    }
    attr | match options.atime {
        AtimeMode::Default => 0,
        AtimeMode::Relatime => mount_attr::RELATIME,
        AtimeMode::Strictatime => mount_attr::STRICTATIME,
        AtimeMode::Noatime => mount_attr::NOATIME,
    }
}

/// Kernel flags `options` explicitly relaxes (`rw`, `suid`, `dev`, `exec`).
#[must_use]
pub fn relaxed_flags(options: &ParsedOptions) -> MountFlags {
    let mut flags = MountFlags::empty();
    if options.access.is_writable() {
        flags |= MountFlags::RDONLY;
    }
    if options.suid == SuidMode::Suid {
        flags |= MountFlags::NOSUID;
    }
    if options.dev == DevMode::Dev {
        flags |= MountFlags::NODEV;
    }
    if options.exec == ExecMode::Exec {
        flags |= MountFlags::NOEXEC;
    }
    flags
}

/// `MOUNT_ATTR_*` bits to clear for `options`: the explicitly relaxed
/// axes, plus the whole atime field when an atime mode is requested.
#[must_use]
pub fn mount_attr_clear_bits(options: &ParsedOptions) -> u64 {
    let relaxed = relaxed_flags(options);
    let atime = if options.atime == AtimeMode::Default {
        0
    } else {
        mount_attr::ATIME
    };
    [
        (MountFlags::RDONLY, mount_attr::RDONLY),
        (MountFlags::NOSUID, mount_attr::NOSUID),
        (MountFlags::NODEV, mount_attr::NODEV),
        (MountFlags::NOEXEC, mount_attr::NOEXEC),
    ]
    .into_iter()
    .filter(|(flag, _)| relaxed.contains(*flag))
    .fold(atime, |attr, (_, bit)| attr | bit)
}

/// What happened to one planned operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "outcome")]
pub enum Outcome {
    /// A filesystem or bind was mounted.
    Mounted,
    /// An id-mapped bind was attached.
    IdMapped,
    /// The destination was created as a symlink.
    Symlinked,
    /// sysfs came from the host tree.
    HostSysfs,
    /// The cgroup filesystem was provided with this strategy.
    Cgroup {
        /// Strategy used.
        strategy: CgroupStrategy,
    },
    /// A path was remounted read-only.
    Readonly,
    /// A path was masked.
    Masked,
    /// Nothing to do; the path does not exist.
    Skipped,
}

/// One line of an [`ExecReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecEntry {
    /// Destination inside the container.
    pub target: PathBuf,
    /// Result.
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Summary of an executed plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecReport {
    /// Entries in execution order.
    pub entries: Vec<ExecEntry>,
}

impl ExecReport {
    /// Number of entries with the given outcome.
    #[must_use]
    pub fn count(&self, outcome: &Outcome) -> usize {
        self.entries.iter().filter(|e| &e.outcome == outcome).count()
    }
}

/// Applies a [`MountPlan`] under a rootfs.
pub struct MountExecutor<'a> {
    resolver: RootResolver,
    policy: NamespacePolicy,
    host: &'a HostPaths,
    table: &'a dyn MountTable,
    rootfs_propagation: Propagation,
    readonly_rootfs: bool,
}

impl<'a> MountExecutor<'a> {
    /// Create an executor.
    pub fn new(
        rootfs: impl Into<PathBuf>,
        policy: NamespacePolicy,
        host: &'a HostPaths,
        table: &'a dyn MountTable,
    ) -> Self {
        Self {
            resolver: RootResolver::new(rootfs),
            policy,
            host,
            table,
            rootfs_propagation: Propagation::Rprivate,
            readonly_rootfs: false,
        }
    }

    /// Remount the rootfs itself read-only once every mount is in place.
    /// Mounts beneath it keep their own access mode.
    #[must_use]
    pub fn with_readonly_rootfs(mut self, readonly: bool) -> Self {
        self.readonly_rootfs = readonly;
        self
    }

    /// Propagation applied to the rootfs before any mount.
    #[must_use]
    pub fn with_rootfs_propagation(mut self, propagation: Propagation) -> Self {
        self.rootfs_propagation = propagation;
        self
    }

    /// Run every operation of `plan` in order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing operation and returns its error.
    pub fn execute(&self, plan: &MountPlan) -> MortiseResult<ExecReport> {
        self.prepare_rootfs()?;

        let mut report = ExecReport::default();
        for op in plan.iter() {
            let outcome = self.apply(op)?;
            tracing::debug!(target = %op.target.display(), ?outcome, "Applied mount operation");
            report.entries.push(ExecEntry {
                target: op.target.clone(),
                outcome,
            });
        }

        if self.readonly_rootfs {
            let root = self.resolver.root();
            sys::remount_bind(root, inherit_flags(self.table, root, MountFlags::RDONLY)?)?;
            report.entries.push(ExecEntry {
                target: PathBuf::from("/"),
                outcome: Outcome::Readonly,
            });
        }

        tracing::info!(
            rootfs = %self.resolver.root().display(),
            operations = report.entries.len(),
            "Mount setup complete"
        );
        Ok(report)
    }

    fn prepare_rootfs(&self) -> MortiseResult<()> {
        let root = self.resolver.root();
        let is_mount_point = self
            .table
            .enclosing(root)?
            .is_some_and(|record| record.target == root);
        if !is_mount_point {
            sys::bind(root, root, true)?;
        }
        sys::set_propagation(root, self.rootfs_propagation)
    }

    fn apply(&self, op: &ResolvedMountOp) -> MortiseResult<Outcome> {
        match op.overlay {
            Some(OverlayKind::Readonly) => return self.readonly_overlay(op),
            Some(OverlayKind::Masked) => return self.masked_overlay(op),
            None => {}
        }

        let outcome = match &op.source {
            SourceKind::Symlink { link } => return self.materialize_symlink(op, link),
            SourceKind::Path { path, file_kind } => self.bind(op, path, *file_kind)?,
            SourceKind::Virtual { name } => self.mount_virtual(op, name)?,
            SourceKind::Target => {
                return Err(MortiseError::config(format!(
                    "mount of {} has no source",
                    op.target.display()
                )));
            }
        };

        if let Some(propagation) = op.options.propagation {
            let target = self.resolver.resolve(&op.target)?;
            sys::set_propagation(target.host_path(), propagation)?;
        }
        Ok(outcome)
    }

    fn materialize_symlink(&self, op: &ResolvedMountOp, link: &Path) -> MortiseResult<Outcome> {
        let resolved = self.resolver.prepare(&op.target, NodeKind::ParentOnly)?;
        let dest = resolved.host_path();
        tracing::debug!(target = %dest.display(), link = %link.display(), "Creating symlink");
        match symlink(link, dest) {
            Ok(()) => Ok(Outcome::Symlinked),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if fs::read_link(dest).is_ok_and(|existing| existing == link) {
                    Ok(Outcome::Symlinked)
                } else {
                    Err(MortiseError::mount("symlink", dest, e))
                }
            }
            Err(e) => Err(MortiseError::mount("symlink", dest, e)),
        }
    }

    fn bind(&self, op: &ResolvedMountOp, source: &Path, kind: FileKind) -> MortiseResult<Outcome> {
        let resolved = self.resolver.prepare(&op.target, kind.mount_point())?;
        let target = resolved.host_path();
        let pinned = self.resolver.pin(&resolved)?;
        let options = &op.options;
        let flags = mount_flags(options);

        if let Some(mapping) = &op.idmap {
            let recursive = options.idmap == IdmapMode::Ridmap || options.is_recursive_bind();
            idmap::idmapped_bind(
                source,
                pinned.path(),
                recursive,
                mapping,
                mount_attr_bits(options),
                mount_attr_clear_bits(options),
            )?;
            if options.is_recursive_readonly() {
                sys::make_readonly_recursive(target, flags)?;
            }
            return Ok(Outcome::IdMapped);
        }

        sys::bind(source, pinned.path(), options.is_recursive_bind())?;
        if options.needs_remount() {
            let flags = inherit_relaxed(self.table, target, flags, relaxed_flags(options))?;
            sys::remount_bind(target, flags)?;
        }
        if options.is_recursive_readonly() {
            sys::make_readonly_recursive(target, flags)?;
        }
        Ok(Outcome::Mounted)
    }

    fn mount_virtual(&self, op: &ResolvedMountOp, name: &str) -> MortiseResult<Outcome> {
        let resolved = self.resolver.prepare(&op.target, NodeKind::Directory)?;
        let target = resolved.host_path();
        let options = &op.options;
        let flags = mount_flags(options);
        let data = options.data_string();
        let vfs = VirtualFs::new(self.policy, self.host, self.table);

        let outcome = match &op.request.kind {
            MountKind::Proc => {
                vfs.mount_proc(target, flags, &data)?;
                Outcome::Mounted
            }
            MountKind::Sysfs => {
                if vfs.mount_sysfs(target, flags, &data)? {
                    Outcome::HostSysfs
                } else {
                    Outcome::Mounted
                }
            }
            MountKind::Cgroup => Outcome::Cgroup {
                strategy: vfs.mount_cgroup(target, flags, &data)?,
            },
            kind => {
                let fs_type = kind.fs_type().unwrap_or(name);
                let pinned = self.resolver.pin(&resolved)?;
                sys::mount_fs(Path::new(name), pinned.path(), fs_type, flags, &data)?;
                Outcome::Mounted
            }
        };

        if options.is_recursive_readonly() {
            sys::make_readonly_recursive(target, flags)?;
        }
        Ok(outcome)
    }

    fn readonly_overlay(&self, op: &ResolvedMountOp) -> MortiseResult<Outcome> {
        let resolved = self.resolver.resolve(&op.target)?;
        if !resolved.exists() {
            tracing::debug!(target = %op.target.display(), "Read-only path does not exist, skipping");
            return Ok(Outcome::Skipped);
        }
        let target = resolved.host_path();
        let pinned = self.resolver.pin(&resolved)?;
        sys::bind(pinned.path(), pinned.path(), true)?;
        let flags = inherit_flags(self.table, target, MountFlags::RDONLY)?;
        sys::remount_bind(target, flags)?;
        Ok(Outcome::Readonly)
    }

    fn masked_overlay(&self, op: &ResolvedMountOp) -> MortiseResult<Outcome> {
        let resolved = self.resolver.resolve(&op.target)?;
        if !resolved.exists() {
            tracing::debug!(target = %op.target.display(), "Masked path does not exist, skipping");
            return Ok(Outcome::Skipped);
        }
        let target = resolved.host_path();
        let pinned = self.resolver.pin(&resolved)?;
        let parent = inherit_flags(self.table, target, MountFlags::RDONLY)?;
        if fs::metadata(pinned.path())?.is_dir() {
            sys::mount_fs(Path::new("tmpfs"), pinned.path(), "tmpfs", parent, "size=0k")?;
        } else {
            // The bind carries the flags of the mount /dev/null lives on,
            // which a user namespace may lock. Keep those and add the
            // parent's restrictions, but leave the atime mode alone.
            sys::bind(&self.host.dev_null, pinned.path(), false)?;
            let flags = inherit_flags(self.table, target, parent - ATIME_FLAGS)?;
            sys::remount_bind(target, flags)?;
        }
        Ok(Outcome::Masked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(tokens: &[&str]) -> ParsedOptions {
        ParsedOptions::parse(tokens).unwrap()
    }

    #[test]
    fn flags_follow_each_axis() {
        assert_eq!(
            mount_flags(&parse(&["ro", "nosuid", "nodev", "noexec", "relatime"])),
            MountFlags::RDONLY
                | MountFlags::NOSUID
                | MountFlags::NODEV
                | MountFlags::NOEXEC
                | MountFlags::RELATIME
        );
        assert_eq!(mount_flags(&parse(&["suid", "dev", "exec", "rw"])), MountFlags::empty());
        assert_eq!(mount_flags(&parse(&["sync"])), MountFlags::SYNCHRONOUS);
        assert_eq!(mount_flags(&parse(&["dirsync"])), MountFlags::DIRSYNC);
        assert_eq!(mount_flags(&parse(&["strictatime"])), MountFlags::STRICTATIME);
        assert_eq!(mount_flags(&parse(&["rro"])), MountFlags::RDONLY);
        assert!(!mount_flags(&parse(&["rbind"])).contains(MountFlags::BIND));
    }

    #[test]
    fn mount_attr_bits_follow_options() {
        assert_eq!(
            mount_attr_bits(&parse(&["ro", "nosuid", "noatime"])),
            mount_attr::RDONLY | mount_attr::NOSUID | mount_attr::NOATIME
        );
        assert_eq!(mount_attr_bits(&parse(&["bind"])), 0);
    }

    #[test]
    fn relaxed_axes_are_only_explicit_ones() {
        assert_eq!(relaxed_flags(&parse(&["bind", "ro"])), MountFlags::empty());
        assert_eq!(
            relaxed_flags(&parse(&["rro", "rw", "suid", "exec"])),
            MountFlags::RDONLY | MountFlags::NOSUID | MountFlags::NOEXEC
        );
        assert_eq!(relaxed_flags(&parse(&["dev", "nodev"])), MountFlags::empty());
        assert_eq!(
            mount_attr_clear_bits(&parse(&["rrw", "dev"])),
            mount_attr::RDONLY | mount_attr::NODEV
        );
        assert_eq!(mount_attr_clear_bits(&parse(&["relatime"])), mount_attr::ATIME);
    }

    #[test]
    fn report_counts_outcomes() {
        let report = ExecReport {
            entries: vec![
                ExecEntry {
                    target: PathBuf::from("/a"),
                    outcome: Outcome::Mounted,
                },
                ExecEntry {
                    target: PathBuf::from("/b"),
                    outcome: Outcome::Skipped,
                },
                ExecEntry {
                    target: PathBuf::from("/c"),
                    outcome: Outcome::Mounted,
                },
            ],
        };
        assert_eq!(report.count(&Outcome::Mounted), 2);
        let json = serde_json::to_string(&report.entries[1]).unwrap();
        assert_eq!(json, r#"{"target":"/b","outcome":"skipped"}"#);
    }
}
