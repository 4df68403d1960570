//! Destination path resolution confined to the container root.
//!
//! Resolution happens in two steps. [`normalize_destination`] is purely
//! lexical and runs while planning. [`RootResolver`] walks the normalized
//! path through the live rootfs right before a mount, following symlinks
//! as if the rootfs were `/`, and refuses anything that would climb out of
//! it.

use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};

use mortise_common::{MortiseError, MortiseResult};
use rustix::fs::{Mode, OFlags, ResolveFlags};
use rustix::io::Errno;

/// Maximum number of symlinks followed while resolving one path.
pub const MAX_SYMLINK_HOPS: usize = 40;

/// Mode of directories created on the way to a mount point.
const MOUNT_DIR_MODE: u32 = 0o755;

/// Mode of empty files created as mount points for non-directory sources.
const MOUNT_FILE_MODE: u32 = 0o644;

/// Normalize a container destination into `/a/b/c` form.
///
/// Repeated separators and `.` components are dropped and `..` is applied
/// lexically. Relative destinations are taken relative to the container
/// root.
///
/// # Errors
///
/// Returns [`MortiseError::PathEscape`] when `..` would climb above `/`.
pub fn normalize_destination(destination: &str) -> MortiseResult<PathBuf> {
    let mut parts: Vec<&str> = Vec::new();
    for part in destination.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(MortiseError::PathEscape {
                        path: destination.to_string(),
                        reason: "`..` climbs above the container root".to_string(),
                    });
                }
            }
            name => parts.push(name),
        }
    }

    let mut path = PathBuf::from("/");
    path.extend(parts);
    Ok(path)
}

/// Number of components below `/` in a normalized path.
#[must_use]
pub fn path_depth(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

/// What to create at the end of a missing mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A directory (directory sources and virtual filesystems).
    Directory,
    /// An empty regular file (files, devices, FIFOs, sockets).
    File,
    /// Nothing; only the parent directories are created.
    ParentOnly,
}

/// Result of resolving a container path under the rootfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    host_path: PathBuf,
    components: Vec<OsString>,
    first_missing: Option<usize>,
}

impl ResolvedTarget {
    /// Host-side path of the resolved target.
    #[must_use]
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    /// Resolved path as seen from inside the container.
    #[must_use]
    pub fn container_path(&self) -> PathBuf {
        let mut path = PathBuf::from("/");
        path.extend(&self.components);
        path
    }

    /// Whether every component of the target already exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.first_missing.is_none()
    }
}

/// A mount point held open between resolving it and mounting on it.
///
/// Mounting through [`PinnedTarget::path`] reaches the inode that was
/// resolved, even if a path component is swapped for a symlink meanwhile.
#[derive(Debug)]
pub struct PinnedTarget {
    path: PathBuf,
    fd: Option<OwnedFd>,
}

impl PinnedTarget {
    /// Path to pass as the mount target: a `/proc/thread-self/fd` link,
    /// or the plain host path on kernels without `openat2(2)`.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the target is held by descriptor.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.fd.is_some()
    }
}

/// Resolves container paths against a rootfs without ever leaving it.
#[derive(Debug, Clone)]
pub struct RootResolver {
    root: PathBuf,
}

impl RootResolver {
    /// Create a resolver for the given rootfs.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The rootfs this resolver is confined to.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `target`, following every symlink including the last one.
    ///
    /// # Errors
    ///
    /// Returns [`MortiseError::PathEscape`] if a symlink climbs above the
    /// root or more than [`MAX_SYMLINK_HOPS`] links are followed.
    pub fn resolve(&self, target: &Path) -> MortiseResult<ResolvedTarget> {
        self.resolve_with(target, true)
    }

    /// Resolve `target` without following a symlink in its final component.
    ///
    /// # Errors
    ///
    /// Same as [`RootResolver::resolve`].
    pub fn resolve_parent(&self, target: &Path) -> MortiseResult<ResolvedTarget> {
        self.resolve_with(target, false)
    }

    fn resolve_with(&self, target: &Path, follow_final: bool) -> MortiseResult<ResolvedTarget> {
        let mut pending: VecDeque<OsString> = lexical_components(target).collect();
        let mut resolved: Vec<OsString> = Vec::new();
        let mut first_missing: Option<usize> = None;
        let mut hops = 0;

        while let Some(component) = pending.pop_front() {
            if component == ".." {
                if resolved.pop().is_none() {
                    return Err(escape(target, "symlink climbs above the container root"));
                }
                if first_missing.is_some_and(|i| resolved.len() <= i) {
                    first_missing = None;
                }
                continue;
            }

            if first_missing.is_some() {
                resolved.push(component);
                continue;
            }

            let candidate = self.host_path(&resolved).join(&component);
            let is_final = pending.is_empty();
            match fs::symlink_metadata(&candidate) {
                Ok(meta) if meta.file_type().is_symlink() && (follow_final || !is_final) => {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(escape(target, "too many levels of symbolic links"));
                    }
                    let link = fs::read_link(&candidate)?;
                    tracing::trace!(
                        path = %candidate.display(),
                        link = %link.display(),
                        "Following symlink inside rootfs"
                    );
                    if link.is_absolute() {
                        resolved.clear();
                    }
                    let mut expanded: VecDeque<OsString> = lexical_components(&link).collect();
                    expanded.extend(pending.drain(..));
                    pending = expanded;
                }
                Ok(meta) => {
                    if !is_final && !meta.is_dir() && !meta.file_type().is_symlink() {
                        return Err(MortiseError::Io(io::Error::from_raw_os_error(
                            libc::ENOTDIR,
                        )));
                    }
                    resolved.push(component);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    first_missing = Some(resolved.len());
                    resolved.push(component);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(ResolvedTarget {
            host_path: self.host_path(&resolved),
            components: resolved,
            first_missing,
        })
    }

    /// Resolve `target` and create whatever is missing of it.
    ///
    /// Intermediate directories get mode `0755`; the final node is created
    /// according to `node`. Modes are never copied from a bind source.
    ///
    /// # Errors
    ///
    /// Propagates resolution errors and filesystem errors from creation.
    pub fn prepare(&self, target: &Path, node: NodeKind) -> MortiseResult<ResolvedTarget> {
        let resolved = match node {
            NodeKind::ParentOnly => self.resolve_parent(target)?,
            _ => self.resolve(target)?,
        };
        let Some(first_missing) = resolved.first_missing else {
            return Ok(resolved);
        };

        let last = resolved.components.len().saturating_sub(1);
        let mut path = self.host_path(&resolved.components[..first_missing]);
        let mut builder = fs::DirBuilder::new();
        builder.mode(MOUNT_DIR_MODE);

        for (index, component) in resolved.components.iter().enumerate().skip(first_missing) {
            path.push(component);
            if index < last {
                create_dir(&builder, &path)?;
                continue;
            }
            match node {
                NodeKind::Directory => create_dir(&builder, &path)?,
                NodeKind::File => {
                    fs::OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(false)
                        .mode(MOUNT_FILE_MODE)
                        .open(&path)?;
                }
                NodeKind::ParentOnly => {}
            }
        }

        tracing::debug!(target = %resolved.host_path.display(), ?node, "Created mount point");
        Ok(resolved)
    }

    /// Open an already resolved target by descriptor, confined to the
    /// root. The resolved path contains no symlinks, so any symlink found
    /// now was planted after resolution and fails the call.
    ///
    /// # Errors
    ///
    /// Returns [`MortiseError::PathEscape`] if the path changed since it was
    /// resolved, or the `openat2` error otherwise. Kernels without
    /// `openat2(2)` get the plain host path instead.
    pub fn pin(&self, resolved: &ResolvedTarget) -> MortiseResult<PinnedTarget> {
        let container = resolved.container_path();
        let root = rustix::fs::open(
            &self.root,
            OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| MortiseError::mount("open rootfs", &self.root, io::Error::from(e)))?;

        match rustix::fs::openat2(
            &root,
            &container,
            OFlags::PATH | OFlags::CLOEXEC,
            Mode::empty(),
            ResolveFlags::IN_ROOT | ResolveFlags::NO_SYMLINKS | ResolveFlags::NO_MAGICLINKS,
        ) {
            Ok(fd) => Ok(PinnedTarget {
                path: PathBuf::from(format!("/proc/thread-self/fd/{}", fd.as_raw_fd())),
                fd: Some(fd),
            }),
            Err(Errno::NOSYS) => {
                tracing::debug!(target = %container.display(), "openat2 unavailable, mounting by path");
                Ok(PinnedTarget {
                    path: resolved.host_path.clone(),
                    fd: None,
                })
            }
            Err(Errno::LOOP) => Err(escape(
                &container,
                "path changed between resolution and mount",
            )),
            Err(e) => Err(MortiseError::mount(
                "openat2",
                &resolved.host_path,
                io::Error::from(e),
            )),
        }
    }

    fn host_path<S: AsRef<OsStr>>(&self, components: &[S]) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(components.iter().map(|c| Path::new(c.as_ref())));
        path
    }
}

fn create_dir(builder: &fs::DirBuilder, path: &Path) -> io::Result<()> {
    match builder.create(path) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        other => other,
    }
}

fn lexical_components(path: &Path) -> impl Iterator<Item = OsString> + '_ {
    path.components().filter_map(|c| match c {
        Component::Normal(name) => Some(name.to_os_string()),
        Component::ParentDir => Some(OsString::from("..")),
        Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
    })
}

fn escape(path: &Path, reason: &str) -> MortiseError {
    MortiseError::PathEscape {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}
