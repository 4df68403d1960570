//! Mount plan construction.
//!
//! The plan is computed without touching the rootfs: destinations are
//! normalized lexically and bind sources are only inspected. Building the
//! same input twice against an unchanged host gives equal plans.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use mortise_common::{MortiseError, MortiseResult};
use serde::{Deserialize, Serialize};

use crate::idmap::{IdentityMapping, MountIdMapping};
use crate::options::{AccessMode, IdmapMode, ParsedOptions};
use crate::resolve::{normalize_destination, path_depth};
use crate::special::{self, FileKind};

/// Filesystem type of a mount request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    /// Bind of a host path.
    Bind,
    /// tmpfs.
    Tmpfs,
    /// procfs.
    Proc,
    /// sysfs.
    Sysfs,
    /// cgroup or cgroup2.
    Cgroup,
    /// devpts.
    Devpts,
    /// Any other filesystem type, mounted as given.
    Other(String),
}

impl MountKind {
    /// Classify a request from its declared type and options.
    ///
    /// `bind`/`rbind` in the options make a bind mount whatever the type
    /// says. `rro` does so only when no type is declared.
    ///
    /// # Errors
    ///
    /// Returns [`MortiseError::Config`] for an untyped, non-bind mount.
    pub fn classify(mount_type: Option<&str>, options: &ParsedOptions) -> MortiseResult<Self> {
        if options.bind != crate::options::BindMode::None {
            return Ok(MountKind::Bind);
        }
        Ok(match mount_type {
            None if options.implies_bind() => MountKind::Bind,
            None => return Err(MortiseError::config("mount without type or bind option")),
            Some("bind") => MountKind::Bind,
            Some("tmpfs") => MountKind::Tmpfs,
            Some("proc") => MountKind::Proc,
            Some("sysfs") => MountKind::Sysfs,
            Some("cgroup" | "cgroup2") => MountKind::Cgroup,
            Some("devpts") => MountKind::Devpts,
            Some(other) => MountKind::Other(other.to_string()),
        })
    }

    /// Filesystem type passed to `mount(2)`, `None` for binds.
    #[must_use]
    pub fn fs_type(&self) -> Option<&str> {
        match self {
            MountKind::Bind => None,
            MountKind::Tmpfs => Some("tmpfs"),
            MountKind::Proc => Some("proc"),
            MountKind::Sysfs => Some("sysfs"),
            MountKind::Cgroup => Some("cgroup2"),
            MountKind::Devpts => Some("devpts"),
            MountKind::Other(fs_type) => Some(fs_type),
        }
    }
}

/// One declared mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    /// Destination as written in the configuration.
    pub destination: String,
    /// Filesystem type.
    pub kind: MountKind,
    /// Source: a host path for binds, free-form otherwise.
    pub source: Option<String>,
    /// Raw option tokens.
    pub options: Vec<String>,
    /// Per-mount uid mapping for id-mapped mounts.
    pub uid_mappings: Option<IdentityMapping>,
    /// Per-mount gid mapping for id-mapped mounts.
    pub gid_mappings: Option<IdentityMapping>,
}

impl MountRequest {
    /// Create a request with no source or options.
    pub fn new(destination: impl Into<String>, kind: MountKind) -> Self {
        Self {
            destination: destination.into(),
            kind,
            source: None,
            options: Vec::new(),
            uid_mappings: None,
            gid_mappings: None,
        }
    }

    /// Set the source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the option tokens.
    #[must_use]
    pub fn with_options<S: Into<String>>(mut self, options: impl IntoIterator<Item = S>) -> Self {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Convert an OCI mount entry.
    ///
    /// # Errors
    ///
    /// Fails on unknown options, an untyped non-bind mount, or malformed
    /// per-mount id mappings.
    pub fn from_oci(mount: &mortise_oci::runtime::Mount) -> MortiseResult<Self> {
        let options = ParsedOptions::parse(&mount.options)?;
        Ok(Self {
            destination: mount.destination.clone(),
            kind: MountKind::classify(mount.mount_type.as_deref(), &options)?,
            source: mount.source.clone(),
            options: mount.options.clone(),
            uid_mappings: IdentityMapping::from_oci(&mount.uid_mappings)?,
            gid_mappings: IdentityMapping::from_oci(&mount.gid_mappings)?,
        })
    }
}

/// Where a planned mount takes its content from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum SourceKind {
    /// Host path with symlinks resolved.
    Path {
        /// Real path of the source.
        path: PathBuf,
        /// File type of the source.
        file_kind: FileKind,
    },
    /// No mount: the destination becomes a symlink with this exact text.
    Symlink {
        /// Link text of the source symlink.
        link: PathBuf,
    },
    /// Free-form source of a non-bind filesystem.
    Virtual {
        /// Source string handed to `mount(2)`.
        name: String,
    },
    /// The overlay acts on whatever is mounted at the target.
    Target,
}

/// Planning phase. Every declared mount precedes every overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Declared and implicit mounts.
    Mount,
    /// Read-only and masked path overlays.
    Overlay,
}

/// Kind of post-mount overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayKind {
    /// Remount the path read-only, keeping inherited flags.
    Readonly,
    /// Hide the path's content.
    Masked,
}

/// A fully planned mount operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedMountOp {
    /// The request this operation was planned from.
    pub request: MountRequest,
    /// Normalized absolute destination inside the container.
    pub target: PathBuf,
    /// Content source.
    pub source: SourceKind,
    /// Parsed options, restricted for special sources.
    pub options: ParsedOptions,
    /// Number of components in `target`.
    pub depth: usize,
    /// Planning phase.
    pub phase: Phase,
    /// Overlay kind for [`Phase::Overlay`] operations.
    pub overlay: Option<OverlayKind>,
    /// Resolved id mapping for `idmap`/`ridmap` binds.
    pub idmap: Option<MountIdMapping>,
}

/// Everything the plan is built from.
#[derive(Debug, Clone, Default)]
pub struct PlanInput {
    /// Declared mounts, in configuration order.
    pub mounts: Vec<MountRequest>,
    /// Paths to force read-only.
    pub readonly_paths: Vec<String>,
    /// Paths to hide.
    pub masked_paths: Vec<String>,
    /// The container's uid mapping.
    pub uid_mappings: IdentityMapping,
    /// The container's gid mapping.
    pub gid_mappings: IdentityMapping,
    /// Mount `/proc` when no declared mount targets it.
    pub implicit_proc: bool,
    /// Base directory for relative bind sources.
    pub bundle: Option<PathBuf>,
}

/// Ordered mount operations for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPlan {
    /// Operations in execution order.
    pub ops: Vec<ResolvedMountOp>,
}

impl MountPlan {
    /// Build the plan.
    ///
    /// # Errors
    ///
    /// Configuration errors (options, mappings, duplicates, missing bind
    /// sources) and path escapes are reported before anything is mounted.
    pub fn build(input: &PlanInput) -> MortiseResult<Self> {
        let mut ops = Vec::new();
        let mut seen = HashSet::new();

        let declares_proc = input
            .mounts
            .iter()
            .filter_map(|m| normalize_destination(&m.destination).ok())
            .any(|target| target == Path::new("/proc"));
        let implicit = (input.implicit_proc && !declares_proc).then(|| {
            MountRequest::new("/proc", MountKind::Proc)
                .with_source("proc")
                .with_options(["nosuid", "noexec", "nodev"])
        });

        for request in implicit.iter().chain(&input.mounts) {
            let op = plan_mount(request, input)?;
            if !seen.insert(op.target.clone()) {
                return Err(MortiseError::DuplicateDestination {
                    destination: op.target.display().to_string(),
                });
            }
            ops.push(op);
        }

        let overlays = input
            .readonly_paths
            .iter()
            .map(|p| (p, OverlayKind::Readonly))
            .chain(input.masked_paths.iter().map(|p| (p, OverlayKind::Masked)));
        for (path, kind) in overlays {
            ops.push(plan_overlay(path, kind)?);
        }

        ops.sort_by_key(|op| (op.phase, op.depth));
        tracing::debug!(ops = ops.len(), "Built mount plan");
        Ok(Self { ops })
    }

    /// Number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the plan is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operations in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &ResolvedMountOp> {
        self.ops.iter()
    }
}

fn plan_mount(request: &MountRequest, input: &PlanInput) -> MortiseResult<ResolvedMountOp> {
    let target = normalize_destination(&request.destination)?;
    let mut options = ParsedOptions::parse(&request.options)?;
    if options.idmap != IdmapMode::None && request.kind != MountKind::Bind {
        return Err(MortiseError::InvalidMountOption {
            token: "idmap".to_string(),
            reason: "id mapping is only supported on bind mounts".to_string(),
        });
    }

    let source = match request.kind {
        MountKind::Bind => {
            let raw = request.source.as_deref().ok_or_else(|| {
                MortiseError::config(format!("bind mount of {} has no source", request.destination))
            })?;
            let path = match &input.bundle {
                Some(bundle) => bundle.join(raw),
                None => PathBuf::from(raw),
            };
            let source = inspect_bind_source(&path, options.copy_symlink)?;
            if let SourceKind::Path { file_kind, .. } = &source {
                options = special::restrict_options(*file_kind, options);
            }
            source
        }
        _ => SourceKind::Virtual {
            name: request
                .source
                .clone()
                .or_else(|| request.kind.fs_type().map(str::to_string))
                .unwrap_or_default(),
        },
    };

    let idmap = match (options.idmap, &source) {
        (IdmapMode::None, _) | (_, SourceKind::Symlink { .. }) => None,
        _ => Some(MountIdMapping::select(
            request.uid_mappings.as_ref(),
            request.gid_mappings.as_ref(),
            &input.uid_mappings,
            &input.gid_mappings,
        )?),
    };

    Ok(ResolvedMountOp {
        request: request.clone(),
        depth: path_depth(&target),
        target,
        source,
        options,
        phase: Phase::Mount,
        overlay: None,
        idmap,
    })
}

/// Inspect a bind source without following it into the container.
fn inspect_bind_source(path: &Path, copy_symlink: bool) -> MortiseResult<SourceKind> {
    let meta = fs::symlink_metadata(path).map_err(|e| missing_source(path, e))?;

    if meta.file_type().is_symlink() {
        let link = fs::read_link(path)?;
        if copy_symlink {
            return Ok(SourceKind::Symlink { link });
        }
        return match fs::canonicalize(path) {
            Ok(real) => path_source(real),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(
                    source = %path.display(),
                    link = %link.display(),
                    "Bind source is a dangling symlink, copying the link"
                );
                Ok(SourceKind::Symlink { link })
            }
            Err(e) => Err(e.into()),
        };
    }

    path_source(fs::canonicalize(path).map_err(|e| missing_source(path, e))?)
}

fn path_source(path: PathBuf) -> MortiseResult<SourceKind> {
    let meta = fs::metadata(&path).map_err(|e| missing_source(&path, e))?;
    let file_kind = special::classify(meta.file_type()).ok_or_else(|| {
        MortiseError::config(format!("unsupported bind source type: {}", path.display()))
    })?;
    Ok(SourceKind::Path { path, file_kind })
}

fn missing_source(path: &Path, err: io::Error) -> MortiseError {
    if err.kind() == io::ErrorKind::NotFound {
        MortiseError::config(format!("bind source {} does not exist", path.display()))
    } else {
        err.into()
    }
}

fn plan_overlay(path: &str, kind: OverlayKind) -> MortiseResult<ResolvedMountOp> {
    let target = normalize_destination(path)?;
    let options = ParsedOptions {
        access: AccessMode::Ro,
        ..Default::default()
    };
    Ok(ResolvedMountOp {
        request: MountRequest::new(path, MountKind::Bind),
        depth: path_depth(&target),
        target,
        source: SourceKind::Target,
        options,
        phase: Phase::Overlay,
        overlay: Some(kind),
        idmap: None,
    })
}
