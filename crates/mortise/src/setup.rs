//! Mount setup configuration and entry point.

use std::fs;
use std::path::{Path, PathBuf};

use mortise_common::{HostPaths, MortiseResult};

use crate::exec::{ExecReport, MountExecutor};
use crate::idmap::IdentityMapping;
use crate::mountinfo::ProcMountInfo;
use crate::namespace::NamespacePolicy;
use crate::options::Propagation;
use crate::plan::{MountPlan, MountRequest, PlanInput};

/// Everything needed to assemble one container's mounts.
#[derive(Debug, Clone)]
pub struct MountSetup {
    rootfs: PathBuf,
    input: PlanInput,
    namespaces: NamespacePolicy,
    rootfs_propagation: Propagation,
    readonly_rootfs: bool,
    host: HostPaths,
}

impl MountSetup {
    /// Start a configuration for the given rootfs.
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
            input: PlanInput::default(),
            namespaces: NamespacePolicy::default(),
            rootfs_propagation: Propagation::Rprivate,
            readonly_rootfs: false,
            host: HostPaths::default(),
        }
    }

    /// Build a configuration from an OCI spec. Relative bind sources are
    /// taken relative to `bundle` when one is given.
    ///
    /// # Errors
    ///
    /// Fails on invalid mount options, id mappings or propagation mode.
    pub fn from_spec(
        spec: &mortise_oci::Spec,
        rootfs: impl Into<PathBuf>,
        bundle: Option<&Path>,
    ) -> MortiseResult<Self> {
        let mounts = spec
            .mounts
            .iter()
            .map(MountRequest::from_oci)
            .collect::<MortiseResult<Vec<_>>>()?;

        let mut setup = Self::new(rootfs)
            .with_mounts(mounts)
            .with_namespaces(NamespacePolicy::from_spec(spec))
            .with_readonly_rootfs(spec.root.as_ref().is_some_and(|root| root.readonly));
        if let Some(bundle) = bundle {
            setup = setup.with_bundle(bundle);
        }

        if let Some(linux) = &spec.linux {
            let uid = IdentityMapping::from_oci(&linux.uid_mappings)?;
            let gid = IdentityMapping::from_oci(&linux.gid_mappings)?;
            setup = setup
                .with_readonly_paths(linux.readonly_paths.iter().cloned())
                .with_masked_paths(linux.masked_paths.iter().cloned())
                .with_uid_mappings(uid.unwrap_or_default())
                .with_gid_mappings(gid.unwrap_or_default());
            if let Some(propagation) = linux.rootfs_propagation.as_deref() {
                setup = setup.with_rootfs_propagation(propagation.parse()?);
            }
        }
        Ok(setup)
    }

    /// Declared mounts, in configuration order.
    #[must_use]
    pub fn with_mounts(mut self, mounts: Vec<MountRequest>) -> Self {
        self.input.mounts = mounts;
        self
    }

    /// Paths to remount read-only after all mounts.
    #[must_use]
    pub fn with_readonly_paths(mut self, paths: impl IntoIterator<Item = String>) -> Self {
        self.input.readonly_paths = paths.into_iter().collect();
        self
    }

    /// Paths to hide after all mounts.
    #[must_use]
    pub fn with_masked_paths(mut self, paths: impl IntoIterator<Item = String>) -> Self {
        self.input.masked_paths = paths.into_iter().collect();
        self
    }

    /// Namespaces the container gets.
    #[must_use]
    pub fn with_namespaces(mut self, namespaces: NamespacePolicy) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// The container's uid mapping, used by `idmap` mounts without their own.
    #[must_use]
    pub fn with_uid_mappings(mut self, mapping: IdentityMapping) -> Self {
        self.input.uid_mappings = mapping;
        self
    }

    /// The container's gid mapping, used by `idmap` mounts without their own.
    #[must_use]
    pub fn with_gid_mappings(mut self, mapping: IdentityMapping) -> Self {
        self.input.gid_mappings = mapping;
        self
    }

    /// Propagation of the rootfs mount (default `rprivate`).
    #[must_use]
    pub fn with_rootfs_propagation(mut self, propagation: Propagation) -> Self {
        self.rootfs_propagation = propagation;
        self
    }

    /// Remount the rootfs read-only after every other mount. Mounts inside
    /// it are not affected.
    #[must_use]
    pub fn with_readonly_rootfs(mut self, readonly: bool) -> Self {
        self.readonly_rootfs = readonly;
        self
    }

    /// Add a `/proc` mount when none is declared.
    #[must_use]
    pub fn with_implicit_proc(mut self, enabled: bool) -> Self {
        self.input.implicit_proc = enabled;
        self
    }

    /// Base directory for relative bind sources.
    #[must_use]
    pub fn with_bundle(mut self, bundle: impl Into<PathBuf>) -> Self {
        self.input.bundle = Some(bundle.into());
        self
    }

    /// Host locations to read from.
    #[must_use]
    pub fn with_host_paths(mut self, host: HostPaths) -> Self {
        self.host = host;
        self
    }

    /// The rootfs.
    #[must_use]
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// The namespace policy.
    #[must_use]
    pub fn namespaces(&self) -> NamespacePolicy {
        self.namespaces
    }

    /// Build the mount plan without mounting anything.
    ///
    /// # Errors
    ///
    /// See [`MountPlan::build`].
    pub fn plan(&self) -> MortiseResult<MountPlan> {
        MountPlan::build(&self.input)
    }
}

/// Plan and perform every mount of `setup`.
///
/// Must run inside the container's mount namespace. On error the namespace
/// is left half-assembled and should be discarded.
///
/// # Errors
///
/// Planning errors are returned before any mount; execution stops at the
/// first failing mount.
pub fn setup_mounts(setup: &MountSetup) -> MortiseResult<ExecReport> {
    let plan = setup.plan()?;
    let rootfs = fs::canonicalize(&setup.rootfs)?;
    let table = ProcMountInfo::from_host_paths(&setup.host);

    tracing::info!(
        rootfs = %rootfs.display(),
        operations = plan.len(),
        propagation = %setup.rootfs_propagation,
        readonly = setup.readonly_rootfs,
        "Setting up container mounts"
    );
    MountExecutor::new(rootfs, setup.namespaces, &setup.host, &table)
        .with_rootfs_propagation(setup.rootfs_propagation)
        .with_readonly_rootfs(setup.readonly_rootfs)
        .execute(&plan)
}
