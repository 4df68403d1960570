#![allow(unsafe_code)]
//! Namespace policy as it affects mount setup.
//!
//! Creating and joining namespaces belongs to the caller. The mount engine
//! only needs to know which namespaces the container gets, because that
//! decides how `/sys` and `/sys/fs/cgroup` are provided. A thin [`unshare`]
//! primitive is provided for the CLI.

use mortise_common::{MortiseError, MortiseResult};
use mortise_oci::runtime::{Namespace, NamespaceType};
use rustix::thread::UnshareFlags;
use serde::{Deserialize, Serialize};

/// Which namespaces the container is given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespacePolicy {
    /// User namespace.
    pub user: bool,
    /// PID namespace.
    pub pid: bool,
    /// Network namespace.
    pub net: bool,
    /// Mount namespace.
    pub mount: bool,
    /// UTS namespace.
    pub uts: bool,
    /// IPC namespace.
    pub ipc: bool,
    /// Cgroup namespace.
    pub cgroup: bool,
    /// Time namespace.
    pub time: bool,
}

impl NamespacePolicy {
    /// Every namespace type.
    #[must_use]
    pub fn all() -> Self {
        Self {
            user: true,
            pid: true,
            net: true,
            mount: true,
            uts: true,
            ipc: true,
            cgroup: true,
            time: true,
        }
    }

    /// Build the policy from an OCI `linux.namespaces` list.
    #[must_use]
    pub fn from_namespaces(namespaces: &[Namespace]) -> Self {
        let mut policy = Self::default();
        for ns in namespaces {
            match ns.ns_type {
                NamespaceType::User => policy.user = true,
                NamespaceType::Pid => policy.pid = true,
                NamespaceType::Network => policy.net = true,
                NamespaceType::Mount => policy.mount = true,
                NamespaceType::Uts => policy.uts = true,
                NamespaceType::Ipc => policy.ipc = true,
                NamespaceType::Cgroup => policy.cgroup = true,
                NamespaceType::Time => policy.time = true,
            }
        }
        policy
    }

    /// Build the policy from an OCI spec.
    #[must_use]
    pub fn from_spec(spec: &mortise_oci::Spec) -> Self {
        spec.linux
            .as_ref()
            .map(|linux| Self::from_namespaces(&linux.namespaces))
            .unwrap_or_default()
    }

    /// Flags for `unshare(2)`.
    #[must_use]
    pub fn to_unshare_flags(&self) -> UnshareFlags {
        let mut flags = UnshareFlags::empty();
        if self.user {
            flags |= UnshareFlags::NEWUSER;
        }
        if self.pid {
            flags |= UnshareFlags::NEWPID;
        }
        if self.net {
            flags |= UnshareFlags::NEWNET;
        }
        if self.mount {
            flags |= UnshareFlags::NEWNS;
        }
        if self.uts {
            flags |= UnshareFlags::NEWUTS;
        }
        if self.ipc {
            flags |= UnshareFlags::NEWIPC;
        }
        if self.cgroup {
            flags |= UnshareFlags::NEWCGROUP;
        }
        if self.time {
            flags |= UnshareFlags::NEWTIME;
        }
        flags
    }
}

/// Move the calling thread into fresh namespaces.
///
/// # Errors
///
/// Returns [`MortiseError::Mount`] with the kernel's errno on failure.
pub fn unshare(flags: UnshareFlags) -> MortiseResult<()> {
    // The process is single-threaded while mounts are set up, and no file
    // descriptor table or fs state is shared with anything else.
    unsafe { rustix::thread::unshare_unsafe(flags) }
        .map_err(|e| MortiseError::mount("unshare", "/", e))?;
    tracing::debug!(?flags, "Unshared namespaces");
    Ok(())
}
