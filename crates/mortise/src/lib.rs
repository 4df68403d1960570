//! # Mortise
//!
//! Mortise assembles a container's filesystem view: it turns the mounts of
//! an OCI runtime configuration into an ordered plan and performs the
//! kernel mount operations under the container's rootfs.
//!
//! ## Guarantees
//!
//! - **Confinement**: destinations are resolved as if the rootfs were `/`;
//!   symlinks and `..` can never lead outside of it
//! - **Monotonic flags**: read-only and masked overlays only ever add
//!   restrictions to the mount they sit on
//! - **Ownership mapping**: `idmap`/`ridmap` binds present files through a
//!   uid/gid mapping without touching them on disk
//!
//! ## Usage
//!
//! ```no_run
//! use mortise::setup::{MountSetup, setup_mounts};
//!
//! # fn example() -> mortise_common::MortiseResult<()> {
//! let spec = mortise_oci::Spec::load("/bundle/config.json")?;
//! let setup = MountSetup::from_spec(&spec, "/bundle/rootfs", None)?;
//!
//! // Inspect the plan without mounting anything
//! let plan = setup.plan()?;
//! println!("{} mount operations", plan.len());
//!
//! // Perform the mounts inside the container's mount namespace
//! let _report = setup_mounts(&setup)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod exec;
pub mod idmap;
pub mod inherit;
pub mod mountinfo;
pub mod namespace;
pub mod options;
pub mod plan;
pub mod resolve;
pub mod setup;
pub mod special;
pub mod sys;
pub mod vfs;

pub use plan::{MountPlan, MountRequest};
pub use setup::{MountSetup, setup_mounts};
