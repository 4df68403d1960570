//! # mortise-oci
//!
//! OCI runtime specification types consumed by the Mortise mount engine:
//! mounts, uid/gid mappings, namespaces, and the readonly/masked path lists.

#![warn(missing_docs)]

pub mod runtime;

pub use runtime::Spec;
