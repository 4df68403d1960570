//! # mortise-common
//!
//! Shared types for the Mortise mount engine:
//! - Error types with diagnostics
//! - Host paths consulted during mount setup

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{MortiseError, MortiseResult};
pub use paths::HostPaths;
