//! Common error types for the Mortise mount engine.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`MortiseError`].
pub type MortiseResult<T> = Result<T, MortiseError>;

/// Errors raised while planning or executing a container's mount setup.
///
/// Every variant is fatal for the setup sequence. Degraded-but-successful
/// outcomes (dropped recursion on special files, unsupported optional kernel
/// features) are reported through return values and logs instead.
#[derive(Error, Diagnostic, Debug)]
pub enum MortiseError {
    /// A mount option token is unknown or conflicts with the mount type.
    #[error("Invalid mount option `{token}`: {reason}")]
    #[diagnostic(
        code(mortise::config::invalid_option),
        help("Filesystem-specific options must be given as key=value")
    )]
    InvalidMountOption {
        /// The offending token.
        token: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A uid/gid mapping table is malformed.
    #[error("Invalid identity mapping: {message}")]
    #[diagnostic(code(mortise::config::invalid_idmap))]
    InvalidIdMapping {
        /// Description of the problem.
        message: String,
    },

    /// Two declared mounts resolve to the same destination.
    #[error("Duplicate mount destination: {destination}")]
    #[diagnostic(
        code(mortise::config::duplicate_destination),
        help("Use readonlyPaths or maskedPaths to overlay an existing mount")
    )]
    DuplicateDestination {
        /// The normalized destination.
        destination: String,
    },

    /// Generic configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(mortise::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Path resolution would leave the container root.
    #[error("Path escapes the container root: {path}: {reason}")]
    #[diagnostic(code(mortise::path_escape))]
    PathEscape {
        /// The path being resolved.
        path: String,
        /// What made the resolution unsafe.
        reason: String,
    },

    /// A mount-related system call failed.
    #[error("{operation} failed on {}: {source}", target.display())]
    #[diagnostic(code(mortise::mount))]
    Mount {
        /// The operation that failed (e.g. `bind mount`, `remount`).
        operation: &'static str,
        /// The mount target.
        target: PathBuf,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Feature not supported on this host.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(mortise::unsupported),
        help("Id-mapped mounts need Linux 5.12 or later and filesystem support")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(mortise::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(mortise::serialization))]
    Serialization(String),
}

impl MortiseError {
    /// Wrap a failed system call, keeping the original errno.
    pub fn mount(
        operation: &'static str,
        target: impl Into<PathBuf>,
        source: impl Into<std::io::Error>,
    ) -> Self {
        MortiseError::Mount {
            operation,
            target: target.into(),
            source: source.into(),
        }
    }

    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        MortiseError::Config {
            message: message.into(),
        }
    }

    /// Raw OS error number of the underlying failure, if there is one.
    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        match self {
            MortiseError::Mount { source, .. } | MortiseError::Io(source) => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for MortiseError {
    fn from(err: serde_json::Error) -> Self {
        MortiseError::Serialization(err.to_string())
    }
}
