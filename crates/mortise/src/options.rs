//! Mount option parsing.
//!
//! Turns the free-form option list of a mount request into a closed,
//! typed [`ParsedOptions`] record. Each option belongs to an axis; the last
//! token on an axis wins. Tokens of the form `key=value` are filesystem
//! data and are handed to the kernel untouched. Anything else is rejected
//! before a single mount is attempted.

use std::fmt;
use std::str::FromStr;

use mortise_common::{MortiseError, MortiseResult};
use serde::{Deserialize, Serialize};

/// Access-time update policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtimeMode {
    /// Not requested; the kernel or parent mount decides.
    #[default]
    Default,
    /// Update atime relative to mtime/ctime.
    Relatime,
    /// Always update atime.
    Strictatime,
    /// Never update atime.
    Noatime,
}

/// Read-write policy. `rro` and `rrw` sit on the same axis as `ro` and
/// `rw`, so whichever comes last decides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Not requested; a bind keeps the access mode of its source.
    #[default]
    Default,
    /// Writable.
    Rw,
    /// Read-only.
    Ro,
    /// Read-only, including every submount.
    Rro,
    /// Writable, requested with the recursive spelling.
    Rrw,
}

impl AccessMode {
    /// Whether the top mount ends up read-only.
    #[must_use]
    pub fn is_readonly(self) -> bool {
        matches!(self, AccessMode::Ro | AccessMode::Rro)
    }

    /// Whether submounts are made read-only too.
    #[must_use]
    pub fn is_recursive_readonly(self) -> bool {
        self == AccessMode::Rro
    }

    /// Whether writability was asked for explicitly.
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, AccessMode::Rw | AccessMode::Rrw)
    }
}

/// Execution policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Not requested.
    #[default]
    Default,
    /// Allow execution.
    Exec,
    /// Deny execution.
    Noexec,
}

/// Device-node policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevMode {
    /// Not requested.
    #[default]
    Default,
    /// Interpret device nodes.
    Dev,
    /// Ignore device nodes.
    Nodev,
}

/// Set-uid policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuidMode {
    /// Not requested.
    #[default]
    Default,
    /// Honour set-uid bits.
    Suid,
    /// Ignore set-uid bits.
    Nosuid,
}

/// Write durability policy. These are superblock flags, so they show up
/// among the filesystem options of the live mount, not the vfs options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Asynchronous writes.
    #[default]
    Default,
    /// Synchronous data writes.
    Sync,
    /// Synchronous directory updates.
    Dirsync,
}

/// Bind semantics requested for the mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    /// Not a bind mount.
    #[default]
    None,
    /// Bind only the source mount.
    Bind,
    /// Bind the source and every mount beneath it.
    Rbind,
}

/// Id-mapping requested for the mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdmapMode {
    /// Ownership is presented as on disk.
    #[default]
    None,
    /// Id-mapped mount of the source only.
    Idmap,
    /// Id-mapped mount applied to submounts too.
    Ridmap,
}

/// Mount propagation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    /// `private`
    Private,
    /// `rprivate`
    Rprivate,
    /// `shared`
    Shared,
    /// `rshared`
    Rshared,
    /// `slave`
    Slave,
    /// `rslave`
    Rslave,
    /// `unbindable`
    Unbindable,
    /// `runbindable`
    Runbindable,
}

impl Propagation {
    /// Whether the change applies to the whole subtree.
    #[must_use]
    pub fn is_recursive(self) -> bool {
        matches!(
            self,
            Propagation::Rprivate
                | Propagation::Rshared
                | Propagation::Rslave
                | Propagation::Runbindable
        )
    }
}

impl FromStr for Propagation {
    type Err = MortiseError;

    fn from_str(s: &str) -> MortiseResult<Self> {
        match s {
            "private" => Ok(Propagation::Private),
            "rprivate" => Ok(Propagation::Rprivate),
            "shared" => Ok(Propagation::Shared),
            "rshared" => Ok(Propagation::Rshared),
            "slave" => Ok(Propagation::Slave),
            "rslave" => Ok(Propagation::Rslave),
            "unbindable" => Ok(Propagation::Unbindable),
            "runbindable" => Ok(Propagation::Runbindable),
            other => Err(MortiseError::InvalidMountOption {
                token: other.to_string(),
                reason: "unknown propagation mode".to_string(),
            }),
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Propagation::Private => "private",
            Propagation::Rprivate => "rprivate",
            Propagation::Shared => "shared",
            Propagation::Rshared => "rshared",
            Propagation::Slave => "slave",
            Propagation::Rslave => "rslave",
            Propagation::Unbindable => "unbindable",
            Propagation::Runbindable => "runbindable",
        };
        f.write_str(s)
    }
}

/// Typed projection of a mount request's option list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParsedOptions {
    /// Read-write policy (`ro`/`rw`/`rro`/`rrw`).
    pub access: AccessMode,
    /// Access-time policy.
    pub atime: AtimeMode,
    /// Execution policy.
    pub exec: ExecMode,
    /// Device-node policy.
    pub dev: DevMode,
    /// Set-uid policy.
    pub suid: SuidMode,
    /// Durability policy.
    pub sync: SyncMode,
    /// Bind semantics.
    pub bind: BindMode,
    /// Id-mapping mode.
    pub idmap: IdmapMode,
    /// Materialize symlink sources as symlinks instead of mounting.
    pub copy_symlink: bool,
    /// Propagation type to set after mounting.
    pub propagation: Option<Propagation>,
    /// Filesystem-specific `key=value` options, in declaration order.
    pub data: Vec<String>,
}

impl ParsedOptions {
    /// Parse an option list.
    ///
    /// # Errors
    ///
    /// Returns [`MortiseError::InvalidMountOption`] naming the first token
    /// that is neither a known flag nor `key=value` data.
    pub fn parse<S: AsRef<str>>(tokens: &[S]) -> MortiseResult<Self> {
        let mut opts = Self::default();
        for token in tokens {
            opts.apply(token.as_ref())?;
        }
        Ok(opts)
    }

    fn apply(&mut self, token: &str) -> MortiseResult<()> {
        match token {
            "defaults" => {}
            "ro" => self.access = AccessMode::Ro,
            "rw" => self.access = AccessMode::Rw,
            "rro" => self.access = AccessMode::Rro,
            "rrw" => self.access = AccessMode::Rrw,
            "suid" => self.suid = SuidMode::Suid,
            "nosuid" => self.suid = SuidMode::Nosuid,
            "dev" => self.dev = DevMode::Dev,
            "nodev" => self.dev = DevMode::Nodev,
            "exec" => self.exec = ExecMode::Exec,
            "noexec" => self.exec = ExecMode::Noexec,
            "relatime" => self.atime = AtimeMode::Relatime,
            "strictatime" => self.atime = AtimeMode::Strictatime,
            "noatime" => self.atime = AtimeMode::Noatime,
            "atime" | "norelatime" | "nostrictatime" => self.atime = AtimeMode::Default,
            "sync" => self.sync = SyncMode::Sync,
            "dirsync" => self.sync = SyncMode::Dirsync,
            "async" => self.sync = SyncMode::Default,
            "bind" => self.bind = BindMode::Bind,
            "rbind" => self.bind = BindMode::Rbind,
            "copy-symlink" => self.copy_symlink = true,
            "idmap" => self.idmap = IdmapMode::Idmap,
            "ridmap" => self.idmap = IdmapMode::Ridmap,
            "private" | "rprivate" | "shared" | "rshared" | "slave" | "rslave"
            | "unbindable" | "runbindable" => self.propagation = Some(token.parse()?),
            data if is_data_option(data) => self.data.push(data.to_string()),
            other => {
                return Err(MortiseError::InvalidMountOption {
                    token: other.to_string(),
                    reason: "unknown mount option".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether the options alone ask for bind semantics (`bind`, `rbind`,
    /// or a final `rro`, which implies a bind).
    #[must_use]
    pub fn implies_bind(&self) -> bool {
        self.bind != BindMode::None || self.access.is_recursive_readonly()
    }

    /// Whether the top mount ends up read-only.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.access.is_readonly()
    }

    /// Whether submounts are made read-only too.
    #[must_use]
    pub fn is_recursive_readonly(&self) -> bool {
        self.access.is_recursive_readonly()
    }

    /// Whether any restrictive axis was explicitly relaxed (`rw`, `suid`,
    /// `dev`, `exec`). Such axes override what a bind inherits.
    #[must_use]
    pub fn relaxes_any(&self) -> bool {
        self.access.is_writable()
            || self.suid == SuidMode::Suid
            || self.dev == DevMode::Dev
            || self.exec == ExecMode::Exec
    }

    /// Whether the bind should include submounts.
    #[must_use]
    pub fn is_recursive_bind(&self) -> bool {
        self.bind == BindMode::Rbind
    }

    /// Filesystem data string passed to `mount(2)`.
    #[must_use]
    pub fn data_string(&self) -> String {
        self.data.join(",")
    }

    /// Whether any per-mount flag beyond bind semantics was requested, which
    /// means a bind mount needs a follow-up remount.
    #[must_use]
    pub fn needs_remount(&self) -> bool {
        self.is_readonly()
            || self.relaxes_any()
            || self.atime != AtimeMode::Default
            || self.exec == ExecMode::Noexec
            || self.dev == DevMode::Nodev
            || self.suid == SuidMode::Nosuid
            || self.sync != SyncMode::Default
    }
}

/// Bare filesystem options that are passed to the filesystem as data.
const BARE_DATA_OPTIONS: &[&str] = &["newinstance", "userxattr"];

fn is_data_option(token: &str) -> bool {
    BARE_DATA_OPTIONS.contains(&token)
        || matches!(token.split_once('='), Some((key, _)) if !key.is_empty())
}
