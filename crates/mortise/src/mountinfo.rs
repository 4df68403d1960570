//! Read-only view of the kernel's live mount table.
//!
//! Components that need the flags already in force on a path take a
//! [`MountTable`] instead of reading `/proc/self/mountinfo` themselves, so the
//! table can be replaced by a fixed record list in tests.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use mortise_common::{HostPaths, MortiseError, MortiseResult};
use serde::{Deserialize, Serialize};

/// One line of `/proc/<pid>/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveMountRecord {
    /// Mount point.
    pub target: PathBuf,
    /// Filesystem type.
    pub fs_type: String,
    /// Mount source as reported by the filesystem.
    pub source: String,
    /// Per-mount options (`ro`, `nosuid`, `relatime`, ...).
    pub vfs_options: BTreeSet<String>,
    /// Superblock options (`sync`, `mode=755`, ...).
    pub fs_options: BTreeSet<String>,
}

impl LiveMountRecord {
    /// Whether the per-mount options contain `option`.
    #[must_use]
    pub fn has_vfs_option(&self, option: &str) -> bool {
        self.vfs_options.contains(option)
    }

    /// Whether the mount is read-only.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.has_vfs_option("ro")
    }
}

impl FromStr for LiveMountRecord {
    type Err = MortiseError;

    // 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
    fn from_str(line: &str) -> MortiseResult<Self> {
        let malformed = || MortiseError::Serialization(format!("malformed mountinfo line: {line}"));

        let (head, tail) = line.split_once(" - ").ok_or_else(malformed)?;
        let mut head = head.split(' ');
        let target = head.nth(4).ok_or_else(malformed)?;
        let vfs_options = head.next().ok_or_else(malformed)?;

        let mut tail = tail.split(' ');
        let fs_type = tail.next().ok_or_else(malformed)?;
        let source = tail.next().ok_or_else(malformed)?;
        let fs_options = tail.next().unwrap_or_default();

        Ok(Self {
            target: PathBuf::from(OsString::from_vec(unescape(target))),
            fs_type: fs_type.to_string(),
            source: String::from_utf8_lossy(&unescape(source)).into_owned(),
            vfs_options: split_options(vfs_options),
            fs_options: split_options(fs_options),
        })
    }
}

fn split_options(options: &str) -> BTreeSet<String> {
    options
        .split(',')
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

/// Decode the `\ooo` octal escapes the kernel uses for whitespace and `\`.
fn unescape(field: &str) -> Vec<u8> {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Parse a whole mountinfo file.
///
/// # Errors
///
/// Returns [`MortiseError::Serialization`] on the first malformed line.
pub fn parse_mountinfo(text: &str) -> MortiseResult<Vec<LiveMountRecord>> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Source of live mount records.
pub trait MountTable {
    /// Current records, in mount order.
    ///
    /// # Errors
    ///
    /// Fails if the table cannot be read or parsed.
    fn records(&self) -> MortiseResult<Vec<LiveMountRecord>>;

    /// The mount that `path` lives on: the record whose target is the
    /// longest ancestor-or-self of `path`. When a path has been mounted
    /// over, the most recent record wins.
    ///
    /// # Errors
    ///
    /// Same as [`MountTable::records`].
    fn enclosing(&self, path: &Path) -> MortiseResult<Option<LiveMountRecord>> {
        Ok(nearest(self.records()?, path))
    }
}

fn nearest(records: Vec<LiveMountRecord>, path: &Path) -> Option<LiveMountRecord> {
    let mut best: Option<(usize, LiveMountRecord)> = None;
    for record in records {
        if !path.starts_with(&record.target) {
            continue;
        }
        let depth = record.target.components().count();
        if best.as_ref().is_none_or(|(d, _)| depth >= *d) {
            best = Some((depth, record));
        }
    }
    best.map(|(_, record)| record)
}

/// The calling process's mount table, read from procfs on every query.
#[derive(Debug, Clone)]
pub struct ProcMountInfo {
    path: PathBuf,
}

impl ProcMountInfo {
    /// Read records from `path` (normally `/proc/self/mountinfo`).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read from the mountinfo file configured in `paths`.
    #[must_use]
    pub fn from_host_paths(paths: &HostPaths) -> Self {
        Self::new(&paths.mountinfo)
    }
}

impl Default for ProcMountInfo {
    fn default() -> Self {
        Self::from_host_paths(&HostPaths::default())
    }
}

impl MountTable for ProcMountInfo {
    fn records(&self) -> MortiseResult<Vec<LiveMountRecord>> {
        parse_mountinfo(&fs::read_to_string(&self.path)?)
    }
}

impl MountTable for Vec<LiveMountRecord> {
    fn records(&self) -> MortiseResult<Vec<LiveMountRecord>> {
        Ok(self.clone())
    }
}
