//! Bind sources that are neither directories nor regular files.

use std::fs::FileType;
use std::os::unix::fs::FileTypeExt;

use serde::{Deserialize, Serialize};

use crate::options::{AccessMode, BindMode, IdmapMode, ParsedOptions};
use crate::resolve::NodeKind;

/// File type of a bind source, after following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
    /// Directory.
    Directory,
    /// Regular file.
    Regular,
    /// Character device.
    CharDevice,
    /// Block device.
    BlockDevice,
    /// Named pipe.
    Fifo,
    /// UNIX domain socket.
    Socket,
}

impl FileKind {
    /// Whether submount-related semantics are meaningless for this kind.
    #[must_use]
    pub fn is_special(self) -> bool {
        matches!(
            self,
            FileKind::CharDevice | FileKind::BlockDevice | FileKind::Fifo | FileKind::Socket
        )
    }

    /// What to create as the mount point. Everything but a directory is
    /// mounted over an empty regular file; the bind then exposes the
    /// source's own type at the destination.
    #[must_use]
    pub fn mount_point(self) -> NodeKind {
        match self {
            FileKind::Directory => NodeKind::Directory,
            _ => NodeKind::File,
        }
    }
}

/// Classify a source file type. Symlinks are not classified; callers
/// resolve them first.
#[must_use]
pub fn classify(file_type: FileType) -> Option<FileKind> {
    if file_type.is_dir() {
        Some(FileKind::Directory)
    } else if file_type.is_file() {
        Some(FileKind::Regular)
    } else if file_type.is_char_device() {
        Some(FileKind::CharDevice)
    } else if file_type.is_block_device() {
        Some(FileKind::BlockDevice)
    } else if file_type.is_fifo() {
        Some(FileKind::Fifo)
    } else if file_type.is_socket() {
        Some(FileKind::Socket)
    } else {
        None
    }
}

/// Reduce `options` to what a bind of `kind` can honour.
///
/// Recursive bind, recursive read-only and recursive id-mapping are
/// downgraded to their single-mount forms for special files. A dropped
/// `rro` keeps plain `ro`.
#[must_use]
pub fn restrict_options(kind: FileKind, mut options: ParsedOptions) -> ParsedOptions {
    if !kind.is_special() {
        return options;
    }

    let mut dropped = Vec::new();
    if options.bind == BindMode::Rbind {
        dropped.push("rbind");
    }
    if options.is_recursive_readonly() {
        dropped.push("rro");
        options.access = AccessMode::Ro;
    }
    if options.idmap == IdmapMode::Ridmap {
        dropped.push("ridmap");
        options.idmap = IdmapMode::Idmap;
    }
    options.bind = BindMode::Bind;

    if !dropped.is_empty() {
        tracing::warn!(
            ?kind,
            dropped = ?dropped,
            "Recursive options are meaningless for special files, using single-mount forms"
        );
    }
    options
}
