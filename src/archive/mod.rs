//! Archive formats that can be mounted into the search path.
//!
//! A host directory is always served by [`DirArchive`]. Packed formats are
//! recognized by an [`Archiver`](crate::core::Archiver); ZIP and GRP are
//! registered by default.

mod dir;
mod entry;
mod grp;
mod tree;
pub(crate) mod zip;

use std::sync::Arc;

use crate::core::Archiver;

pub use dir::DirArchive;
pub use entry::{FileType, Stat};
pub use grp::GrpArchiver;
pub use tree::{EntryTree, Node};
pub use zip::ZipArchiver;

/// Describes an archive format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    /// File extension without the dot, e.g. `"ZIP"`. Matched case-insensitively.
    pub extension: String,
    pub description: String,
    pub author: String,
    pub supports_symlinks: bool,
}

impl ArchiveInfo {
    pub fn new(extension: &str, description: &str, author: &str, supports_symlinks: bool) -> Self {
        Self {
            extension: extension.to_string(),
            description: description.to_string(),
            author: author.to_string(),
            supports_symlinks,
        }
    }
}

/// The archivers every new `Vfs` starts with.
pub fn default_archivers() -> Vec<Arc<dyn Archiver>> {
    vec![Arc::new(ZipArchiver::new()), Arc::new(GrpArchiver::new())]
}
