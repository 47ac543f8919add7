pub mod error;
pub mod io;
pub mod utils;

use crate::archive::{ArchiveInfo, Stat};

pub use error::ErrorCode;
pub use io::Io;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// An opened archive: a directory tree addressed by sanitized, archive-relative paths.
///
/// Paths use `/` as separator, never start or end with `/`, and the empty string
/// names the archive root. Read-only formats only implement the read half; the
/// default write operations fail with [`ErrorCode::ReadOnly`].
pub trait Archive: Send {
    /// Lists the names (not paths) of the immediate children of `dir`.
    fn enumerate(&self, dir: &str) -> Result<Vec<String>>;

    fn open_read(&self, path: &str) -> Result<Box<dyn Io>>;

    fn open_write(&self, _path: &str) -> Result<Box<dyn Io>> {
        Err(ErrorCode::ReadOnly.into())
    }

    fn open_append(&self, _path: &str) -> Result<Box<dyn Io>> {
        Err(ErrorCode::ReadOnly.into())
    }

    fn remove(&self, _path: &str) -> Result<()> {
        Err(ErrorCode::ReadOnly.into())
    }

    fn mkdir(&self, _path: &str) -> Result<()> {
        Err(ErrorCode::ReadOnly.into())
    }

    /// Returns metadata for `path`. Missing entries fail with [`ErrorCode::NotFound`].
    fn stat(&self, path: &str) -> Result<Stat>;
}

/// Recognizes one archive format and opens archives of it.
pub trait Archiver: Send + Sync {
    fn info(&self) -> &ArchiveInfo;

    /// Opens `io` (named `name` for diagnostics) as this format.
    /// Data that isn't in this format fails with [`ErrorCode::Unsupported`].
    fn open(&self, io: Box<dyn Io>, name: &str, for_writing: bool) -> Result<Box<dyn Archive>>;
}
