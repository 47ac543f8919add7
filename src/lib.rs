//! A search-path virtual file system for games and other data-heavy programs.
//! Reads go through an ordered list of mounted directories and archives; writes
//! are confined to a single write directory.
//!
//! ### Overview
//!
//! `physfs-kit` lets a program address its data with portable, sandboxed paths
//! (`"maps/e1m1.map"`) no matter whether the file lives in the install directory,
//! in a zip archive or in the user's preferences directory.
//!
//! **Key ideas**:
//! - **Search path**: directories and archives are mounted in order, optionally
//!   below a mount point; the first one that has a file serves it.
//! - **Write dir**: all writing happens in one host directory, usually the pref dir.
//! - **Safety**: paths are sanitized (`..`, `:` and `\` are rejected) and symlinks
//!   are refused unless explicitly permitted.
//! - **Archives**: ZIP and GRP out of the box; new formats plug in through [`Archiver`].
//! - **Platform dirs**: base dir (where the program lives), user dir and pref dir.
//!
//! ### Example:
//! ```no_run
//! use physfs_kit::{SaneConfig, Vfs};
//!
//! let mut vfs = Vfs::init(std::env::args().next().as_deref()).unwrap();
//! vfs.set_sane_config(&SaneConfig::new("icculus.org", "mygame")).unwrap();
//!
//! let mut save = vfs.open_write("save.dat").unwrap();
//! save.write(b"level=3").unwrap();
//! save.close().unwrap();
//!
//! for name in vfs.enumerate("/").unwrap() {
//!     println!("{name}");
//! }
//! ```

pub mod archive;
pub mod core;
pub mod file;
pub mod global;
pub mod platform;
pub mod vfs;

pub use archive::{ArchiveInfo, FileType, Stat};
pub use crate::core::io::{MemoryIo, NativeIo, OpenMode};
pub use crate::core::{Archive, Archiver, ErrorCode, Io, Result};
pub use file::File;
pub use vfs::{SaneConfig, Vfs};

/// A library version.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The version of the library the program runs with.
pub fn linked_version() -> Version {
    Version {
        major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    }
}
