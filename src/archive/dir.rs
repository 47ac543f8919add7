//! A directory on the host system mounted as an archive.
//!
//! Paths are confined to the root directory: they arrive sanitized, so no
//! element can climb out with `..`. This is the only archive that supports writing.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::archive::Stat;
use crate::core::io::{NativeIo, OpenMode};
use crate::core::{Archive, ErrorCode, Io, Result, utils};

/// Maps sanitized archive paths onto a host directory.
///
/// ### Usage notes:
/// - Symlinks are reported by `stat` as such; whether they may be followed is
///   decided by the `Vfs`, not here.
/// - `remove()` removes a link, not its target.
/// - Directory listings are sorted.
#[derive(Debug)]
pub struct DirArchive {
    root: PathBuf, // host path of the mounted directory
}

impl DirArchive {
    /// Opens the host directory `root`.
    /// Fails with [`ErrorCode::NotFound`] if it doesn't exist and with
    /// [`ErrorCode::Unsupported`] if it isn't a directory.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if root.as_os_str().is_empty() {
            return Err(ErrorCode::InvalidArgument).context("empty directory name");
        }
        let metadata =
            std::fs::metadata(root).with_context(|| format!("cannot open {}", root.display()))?;
        if !metadata.is_dir() {
            return Err(ErrorCode::Unsupported)
                .with_context(|| format!("{} is not a directory", root.display()));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn to_host(&self, path: &str) -> PathBuf {
        utils::to_host(&self.root, path)
    }
}

impl Archive for DirArchive {
    fn enumerate(&self, dir: &str) -> Result<Vec<String>> {
        let host = self.to_host(dir);
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&host).with_context(|| format!("cannot list {}", host.display()))? {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(name) => tracing::trace!(?name, "skipping a name that is not valid UTF-8"),
            }
        }
        names.sort();
        Ok(names)
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Io>> {
        Ok(Box::new(NativeIo::open(self.to_host(path), OpenMode::Read)?))
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn Io>> {
        Ok(Box::new(NativeIo::open(self.to_host(path), OpenMode::Write)?))
    }

    fn open_append(&self, path: &str) -> Result<Box<dyn Io>> {
        Ok(Box::new(NativeIo::open(self.to_host(path), OpenMode::Append)?))
    }

    fn remove(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(ErrorCode::Permission).context("cannot remove the root of a mounted directory");
        }
        let host = self.to_host(path);
        utils::remove_on_host(&host).with_context(|| format!("cannot remove {}", host.display()))
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let host = self.to_host(path);
        std::fs::create_dir(&host).with_context(|| format!("cannot create {}", host.display()))
    }

    fn stat(&self, path: &str) -> Result<Stat> {
        let host = self.to_host(path);
        let metadata = std::fs::symlink_metadata(&host)
            .with_context(|| format!("cannot stat {}", host.display()))?;
        Ok(Stat::from_metadata(&metadata))
    }
}
