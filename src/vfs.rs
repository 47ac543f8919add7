//! The virtual file system: an ordered search path for reading and one write dir.
//!
//! Reads resolve a virtual path against every mounted archive in search path
//! order; the first archive that has the path wins. All writes go to the write
//! dir. Virtual paths use `/` and are sanitized before use (see `core::utils`).
//!
//! ### Key Features:
//! - **Mount points**: an archive can be mounted below any virtual directory;
//!   the directories leading to the mount point show up in listings.
//! - **Overlay listings**: `enumerate` merges the directory of every mount.
//! - **Symlink policy**: unless permitted, any symlink on a path makes the
//!   lookup fail with [`ErrorCode::SymlinkForbidden`] and listings hide symlinks.
//! - **Open handle tracking**: an archive can't be unmounted while a file opened
//!   from it is alive.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use crate::archive::{ArchiveInfo, DirArchive, Stat, default_archivers};
use crate::core::io::{MemoryIo, NativeIo, OpenMode};
use crate::core::{Archive, Archiver, ErrorCode, Io, Result, utils};
use crate::file::File;
use crate::platform;

/// Parameters of [`Vfs::set_sane_config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaneConfig {
    pub organization: String,
    pub app_name: String,
    /// Extension (without the dot) of archives to mount automatically, e.g. `"zip"`.
    pub archive_ext: Option<String>,
    pub include_cdroms: bool,
    /// Put the found archives in front of the search path instead of behind it.
    pub archives_first: bool,
}

impl SaneConfig {
    pub fn new(organization: &str, app_name: &str) -> Self {
        Self {
            organization: organization.to_string(),
            app_name: app_name.to_string(),
            archive_ext: None,
            include_cdroms: false,
            archives_first: false,
        }
    }
}

struct Mount {
    name: String,
    mount_point: Option<String>, // sanitized, with a trailing '/'; None for root
    archive: Box<dyn Archive>,
    archiver: Option<String>, // extension of the archiver that opened it; None for host dirs
    handles: Arc<()>,         // one clone per open file
}

impl Mount {
    fn open_handles(&self) -> usize {
        Arc::strong_count(&self.handles) - 1
    }
}

pub struct Vfs {
    base_dir: String,
    user_dir: String,
    pref_dir: Option<String>,
    archivers: Vec<Arc<dyn Archiver>>,
    search_path: Vec<Mount>,
    write_dir: Option<Mount>,
    allow_symlinks: bool,
}

impl Vfs {
    /// Creates a file system with an empty search path and no write dir.
    /// `argv0` helps to find the base dir (see [`platform::calc_base_dir`]).
    pub fn init(argv0: Option<&str>) -> Result<Self> {
        let base_dir = platform::calc_base_dir(argv0)?;
        let user_dir = platform::calc_user_dir()?;
        tracing::debug!(base_dir = %base_dir, user_dir = %user_dir, "file system initialized");
        Ok(Self {
            base_dir,
            user_dir,
            pref_dir: None,
            archivers: default_archivers(),
            search_path: Vec::new(),
            write_dir: None,
            allow_symlinks: false,
        })
    }

    pub fn base_dir(&self) -> &str {
        &self.base_dir
    }

    pub fn user_dir(&self) -> &str {
        &self.user_dir
    }

    pub fn dir_separator(&self) -> char {
        platform::dir_separator()
    }

    pub fn cdrom_dirs(&self) -> Vec<String> {
        platform::cdrom_dirs()
            .iter()
            .map(|dir| dir.to_string_lossy().into_owned())
            .collect()
    }

    /// Returns (and creates, with its parents) the directory where `app` of `org`
    /// should keep its files.
    pub fn pref_dir(&mut self, org: &str, app: &str) -> Result<String> {
        if org.is_empty() {
            return Err(ErrorCode::InvalidArgument).context("organization must not be empty");
        }
        if app.is_empty() {
            return Err(ErrorCode::InvalidArgument).context("application name must not be empty");
        }
        let dir = platform::calc_pref_dir(org, app)?;
        let host = Path::new(&dir);
        if !host.is_dir() {
            std::fs::create_dir_all(host).with_context(|| format!("cannot create pref dir {dir}"))?;
            tracing::debug!(pref_dir = %dir, "created pref dir");
        }
        self.pref_dir = Some(dir.clone());
        Ok(dir)
    }

    pub fn permit_symbolic_links(&mut self, allow: bool) {
        self.allow_symlinks = allow;
    }

    pub fn symbolic_links_permitted(&self) -> bool {
        self.allow_symlinks
    }

    // ---- archivers ----

    pub fn supported_archive_types(&self) -> Vec<ArchiveInfo> {
        self.archivers.iter().map(|archiver| archiver.info().clone()).collect()
    }

    /// Adds an archive format. Fails with [`ErrorCode::Duplicate`] when one with the
    /// same extension is already registered.
    pub fn register_archiver(&mut self, archiver: Arc<dyn Archiver>) -> Result<()> {
        let ext = archiver.info().extension.clone();
        if ext.is_empty() {
            return Err(ErrorCode::InvalidArgument).context("archiver without an extension");
        }
        if self.find_archiver(&ext).is_some() {
            return Err(ErrorCode::Duplicate).with_context(|| format!("an archiver for {ext} is already registered"));
        }
        tracing::debug!(extension = %ext, "registered archiver");
        self.archivers.push(archiver);
        Ok(())
    }

    /// Removes the archive format for `ext`. Fails while an archive of that format is mounted.
    pub fn deregister_archiver(&mut self, ext: &str) -> Result<()> {
        let idx = self
            .find_archiver(ext)
            .ok_or(ErrorCode::NotFound)
            .with_context(|| format!("no archiver for {ext}"))?;
        let in_use = self
            .search_path
            .iter()
            .chain(self.write_dir.iter())
            .any(|mount| mount.archiver.as_deref().is_some_and(|used| used.eq_ignore_ascii_case(ext)));
        if in_use {
            return Err(ErrorCode::FilesStillOpen).with_context(|| format!("a {ext} archive is still mounted"));
        }
        self.archivers.remove(idx);
        tracing::debug!(extension = ext, "deregistered archiver");
        Ok(())
    }

    fn find_archiver(&self, ext: &str) -> Option<usize> {
        self.archivers
            .iter()
            .position(|archiver| archiver.info().extension.eq_ignore_ascii_case(ext))
    }

    /// Opens `name` as an archive: host directories directly, everything else
    /// through the registered archivers.
    fn open_archive(&self, name: &str, for_writing: bool) -> Result<(Box<dyn Archive>, Option<String>)> {
        if name.is_empty() {
            return Err(ErrorCode::InvalidArgument).context("empty archive name");
        }
        let host = Path::new(name);
        if host.is_dir() {
            return Ok((Box::new(DirArchive::open(host)?), None));
        }
        if for_writing {
            if host.exists() {
                return Err(ErrorCode::ReadOnly).with_context(|| format!("{name} is not a directory"));
            }
            return Err(ErrorCode::NotFound).with_context(|| format!("{name} does not exist"));
        }
        let io = NativeIo::open(host, OpenMode::Read)?;
        self.open_archive_io(Box::new(io), name)
    }

    fn open_archive_io(&self, io: Box<dyn Io>, name: &str) -> Result<(Box<dyn Archive>, Option<String>)> {
        let ext = utils::extension(name);
        let claims_ext = |archiver: &Arc<dyn Archiver>| {
            ext.is_some_and(|ext| archiver.info().extension.eq_ignore_ascii_case(ext))
        };

        // Archivers claiming the extension get the first try; their complaint is
        // the most useful one if nothing accepts the data.
        let mut first_error = None;
        let candidates = self
            .archivers
            .iter()
            .filter(|a| claims_ext(*a))
            .chain(self.archivers.iter().filter(|a| !claims_ext(*a)));
        for archiver in candidates {
            let ext_match = claims_ext(archiver);
            match archiver.open(io.duplicate()?, name, false) {
                Ok(archive) => {
                    tracing::debug!(archive = name, format = %archiver.info().extension, "archive recognized");
                    return Ok((archive, Some(archiver.info().extension.clone())));
                }
                Err(err) if ErrorCode::Unsupported.matches(&err) => {}
                Err(err) => {
                    tracing::trace!(archive = name, format = %archiver.info().extension, error = %err, "archiver failed");
                    if ext_match && first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        Err(first_error.unwrap_or_else(|| anyhow::Error::new(ErrorCode::Unsupported)))
            .with_context(|| format!("cannot open archive {name}"))
    }

    // ---- search path ----

    /// Adds `name` (a host directory or archive file) to the search path below
    /// `mount_point` (`None` or `"/"` for the root).
    ///
    /// Mounting something that is already mounted is a successful no-op.
    pub fn mount(&mut self, name: &str, mount_point: Option<&str>, append: bool) -> Result<()> {
        if self.is_mounted(name) {
            return Ok(());
        }
        let mount_point = utils::sanitize_mount_point(mount_point.unwrap_or("/"))?;
        let (archive, archiver) = self.open_archive(name, false)?;
        self.insert_mount(name, mount_point, archive, archiver, append);
        Ok(())
    }

    /// Same as [`Vfs::mount`] at the root.
    pub fn add_to_search_path(&mut self, name: &str, append: bool) -> Result<()> {
        self.mount(name, None, append)
    }

    /// Mounts an archive read from `io`. `name` identifies the mount and its
    /// extension guides the archiver choice.
    pub fn mount_io(&mut self, io: Box<dyn Io>, name: &str, mount_point: Option<&str>, append: bool) -> Result<()> {
        if name.is_empty() {
            return Err(ErrorCode::InvalidArgument).context("empty archive name");
        }
        if self.is_mounted(name) {
            return Ok(());
        }
        let mount_point = utils::sanitize_mount_point(mount_point.unwrap_or("/"))?;
        let (archive, archiver) = self.open_archive_io(io, name)?;
        self.insert_mount(name, mount_point, archive, archiver, append);
        Ok(())
    }

    /// Mounts an archive held in memory.
    pub fn mount_memory<D: Into<Arc<[u8]>>>(
        &mut self,
        data: D,
        name: &str,
        mount_point: Option<&str>,
        append: bool,
    ) -> Result<()> {
        self.mount_io(Box::new(MemoryIo::new(data)), name, mount_point, append)
    }

    /// Mounts an archive read through a file opened with [`Vfs::open_read`], such
    /// as a zip stored inside another mounted archive. The mount the file came
    /// from stays busy until this one is unmounted.
    pub fn mount_handle(
        &mut self,
        file: File,
        name: &str,
        mount_point: Option<&str>,
        append: bool,
    ) -> Result<()> {
        let io = file.into_io()?;
        self.mount_io(io, name, mount_point, append)
    }

    fn is_mounted(&self, name: &str) -> bool {
        self.search_path.iter().any(|mount| mount.name == name)
    }

    fn insert_mount(
        &mut self,
        name: &str,
        mount_point: Option<String>,
        archive: Box<dyn Archive>,
        archiver: Option<String>,
        append: bool,
    ) {
        tracing::debug!(name, mount_point = ?mount_point, append, "mounted");
        let mount = Mount {
            name: name.to_string(),
            mount_point,
            archive,
            archiver,
            handles: Arc::new(()),
        };
        if append {
            self.search_path.push(mount);
        } else {
            self.search_path.insert(0, mount);
        }
    }

    /// Removes `name` from the search path.
    pub fn unmount(&mut self, name: &str) -> Result<()> {
        let idx = self
            .search_path
            .iter()
            .position(|mount| mount.name == name)
            .ok_or(ErrorCode::NotMounted)
            .with_context(|| format!("{name} is not mounted"))?;
        let open = self.search_path[idx].open_handles();
        if open > 0 {
            return Err(ErrorCode::FilesStillOpen).with_context(|| format!("{open} file(s) of {name} are open"));
        }
        self.search_path.remove(idx);
        tracing::debug!(name, "unmounted");
        Ok(())
    }

    /// Same as [`Vfs::unmount`].
    pub fn remove_from_search_path(&mut self, name: &str) -> Result<()> {
        self.unmount(name)
    }

    /// Names of the mounted archives, in search order.
    pub fn search_path(&self) -> Vec<String> {
        self.search_path.iter().map(|mount| mount.name.clone()).collect()
    }

    /// The mount point of `name`: `"/"` for the root, otherwise like `"a/b/"`.
    pub fn mount_point(&self, name: &str) -> Result<String> {
        self.search_path
            .iter()
            .find(|mount| mount.name == name)
            .map(|mount| mount.mount_point.clone().unwrap_or_else(|| "/".to_string()))
            .ok_or(ErrorCode::NotMounted)
            .with_context(|| format!("{name} is not mounted"))
    }

    // ---- write dir ----

    /// Sets the host directory all writes go to; `None` disables writing.
    /// Fails while a file opened for writing in the current write dir is alive.
    pub fn set_write_dir(&mut self, dir: Option<&str>) -> Result<()> {
        if let Some(current) = &self.write_dir {
            let open = current.open_handles();
            if open > 0 {
                return Err(ErrorCode::FilesStillOpen)
                    .with_context(|| format!("{open} file(s) are open for writing in {}", current.name));
            }
        }
        self.write_dir = None;
        if let Some(dir) = dir {
            let (archive, archiver) = self.open_archive(dir, true)?;
            self.write_dir = Some(Mount {
                name: dir.to_string(),
                mount_point: None,
                archive,
                archiver,
                handles: Arc::new(()),
            });
        }
        tracing::debug!(write_dir = ?dir, "write dir changed");
        Ok(())
    }

    pub fn write_dir(&self) -> Option<&str> {
        self.write_dir.as_ref().map(|mount| mount.name.as_str())
    }

    fn writable(&self) -> Result<&Mount> {
        self.write_dir
            .as_ref()
            .ok_or(ErrorCode::NoWriteDir)
            .context("no write dir is set")
    }

    // ---- lookups ----

    /// Translates the sanitized virtual `path` into a path inside `mount`.
    ///
    /// Returns `Ok(None)` when `path` lies outside the mount point. Unless symlinks
    /// are permitted, every element of the path is checked and a symlink fails the
    /// lookup. A missing element is fine when it is the last one, or anywhere with
    /// `allow_missing`.
    fn verify_path(&self, mount: &Mount, path: &str, allow_missing: bool) -> Result<Option<String>> {
        let Some(relative) = utils::strip_mount_point(mount.mount_point.as_deref(), path) else {
            return Ok(None);
        };
        if self.allow_symlinks || relative.is_empty() {
            return Ok(Some(relative.to_string()));
        }

        let mut end = 0;
        loop {
            let next = relative[end..].find('/').map(|idx| end + idx);
            let prefix = &relative[..next.unwrap_or(relative.len())];
            match mount.archive.stat(prefix) {
                Ok(stat) if stat.is_symlink() => {
                    return Err(ErrorCode::SymlinkForbidden)
                        .with_context(|| format!("{prefix:?} in {} is a symlink", mount.name));
                }
                Ok(_) => {}
                Err(err) if ErrorCode::NotFound.matches(&err) => {
                    if next.is_none() || allow_missing {
                        break;
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
            match next {
                Some(idx) => end = idx + 1,
                None => break,
            }
        }
        tracing::trace!(path, mount = %mount.name, relative, "path verified");
        Ok(Some(relative.to_string()))
    }

    /// The name of the first mount that has `path`, if any.
    pub fn real_dir(&self, path: &str) -> Option<String> {
        let path = utils::sanitize(path).ok()?;
        self.search_path
            .iter()
            .find(|mount| {
                if utils::part_of_mount_point(mount.mount_point.as_deref(), &path) {
                    return true;
                }
                matches!(
                    self.verify_path(mount, &path, false),
                    Ok(Some(relative)) if mount.archive.stat(&relative).is_ok()
                )
            })
            .map(|mount| mount.name.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.real_dir(path).is_some()
    }

    /// Metadata of the first match for `path` on the search path.
    ///
    /// The root always exists as a directory, read-only unless a write dir is set.
    /// Directories leading to a mount point exist as read-only directories.
    pub fn stat(&self, path: &str) -> Result<Stat> {
        let path = utils::sanitize(path)?;
        if path.is_empty() {
            return Ok(Stat {
                readonly: self.write_dir.is_none(),
                ..Stat::directory()
            });
        }
        let mut failure = None;
        for mount in &self.search_path {
            if utils::part_of_mount_point(mount.mount_point.as_deref(), &path) {
                return Ok(Stat::directory());
            }
            let relative = match self.verify_path(mount, &path, false) {
                Ok(Some(relative)) => relative,
                Ok(None) => continue,
                Err(err) => {
                    failure.get_or_insert(err);
                    continue;
                }
            };
            match mount.archive.stat(&relative) {
                Ok(stat) => return Ok(stat),
                Err(err) if ErrorCode::NotFound.matches(&err) => {}
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        Err(failure.unwrap_or_else(|| anyhow::Error::new(ErrorCode::NotFound)))
            .with_context(|| format!("{path:?} is not on the search path"))
    }

    pub fn is_directory(&self, path: &str) -> bool {
        self.stat(path).is_ok_and(|stat| stat.is_dir())
    }

    pub fn is_symbolic_link(&self, path: &str) -> bool {
        self.stat(path).is_ok_and(|stat| stat.is_symlink())
    }

    /// Last modification time in seconds since the Unix epoch; `None` when the
    /// archive doesn't record it.
    pub fn last_mod_time(&self, path: &str) -> Result<Option<i64>> {
        Ok(self.stat(path)?.modtime)
    }

    /// Lists `dir` across the whole search path: sorted, without duplicates.
    /// A directory that exists nowhere lists as empty.
    pub fn enumerate(&self, dir: &str) -> Result<Vec<String>> {
        let dir = utils::sanitize(dir)?;
        let mut names = BTreeSet::new();
        for mount in &self.search_path {
            if let Some(mount_point) = mount.mount_point.as_deref() {
                if utils::part_of_mount_point(Some(mount_point), &dir) {
                    names.insert(utils::next_mount_point_element(mount_point, &dir).to_string());
                    continue;
                }
            }
            let relative = match self.verify_path(mount, &dir, false) {
                Ok(Some(relative)) => relative,
                Ok(None) => continue,
                Err(err) => {
                    tracing::trace!(dir = %dir, mount = %mount.name, error = %err, "skipping mount");
                    continue;
                }
            };
            let Ok(children) = mount.archive.enumerate(&relative) else {
                continue;
            };
            for name in children {
                if !self.allow_symlinks {
                    let child = utils::join(&relative, &name);
                    if mount.archive.stat(&child).is_ok_and(|stat| stat.is_symlink()) {
                        continue;
                    }
                }
                names.insert(name);
            }
        }
        Ok(names.into_iter().collect())
    }

    // ---- reading ----

    /// Opens `path` for reading from the first mount that has it.
    pub fn open_read(&self, path: &str) -> Result<File> {
        let path = utils::sanitize(path)?;
        let mut failure = None;
        for mount in &self.search_path {
            let relative = match self.verify_path(mount, &path, false) {
                Ok(Some(relative)) => relative,
                Ok(None) => continue,
                Err(err) => {
                    failure.get_or_insert(err);
                    continue;
                }
            };
            match mount.archive.open_read(&relative) {
                Ok(io) => {
                    tracing::trace!(path = %path, mount = %mount.name, "opened for reading");
                    return Ok(File::reader(io, Arc::clone(&mount.handles)));
                }
                Err(err) if ErrorCode::NotFound.matches(&err) => {}
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        Err(failure.unwrap_or_else(|| anyhow::Error::new(ErrorCode::NotFound)))
            .with_context(|| format!("cannot open {path:?} for reading"))
    }

    // ---- writing ----

    /// Creates `path` in the write dir for writing, truncating an existing file.
    pub fn open_write(&self, path: &str) -> Result<File> {
        self.open_for_writing(path, false)
    }

    /// Opens `path` in the write dir for appending, creating it if necessary.
    pub fn open_append(&self, path: &str) -> Result<File> {
        self.open_for_writing(path, true)
    }

    fn open_for_writing(&self, path: &str, append: bool) -> Result<File> {
        let mount = self.writable()?;
        let path = utils::sanitize(path)?;
        let relative = self
            .verify_path(mount, &path, false)?
            .ok_or(ErrorCode::NotFound)?;
        let opened = if append {
            mount.archive.open_append(&relative)
        } else {
            mount.archive.open_write(&relative)
        };
        let io = opened.with_context(|| format!("cannot open {path:?} for writing"))?;
        tracing::trace!(path = %path, append, "opened for writing");
        Ok(File::writer(io, Arc::clone(&mount.handles)))
    }

    /// Creates the directory `path` and any missing parents in the write dir.
    pub fn mkdir(&self, path: &str) -> Result<()> {
        let mount = self.writable()?;
        let path = utils::sanitize(path)?;
        let relative = self
            .verify_path(mount, &path, true)?
            .ok_or(ErrorCode::NotFound)?;
        if relative.is_empty() {
            return Ok(());
        }

        let mut end = 0;
        loop {
            let next = relative[end..].find('/').map(|idx| end + idx);
            let prefix = &relative[..next.unwrap_or(relative.len())];
            match mount.archive.stat(prefix) {
                Ok(stat) if stat.is_dir() => {}
                Ok(_) => {
                    return Err(ErrorCode::Duplicate)
                        .with_context(|| format!("{prefix:?} exists and is not a directory"));
                }
                Err(err) if ErrorCode::NotFound.matches(&err) => {
                    mount.archive.mkdir(prefix)?;
                    tracing::debug!(dir = prefix, "created directory");
                }
                Err(err) => return Err(err),
            }
            match next {
                Some(idx) => end = idx + 1,
                None => return Ok(()),
            }
        }
    }

    /// Deletes a file or an empty directory from the write dir.
    pub fn delete(&self, path: &str) -> Result<()> {
        let mount = self.writable()?;
        let path = utils::sanitize(path)?;
        let relative = self
            .verify_path(mount, &path, false)?
            .ok_or(ErrorCode::NotFound)?;
        mount
            .archive
            .remove(&relative)
            .with_context(|| format!("cannot delete {path:?}"))
    }

    // ---- configuration ----

    /// Sets up a typical game layout:
    ///
    /// 1. the pref dir becomes the write dir and the first entry of the search path;
    /// 2. the base dir is appended;
    /// 3. optionally, CD-ROM mount points are appended;
    /// 4. optionally, every file with the extension `archive_ext` in the root of the
    ///    search path is mounted, in front or behind.
    ///
    /// Only a failure to set the write dir is an error; other steps are skipped with a warning.
    pub fn set_sane_config(&mut self, config: &SaneConfig) -> Result<()> {
        let pref_dir = self.pref_dir(&config.organization, &config.app_name)?;
        self.apply_sane_config(&pref_dir, config)
    }

    fn apply_sane_config(&mut self, pref_dir: &str, config: &SaneConfig) -> Result<()> {
        self.set_write_dir(Some(pref_dir))
            .map_err(|err| err.context(ErrorCode::NoWriteDir))
            .with_context(|| format!("cannot write to {pref_dir}"))?;

        if let Err(err) = self.mount(pref_dir, None, false) {
            tracing::warn!(dir = %pref_dir, error = %err, "cannot mount the pref dir");
        }
        let base_dir = self.base_dir.clone();
        if let Err(err) = self.mount(&base_dir, None, true) {
            tracing::warn!(dir = %base_dir, error = %err, "cannot mount the base dir");
        }

        if config.include_cdroms {
            for dir in self.cdrom_dirs() {
                if let Err(err) = self.mount(&dir, None, true) {
                    tracing::warn!(dir = %dir, error = %err, "cannot mount a CD-ROM");
                }
            }
        }

        if let Some(archive_ext) = config.archive_ext.as_deref() {
            let found: Vec<String> = self
                .enumerate("")?
                .into_iter()
                .filter(|name| utils::extension(name).is_some_and(|ext| ext.eq_ignore_ascii_case(archive_ext)))
                .filter_map(|name| {
                    let dir = self.real_dir(&name)?;
                    Some(Path::new(&dir).join(&name).to_string_lossy().into_owned())
                })
                .collect();
            for archive in found {
                if let Err(err) = self.mount(&archive, None, !config.archives_first) {
                    tracing::warn!(archive = %archive, error = %err, "cannot mount an archive");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{FileType, GrpArchiver};
    use std::path::PathBuf;
    use tempdir::TempDir;

    fn setup_test_env() -> (TempDir, Vfs) {
        let temp_dir = TempDir::new("vfs").unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("base/data")).unwrap();
        std::fs::write(root.join("base/data/config.txt"), b"from base").unwrap();
        std::fs::write(root.join("base/readme.txt"), b"base readme").unwrap();
        std::fs::create_dir_all(root.join("mod/data")).unwrap();
        std::fs::write(root.join("mod/data/config.txt"), b"from mod").unwrap();
        std::fs::create_dir_all(root.join("write")).unwrap();
        let vfs = Vfs::init(None).unwrap();
        (temp_dir, vfs)
    }

    fn host(temp_dir: &TempDir, name: &str) -> String {
        temp_dir.path().join(name).to_string_lossy().into_owned()
    }

    fn read_string(vfs: &Vfs, path: &str) -> Result<String> {
        let bytes = vfs.open_read(path)?.read_to_end()?;
        Ok(String::from_utf8(bytes)?)
    }

    fn build_grp(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = b"KenSilverman".to_vec();
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (name, data) in entries {
            let mut raw = [0u8; 12];
            raw[..name.len()].copy_from_slice(name.as_bytes());
            out.extend_from_slice(&raw);
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        }
        for (_, data) in entries {
            out.extend_from_slice(data);
        }
        out
    }

    mod creations {
        use super::*;

        #[test]
        fn test_init_dirs() {
            let (_temp_dir, vfs) = setup_test_env();
            assert!(vfs.base_dir().ends_with(platform::dir_separator()));
            assert!(vfs.user_dir().ends_with(platform::dir_separator()));
            assert!(vfs.search_path().is_empty());
            assert_eq!(vfs.write_dir(), None);
            assert!(!vfs.symbolic_links_permitted());
        }

        #[test]
        fn test_root_stat() -> Result<()> {
            let (temp_dir, mut vfs) = setup_test_env();
            let stat = vfs.stat("/")?;
            assert!(stat.is_dir());
            assert!(stat.readonly);

            vfs.set_write_dir(Some(&host(&temp_dir, "write")))?;
            assert!(!vfs.stat("")?.readonly);
            Ok(())
        }

        #[test]
        fn test_pref_dir_arguments() {
            let (_temp_dir, mut vfs) = setup_test_env();
            assert!(ErrorCode::InvalidArgument.matches(&vfs.pref_dir("", "app").unwrap_err()));
            assert!(ErrorCode::InvalidArgument.matches(&vfs.pref_dir("org", "").unwrap_err()));
        }
    }

    mod mounting {
        use super::*;

        #[test]
        fn test_mount_order() -> Result<()> {
            let (temp_dir, mut vfs) = setup_test_env();
            let base = host(&temp_dir, "base");
            let modded = host(&temp_dir, "mod");

            vfs.mount(&base, None, true)?;
            assert_eq!(read_string(&vfs, "data/config.txt")?, "from base");

            vfs.mount(&modded, None, false)?;
            assert_eq!(vfs.search_path(), vec![modded.clone(), base.clone()]);
            assert_eq!(read_string(&vfs, "data/config.txt")?, "from mod");
            assert_eq!(read_string(&vfs, "readme.txt")?, "base readme");
            assert_eq!(vfs.real_dir("data/config.txt"), Some(modded.clone()));
            assert_eq!(vfs.real_dir("readme.txt"), Some(base.clone()));
            assert_eq!(vfs.real_dir("nope.txt"), None);
            Ok(())
        }

        #[test]
        fn test_mount_twice_is_noop() -> Result<()> {
            let (temp_dir, mut vfs) = setup_test_env();
            let base = host(&temp_dir, "base");
            vfs.add_to_search_path(&base, true)?;
            vfs.add_to_search_path(&base, false)?;
            assert_eq!(vfs.search_path(), vec![base]);
            Ok(())
        }

        #[test]
        fn test_mount_missing() {
            let (temp_dir, mut vfs) = setup_test_env();
            let err = vfs.mount(&host(&temp_dir, "nope"), None, true).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::NotFound);
        }

        #[test]
        fn test_mount_unknown_format() -> Result<()> {
            let (temp_dir, mut vfs) = setup_test_env();
            let err = vfs.mount(&host(&temp_dir, "base/readme.txt"), None, true).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::Unsupported);
            Ok(())
        }

        #[test]
        fn test_mount_bad_mount_point() {
            let (temp_dir, mut vfs) = setup_test_env();
            let err = vfs.mount(&host(&temp_dir, "base"), Some("../up"), true).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::BadFilename);
            assert!(vfs.search_path().is_empty());
        }

        #[test]
        fn test_mount_point() -> Result<()> {
            let (temp_dir, mut vfs) = setup_test_env();
            let base = host(&temp_dir, "base");
            let modded = host(&temp_dir, "mod");
            vfs.mount(&base, None, true)?;
            vfs.mount(&modded, Some("/mods/first/"), true)?;
            assert_eq!(vfs.mount_point(&base)?, "/");
            assert_eq!(vfs.mount_point(&modded)?, "mods/first/");
            assert!(ErrorCode::NotMounted.matches(&vfs.mount_point("nope").unwrap_err()));

            assert_eq!(read_string(&vfs, "mods/first/data/config.txt")?, "from mod");
            assert_eq!(read_string(&vfs, "data/config.txt")?, "from base");
            assert!(vfs.is_directory("mods"));
            assert!(vfs.is_directory("mods/first"));
            assert!(vfs.stat("mods")?.readonly);
            assert_eq!(vfs.real_dir("mods"), Some(modded.clone()));
            assert!(!vfs.exists("mods/second"));
            Ok(())
        }

        #[test]
        fn test_unmount() -> Result<()> {
            let (temp_dir, mut vfs) = setup_test_env();
            let base = host(&temp_dir, "base");
            vfs.mount(&base, None, true)?;

            let file = vfs.open_read("readme.txt")?;
            let err = vfs.unmount(&base).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::FilesStillOpen);

            drop(file);
            vfs.remove_from_search_path(&base)?;
            assert!(vfs.search_path().is_empty());
            assert!(ErrorCode::NotMounted.matches(&vfs.unmount(&base).unwrap_err()));
            Ok(())
        }

        #[test]
        fn test_mount_memory_grp() -> Result<()> {
            let (_temp_dir, mut vfs) = setup_test_env();
            let grp = build_grp(&[("GAME.CON", b"define"), ("E1L1.MAP", b"map")]);
            vfs.mount_memory(grp, "duke3d.grp", Some("duke"), true)?;
            assert_eq!(vfs.enumerate("duke")?, vec!["E1L1.MAP", "GAME.CON"]);
            assert_eq!(read_string(&vfs, "duke/GAME.CON")?, "define");
            assert_eq!(vfs.real_dir("duke/E1L1.MAP"), Some("duke3d.grp".to_string()));
            assert_eq!(vfs.last_mod_time("duke/E1L1.MAP")?, None);
            Ok(())
        }

        #[test]
        fn test_mount_handle_grp_inside_zip() -> Result<()> {
            use crate::archive::zip::tests::{build_zip, file};

            let (_temp_dir, mut vfs) = setup_test_env();
            let grp = build_grp(&[("GAME.CON", b"define")]);
            let zip = build_zip(b"", &[file("paks/duke3d.grp", &grp), file("readme.txt", b"outer")]);
            vfs.mount_memory(zip, "outer.zip", None, true)?;

            let inner = vfs.open_read("paks/duke3d.grp")?;
            vfs.mount_handle(inner, "duke3d.grp", Some("duke"), true)?;
            assert_eq!(vfs.search_path(), vec!["outer.zip", "duke3d.grp"]);
            assert_eq!(read_string(&vfs, "duke/GAME.CON")?, "define");
            assert_eq!(read_string(&vfs, "readme.txt")?, "outer");

            let err = vfs.unmount("outer.zip").unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::FilesStillOpen);
            vfs.unmount("duke3d.grp")?;
            vfs.unmount("outer.zip")?;
            assert!(vfs.search_path().is_empty());
            Ok(())
        }

        #[test]
        fn test_mount_handle_refuses_writers() -> Result<()> {
            let (temp_dir, mut vfs) = setup_test_env();
            vfs.set_write_dir(Some(&host(&temp_dir, "write")))?;
            let writer = vfs.open_write("new.grp")?;
            let err = vfs.mount_handle(writer, "new.grp", None, true).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::OpenForWriting);
            assert!(vfs.search_path().is_empty());
            Ok(())
        }

        #[test]
        fn test_archive_without_matching_extension() -> Result<()> {
            let (temp_dir, mut vfs) = setup_test_env();
            let path = temp_dir.path().join("groupfile.dat");
            std::fs::write(&path, build_grp(&[("A.TXT", b"a")]))?;
            vfs.mount(&path.to_string_lossy(), None, true)?;
            assert_eq!(read_string(&vfs, "A.TXT")?, "a");
            Ok(())
        }

        #[test]
        fn test_corrupt_archive_reports_matching_archiver() {
            let (_temp_dir, mut vfs) = setup_test_env();
            let mut grp = build_grp(&[("A.TXT", b"abcdef")]);
            grp.truncate(grp.len() - 2);
            let err = vfs.mount_memory(grp, "broken.grp", None, true).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::Corrupt);
        }
    }

    mod archivers {
        use super::*;

        #[test]
        fn test_default_archivers() {
            let (_temp_dir, vfs) = setup_test_env();
            let types: Vec<String> = vfs
                .supported_archive_types()
                .into_iter()
                .map(|info| info.extension)
                .collect();
            assert_eq!(types, vec!["ZIP", "GRP"]);
        }

        #[test]
        fn test_register_and_deregister() -> Result<()> {
            let (_temp_dir, mut vfs) = setup_test_env();
            let err = vfs.register_archiver(Arc::new(GrpArchiver::new())).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::Duplicate);

            vfs.mount_memory(build_grp(&[("A", b"1")]), "x.grp", None, true)?;
            let err = vfs.deregister_archiver("grp").unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::FilesStillOpen);

            vfs.unmount("x.grp")?;
            vfs.deregister_archiver("grp")?;
            assert!(ErrorCode::NotFound.matches(&vfs.deregister_archiver("GRP").unwrap_err()));
            let err = vfs.mount_memory(build_grp(&[("A", b"1")]), "y.grp", None, true).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::Unsupported);

            vfs.register_archiver(Arc::new(GrpArchiver::new()))?;
            vfs.mount_memory(build_grp(&[("A", b"1")]), "y.grp", None, true)?;
            Ok(())
        }
    }

    mod enumeration {
        use super::*;

        #[test]
        fn test_enumerate_union() -> Result<()> {
            let (temp_dir, mut vfs) = setup_test_env();
            std::fs::write(temp_dir.path().join("mod/data/extra.txt"), b"x")?;
            vfs.mount(&host(&temp_dir, "base"), None, true)?;
            vfs.mount(&host(&temp_dir, "mod"), None, true)?;
            assert_eq!(vfs.enumerate("/")?, vec!["data", "readme.txt"]);
            assert_eq!(vfs.enumerate("data")?, vec!["config.txt", "extra.txt"]);
            assert!(vfs.enumerate("missing")?.is_empty());
            Ok(())
        }

        #[test]
        fn test_enumerate_mount_point_elements() -> Result<()> {
            let (temp_dir, mut vfs) = setup_test_env();
            vfs.mount(&host(&temp_dir, "base"), None, true)?;
            vfs.mount(&host(&temp_dir, "mod"), Some("mods/one"), true)?;
            assert_eq!(vfs.enumerate("")?, vec!["data", "mods", "readme.txt"]);
            assert_eq!(vfs.enumerate("mods")?, vec!["one"]);
            assert_eq!(vfs.enumerate("mods/one")?, vec!["data"]);
            Ok(())
        }

        #[test]
        fn test_enumerate_bad_path() {
            let (_temp_dir, vfs) = setup_test_env();
            assert!(ErrorCode::BadFilename.matches(&vfs.enumerate("../x").unwrap_err()));
        }
    }

    #[cfg(unix)]
    mod symlinks {
        use super::*;

        fn setup_links() -> (TempDir, Vfs) {
            let (temp_dir, mut vfs) = setup_test_env();
            let base = temp_dir.path().join("base");
            std::os::unix::fs::symlink(base.join("readme.txt"), base.join("link.txt")).unwrap();
            std::os::unix::fs::symlink(base.join("data"), base.join("linkdir")).unwrap();
            vfs.mount(&base.to_string_lossy(), None, true).unwrap();
            (temp_dir, vfs)
        }

        #[test]
        fn test_symlinks_forbidden() {
            let (_temp_dir, vfs) = setup_links();
            let err = vfs.open_read("link.txt").err().unwrap();
            assert_eq!(ErrorCode::of(&err), ErrorCode::SymlinkForbidden);
            let err = vfs.open_read("linkdir/config.txt").err().unwrap();
            assert_eq!(ErrorCode::of(&err), ErrorCode::SymlinkForbidden);
            assert!(!vfs.exists("link.txt"));
            assert_eq!(vfs.enumerate("").unwrap(), vec!["data", "readme.txt"]);
        }

        #[test]
        fn test_symlinks_permitted() -> Result<()> {
            let (_temp_dir, mut vfs) = setup_links();
            vfs.permit_symbolic_links(true);
            assert_eq!(read_string(&vfs, "link.txt")?, "base readme");
            assert_eq!(read_string(&vfs, "linkdir/config.txt")?, "from base");
            assert!(vfs.is_symbolic_link("link.txt"));
            assert_eq!(vfs.stat("link.txt")?.file_type, FileType::Symlink);
            assert_eq!(vfs.enumerate("")?, vec!["data", "link.txt", "linkdir", "readme.txt"]);
            Ok(())
        }
    }

    mod writing {
        use super::*;

        #[test]
        fn test_no_write_dir() {
            let (_temp_dir, vfs) = setup_test_env();
            assert!(ErrorCode::NoWriteDir.matches(&vfs.open_write("a.txt").err().unwrap()));
            assert!(ErrorCode::NoWriteDir.matches(&vfs.mkdir("a").unwrap_err()));
            assert!(ErrorCode::NoWriteDir.matches(&vfs.delete("a").unwrap_err()));
        }

        #[test]
        fn test_write_dir_must_be_directory() {
            let (temp_dir, mut vfs) = setup_test_env();
            let err = vfs.set_write_dir(Some(&host(&temp_dir, "base/readme.txt"))).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::ReadOnly);
            let err = vfs.set_write_dir(Some(&host(&temp_dir, "missing"))).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::NotFound);
            assert_eq!(vfs.write_dir(), None);
        }

        #[test]
        fn test_write_read_append_delete() -> Result<()> {
            let (temp_dir, mut vfs) = setup_test_env();
            let write = host(&temp_dir, "write");
            vfs.set_write_dir(Some(&write))?;
            assert_eq!(vfs.write_dir(), Some(write.as_str()));
            vfs.mount(&write, None, false)?;

            vfs.mkdir("saves/slot1")?;
            assert!(temp_dir.path().join("write/saves/slot1").is_dir());
            vfs.mkdir("saves/slot1")?;

            let mut file = vfs.open_write("saves/slot1/game.sav")?;
            file.write(b"level 1")?;
            file.close()?;
            let mut file = vfs.open_append("saves/slot1/game.sav")?;
            file.write(b", level 2")?;
            file.close()?;
            assert_eq!(read_string(&vfs, "saves/slot1/game.sav")?, "level 1, level 2");

            let err = vfs.delete("saves/slot1").unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::DirNotEmpty);
            vfs.delete("saves/slot1/game.sav")?;
            vfs.delete("saves/slot1")?;
            assert!(!vfs.exists("saves/slot1"));
            assert!(ErrorCode::NotFound.matches(&vfs.delete("saves/slot1").unwrap_err()));
            Ok(())
        }

        #[test]
        fn test_mkdir_over_file() -> Result<()> {
            let (temp_dir, mut vfs) = setup_test_env();
            vfs.set_write_dir(Some(&host(&temp_dir, "write")))?;
            vfs.open_write("file")?.close()?;
            let err = vfs.mkdir("file/sub").unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::Duplicate);
            Ok(())
        }

        #[test]
        fn test_write_into_missing_dir() -> Result<()> {
            let (temp_dir, mut vfs) = setup_test_env();
            vfs.set_write_dir(Some(&host(&temp_dir, "write")))?;
            let err = vfs.open_write("nodir/file.txt").err().unwrap();
            assert_eq!(ErrorCode::of(&err), ErrorCode::NotFound);
            Ok(())
        }

        #[test]
        fn test_set_write_dir_with_open_files() -> Result<()> {
            let (temp_dir, mut vfs) = setup_test_env();
            vfs.set_write_dir(Some(&host(&temp_dir, "write")))?;
            let file = vfs.open_write("busy.txt")?;
            let err = vfs.set_write_dir(None).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::FilesStillOpen);
            file.close()?;
            vfs.set_write_dir(None)?;
            assert_eq!(vfs.write_dir(), None);
            Ok(())
        }
    }

    mod sane_config {
        use super::*;

        fn setup_sane_env() -> (TempDir, Vfs, String) {
            let (temp_dir, mut vfs) = setup_test_env();
            vfs.base_dir = platform::with_trailing_separator(&temp_dir.path().join("base"));
            let pref = platform::with_trailing_separator(&temp_dir.path().join("write"));
            (temp_dir, vfs, pref)
        }

        #[test]
        fn test_sane_config_layout() -> Result<()> {
            let (_temp_dir, mut vfs, pref) = setup_sane_env();
            vfs.apply_sane_config(&pref, &SaneConfig::new("org", "app"))?;

            assert_eq!(vfs.write_dir(), Some(pref.as_str()));
            let base = vfs.base_dir().to_string();
            assert_eq!(vfs.search_path(), vec![pref.clone(), base]);

            vfs.open_write("settings.cfg")?.write(b"fullscreen=1")?;
            assert_eq!(vfs.real_dir("settings.cfg"), Some(pref));
            assert_eq!(read_string(&vfs, "readme.txt")?, "base readme");
            Ok(())
        }

        #[test]
        fn test_sane_config_archives() -> Result<()> {
            let (temp_dir, mut vfs, pref) = setup_sane_env();
            std::fs::write(temp_dir.path().join("base/pak0.zip"), b"not really a zip")?;
            std::fs::write(temp_dir.path().join("base/pak1.GRP"), build_grp(&[("PAK1.TXT", b"1")]))?;
            std::fs::write(temp_dir.path().join("base/pak2.grp"), build_grp(&[("PAK2.TXT", b"2")]))?;

            let mut config = SaneConfig::new("org", "app");
            config.archive_ext = Some("grp".to_string());
            config.archives_first = true;
            vfs.apply_sane_config(&pref, &config)?;

            let base = vfs.base_dir().to_string();
            let in_base = |name: &str| PathBuf::from(&base).join(name).to_string_lossy().into_owned();
            assert_eq!(
                vfs.search_path(),
                vec![in_base("pak2.grp"), in_base("pak1.GRP"), pref.clone(), base.clone()]
            );
            assert_eq!(read_string(&vfs, "PAK1.TXT")?, "1");
            assert_eq!(read_string(&vfs, "PAK2.TXT")?, "2");
            Ok(())
        }

        #[test]
        fn test_sane_config_archives_last() -> Result<()> {
            let (temp_dir, mut vfs, pref) = setup_sane_env();
            std::fs::write(temp_dir.path().join("base/pak1.grp"), build_grp(&[("PAK1.TXT", b"1")]))?;

            let mut config = SaneConfig::new("org", "app");
            config.archive_ext = Some("GRP".to_string());
            vfs.apply_sane_config(&pref, &config)?;

            let base = vfs.base_dir().to_string();
            let grp = PathBuf::from(&base).join("pak1.grp").to_string_lossy().into_owned();
            assert_eq!(vfs.search_path(), vec![pref, base, grp]);
            Ok(())
        }

        #[test]
        fn test_sane_config_needs_names() {
            let (_temp_dir, mut vfs, _pref) = setup_sane_env();
            let err = vfs.set_sane_config(&SaneConfig::new("", "app")).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::InvalidArgument);
            assert_eq!(vfs.write_dir(), None);
            assert!(vfs.search_path().is_empty());
        }

        #[test]
        fn test_sane_config_with_cdroms() -> Result<()> {
            let (_temp_dir, mut vfs, pref) = setup_sane_env();
            let config = SaneConfig {
                include_cdroms: true,
                ..SaneConfig::new("org", "app")
            };
            vfs.apply_sane_config(&pref, &config)?;
            let search_path = vfs.search_path();
            assert_eq!(search_path[..2], [pref.clone(), vfs.base_dir().to_string()]);
            let cdroms = vfs.cdrom_dirs();
            assert!(search_path[2..].iter().all(|mounted| cdroms.contains(mounted)));
            Ok(())
        }

        #[test]
        fn test_sane_config_bad_write_dir() {
            let (temp_dir, mut vfs, _pref) = setup_sane_env();
            let missing = host(&temp_dir, "missing");
            let err = vfs.apply_sane_config(&missing, &SaneConfig::new("org", "app")).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::NoWriteDir);
            assert!(vfs.search_path().is_empty());
        }
    }
}
