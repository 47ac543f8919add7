//! Host specific directory discovery.
//!
//! Directory strings returned from here always end with the platform's directory
//! separator, so callers can append file names directly.

use std::ffi::OsStr;
use std::path::{MAIN_SEPARATOR, Path, PathBuf};

use anyhow::Context;
use directories_next::BaseDirs;

use crate::core::{ErrorCode, Result};

/// File system types that are treated as optical media.
const CDROM_FS_TYPES: [&str; 4] = ["iso9660", "udf", "auto", "supermount"];

/// The separator the host uses between path elements.
pub fn dir_separator() -> char {
    MAIN_SEPARATOR
}

/// Renders `path` as a string ending with the directory separator.
pub fn with_trailing_separator(path: &Path) -> String {
    let mut dir = path.to_string_lossy().into_owned();
    if !dir.ends_with(dir_separator()) {
        dir.push(dir_separator());
    }
    dir
}

/// Finds the directory that holds the running executable.
///
/// 1. An `argv0` with a directory part names it directly.
/// 2. Otherwise the OS is asked for the executable's path.
/// 3. Otherwise `$PATH` is searched for `argv0`.
pub fn calc_base_dir(argv0: Option<&str>) -> Result<String> {
    if let Some(argv0) = argv0 {
        if let Some(idx) = argv0.rfind(dir_separator()) {
            let dir = &argv0[..=idx];
            match Path::new(dir).canonicalize() {
                Ok(dir) => return Ok(with_trailing_separator(&dir)),
                Err(err) => tracing::debug!(dir, %err, "cannot resolve the directory of argv[0]"),
            }
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            return Ok(with_trailing_separator(dir));
        }
    }

    base_dir_from_path(argv0, std::env::var_os("PATH").as_deref())
}

/// The `$PATH` fallback of [`calc_base_dir`]; `paths` is the variable's value.
fn base_dir_from_path(argv0: Option<&str>, paths: Option<&OsStr>) -> Result<String> {
    let Some(argv0) = argv0 else {
        return Err(ErrorCode::Argv0IsNull).context("cannot find the base dir");
    };
    paths
        .and_then(|paths| find_in_path(argv0, paths))
        .map(|dir| with_trailing_separator(&dir))
        .ok_or(ErrorCode::InvalidArgument)
        .with_context(|| format!("cannot find {argv0:?} to compute the base dir"))
}

fn find_in_path(bin: &str, paths: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(paths)
        .filter(|dir| !dir.as_os_str().is_empty())
        .find(|dir| dir.join(bin).is_file())
}

/// The user's home directory: `$HOME` when it names a directory, else the OS account's home.
pub fn calc_user_dir() -> Result<String> {
    if let Some(home) = std::env::var_os("HOME") {
        let home = PathBuf::from(home);
        if home.is_dir() {
            return Ok(with_trailing_separator(&home));
        }
    }
    let base_dirs = BaseDirs::new()
        .ok_or(ErrorCode::OsError)
        .context("cannot determine the home directory")?;
    Ok(with_trailing_separator(base_dirs.home_dir()))
}

/// The per-user directory an application may write its data to.
///
/// `$XDG_DATA_HOME/app` (or `~/.local/share/app`) on Linux,
/// `~/Library/Application Support/app` on macOS and `%APPDATA%\org\app` on Windows.
/// The directory is not created.
pub fn calc_pref_dir(org: &str, app: &str) -> Result<String> {
    let base_dirs = BaseDirs::new()
        .ok_or(ErrorCode::OsError)
        .context("cannot determine the user data directory")?;
    let mut dir = base_dirs.data_dir().to_path_buf();
    if cfg!(windows) {
        dir.push(org);
    }
    dir.push(app);
    Ok(with_trailing_separator(&dir))
}

/// Mount points of optical media.
pub fn cdrom_dirs() -> Vec<PathBuf> {
    if !cfg!(target_os = "linux") {
        return Vec::new();
    }
    for table in ["/proc/mounts", "/etc/mtab"] {
        match std::fs::read_to_string(table) {
            Ok(text) => return parse_mounts(&text),
            Err(err) => tracing::trace!(table, %err, "cannot read mount table"),
        }
    }
    Vec::new()
}

/// Picks the optical media mount points out of an fstab-formatted mount table.
pub fn parse_mounts(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let dir = fields.next()?;
            let fs_type = fields.next()?;
            CDROM_FS_TYPES
                .contains(&fs_type)
                .then(|| PathBuf::from(unescape_octal(dir)))
        })
        .collect()
}

/// Decodes the `\040` style escapes the kernel uses for blanks in mount tables.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + (b - b'0') as u32);
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
