//! Platform-independent path handling.
//!
//! Virtual paths always use `/`. A sanitized path has no leading, trailing or
//! doubled separators and the empty string is the root. Mount points are kept in
//! sanitized form plus one trailing `/` (`"a/b/"`); the root mount point is `None`.

use std::path::Path;

use anyhow::Context;

use crate::core::{ErrorCode, Result};

/// Sanitizes a virtual path.
///
/// Leading, trailing and repeated `/` are dropped. `.` and `..` elements and
/// any `:` or `\` are rejected with [`ErrorCode::BadFilename`].
pub fn sanitize(path: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in path.split('/').filter(|part| !part.is_empty()) {
        if part == "." || part == ".." || part.contains([':', '\\']) {
            return Err(ErrorCode::BadFilename).with_context(|| format!("insecure path {path:?}"));
        }
        parts.push(part);
    }
    Ok(parts.join("/"))
}

/// Sanitizes a mount point. Root (`"/"`, `""`) becomes `None`.
pub fn sanitize_mount_point(mount_point: &str) -> Result<Option<String>> {
    let sanitized = sanitize(mount_point)?;
    if sanitized.is_empty() {
        Ok(None)
    } else {
        Ok(Some(sanitized + "/"))
    }
}

/// Returns true if `path` is a proper ancestor directory of `mount_point`.
///
/// For the mount point `a/b/c/`, the paths `""`, `a` and `a/b` qualify, while
/// `a/b/c`, `a/b/c/d` and `a/bc` do not.
pub fn part_of_mount_point(mount_point: Option<&str>, path: &str) -> bool {
    let Some(mount_point) = mount_point else {
        return false;
    };
    if path.is_empty() {
        return true;
    }
    if path.len() + 1 >= mount_point.len() {
        return false;
    }
    mount_point.starts_with(path) && mount_point.as_bytes()[path.len()] == b'/'
}

/// Returns the part of `path` below `mount_point`, or `None` when `path` lies
/// outside of it.
pub fn strip_mount_point<'a>(mount_point: Option<&str>, path: &'a str) -> Option<&'a str> {
    let Some(mount_point) = mount_point else {
        return Some(path);
    };
    let trimmed = mount_point.trim_end_matches('/');
    if path == trimmed {
        return Some("");
    }
    path.strip_prefix(mount_point)
}

/// Returns the element of `mount_point` right below the ancestor `dir`.
/// `dir` must satisfy [`part_of_mount_point`].
pub fn next_mount_point_element<'a>(mount_point: &'a str, dir: &str) -> &'a str {
    let start = if dir.is_empty() { 0 } else { dir.len() + 1 };
    let rest = &mount_point[start..];
    rest.split('/').next().unwrap_or(rest)
}

/// Joins a sanitized directory and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Returns the directory part of a sanitized path (`""` for top-level entries).
pub fn parent(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..idx])
}

/// Returns the extension after the last `.` of the final path element.
pub fn extension(name: &str) -> Option<&str> {
    let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    file_name.rfind('.').map(|idx| &file_name[idx + 1..])
}

/// Converts a sanitized virtual path into a host path below `root`.
pub fn to_host(root: &Path, path: &str) -> std::path::PathBuf {
    let mut host = root.to_path_buf();
    for part in path.split('/').filter(|part| !part.is_empty()) {
        host.push(part);
    }
    host
}

/// Removes a host file or an empty host directory. Symlinks are removed, not followed.
pub fn remove_on_host(path: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        std::fs::remove_dir(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
