//! An in-memory directory tree for packed archives.
//!
//! Packed formats (GRP, ZIP) read their table of contents once when the archive is
//! opened and keep it in an `EntryTree`. Each node records its type, an optional
//! modification time and a format-specific payload (offsets, compression, ...).
//!
//! ### Invariants
//!
//! 1. **Root existence**: the root `""` is always present and is a directory.
//! 2. **Sanitized keys**: every key is a sanitized virtual path (see `core::utils`).
//! 3. **Parent consistency**: for any entry `a/b/c` there is a directory entry `a/b`.
//!    Parents missing from the table of contents are created implicitly.
//! 4. **Uniqueness**: the first entry recorded for a path wins; later duplicates are ignored.

use std::collections::BTreeMap;

use anyhow::Context;

use crate::archive::{FileType, Stat};
use crate::core::{ErrorCode, Result, utils};

#[derive(Debug, Clone, PartialEq)]
pub struct Node<T> {
    pub file_type: FileType,
    pub modtime: Option<i64>,
    pub size: Option<u64>,
    pub payload: Option<T>,
}

impl<T> Node<T> {
    fn directory(modtime: Option<i64>) -> Node<T> {
        Node {
            file_type: FileType::Directory,
            modtime,
            size: None,
            payload: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn stat(&self) -> Stat {
        Stat {
            size: self.size,
            modtime: self.modtime,
            ..Stat::new(self.file_type)
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntryTree<T> {
    entries: BTreeMap<String, Node<T>>,
}

impl<T> Default for EntryTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EntryTree<T> {
    /// Creates a tree that contains only the root directory.
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(String::new(), Node::directory(None));
        Self { entries }
    }

    /// Records a directory, creating missing parents.
    pub fn add_dir(&mut self, path: &str, modtime: Option<i64>) -> Result<()> {
        let path = utils::sanitize(path)?;
        self.make_parents(&path)?;
        match self.entries.get_mut(&path) {
            Some(node) if node.is_dir() => {
                if node.modtime.is_none() {
                    node.modtime = modtime;
                }
                Ok(())
            }
            Some(_) => Err(ErrorCode::Corrupt).with_context(|| format!("{path} is both a file and a directory")),
            None => {
                self.entries.insert(path, Node::directory(modtime));
                Ok(())
            }
        }
    }

    /// Records a non-directory entry, creating missing parents.
    pub fn add(
        &mut self,
        path: &str,
        file_type: FileType,
        size: u64,
        modtime: Option<i64>,
        payload: T,
    ) -> Result<()> {
        let path = utils::sanitize(path)?;
        if path.is_empty() {
            return Err(ErrorCode::Corrupt).context("archive entry without a name");
        }
        self.make_parents(&path)?;
        if self.entries.contains_key(&path) {
            tracing::trace!(path = %path, "ignoring duplicate archive entry");
            return Ok(());
        }
        self.entries.insert(
            path,
            Node {
                file_type,
                modtime,
                size: Some(size),
                payload: Some(payload),
            },
        );
        Ok(())
    }

    pub fn find(&self, path: &str) -> Option<&Node<T>> {
        self.entries.get(path)
    }

    /// Like [`EntryTree::find`], failing with [`ErrorCode::NotFound`].
    pub fn get(&self, path: &str) -> Result<&Node<T>> {
        self.find(path)
            .ok_or(ErrorCode::NotFound)
            .with_context(|| format!("{path:?} is not in the archive"))
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        Ok(self.get(path)?.stat())
    }

    /// Returns the names of the immediate children of `dir`, in sorted order.
    pub fn children(&self, dir: &str) -> Result<Vec<String>> {
        if !self.get(dir)?.is_dir() {
            return Ok(Vec::new());
        }
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        Ok(self
            .entries
            .range(prefix.clone()..)
            .map(|(path, _)| path)
            .take_while(|path| path.starts_with(&prefix))
            .filter_map(|path| {
                let name = &path[prefix.len()..];
                (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
            })
            .collect())
    }

    /// Number of entries, the root included.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn make_parents(&mut self, path: &str) -> Result<()> {
        let mut parent = utils::parent(path);
        let mut missing = Vec::new();
        while !parent.is_empty() {
            match self.entries.get(parent) {
                Some(node) if node.is_dir() => break,
                Some(_) => {
                    return Err(ErrorCode::Corrupt)
                        .with_context(|| format!("{parent} is used as a directory but is a file"));
                }
                None => missing.push(parent.to_string()),
            }
            parent = utils::parent(parent);
        }
        for dir in missing {
            self.entries.insert(dir, Node::directory(None));
        }
        Ok(())
    }
}
