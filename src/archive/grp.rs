//! Build engine group files (`.GRP`), as used by Duke Nukem 3D and friends.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! "KenSilverman"            12 bytes
//! count                     u32
//! count * { name[12], size: u32 }
//! file data, in table order
//! ```
//!
//! Names are space or NUL padded. There are no directories, timestamps or symlinks.

use anyhow::Context;

use crate::archive::{ArchiveInfo, EntryTree, FileType, Stat};
use crate::core::io::{SliceIo, read_all};
use crate::core::{Archive, Archiver, ErrorCode, Io, Result};

const SIGNATURE: &[u8; 12] = b"KenSilverman";
const HEADER_LEN: u64 = 16;
const ENTRY_LEN: u64 = 16;

pub struct GrpArchiver {
    info: ArchiveInfo,
}

impl GrpArchiver {
    pub fn new() -> Self {
        Self {
            info: ArchiveInfo::new("GRP", "Build engine Groupfile format", "Ryan C. Gordon", false),
        }
    }
}

impl Default for GrpArchiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Archiver for GrpArchiver {
    fn info(&self) -> &ArchiveInfo {
        &self.info
    }

    fn open(&self, mut io: Box<dyn Io>, name: &str, for_writing: bool) -> Result<Box<dyn Archive>> {
        if for_writing {
            return Err(ErrorCode::ReadOnly).context("GRP archives cannot be written");
        }

        let mut header = [0u8; HEADER_LEN as usize];
        io.seek(0)?;
        if io.read(&mut header)? != header.len() || &header[..12] != SIGNATURE {
            return Err(ErrorCode::Unsupported).with_context(|| format!("{name} is not a GRP file"));
        }
        let count = u32::from_le_bytes([header[12], header[13], header[14], header[15]]) as u64;

        let length = io.length()?;
        let table_end = HEADER_LEN + count * ENTRY_LEN;
        if table_end > length {
            return Err(ErrorCode::Corrupt).with_context(|| format!("{name}: truncated GRP table"));
        }
        let mut table = vec![0u8; (count * ENTRY_LEN) as usize];
        read_all(io.as_mut(), &mut table).with_context(|| format!("{name}: truncated GRP table"))?;

        let mut tree = EntryTree::new();
        let mut offset = table_end;
        for raw in table.chunks_exact(ENTRY_LEN as usize) {
            let entry_name = parse_name(&raw[..12]);
            let size = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]) as u64;
            if offset + size > length {
                return Err(ErrorCode::Corrupt)
                    .with_context(|| format!("{name}: {entry_name} runs past the end of the file"));
            }
            match tree.add(&entry_name, FileType::Regular, size, None, offset) {
                Err(err) if ErrorCode::BadFilename.matches(&err) || entry_name.is_empty() => {
                    tracing::warn!(archive = name, entry = %entry_name, "skipping GRP entry with an unusable name");
                }
                other => other?,
            }
            offset += size;
        }

        tracing::debug!(archive = name, entries = count, nodes = tree.len(), "opened GRP archive");
        Ok(Box::new(GrpArchive { io, tree }))
    }
}

fn parse_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == b' ' || b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

struct GrpArchive {
    io: Box<dyn Io>,
    tree: EntryTree<u64>, // payload: absolute data offset
}

impl Archive for GrpArchive {
    fn enumerate(&self, dir: &str) -> Result<Vec<String>> {
        self.tree.children(dir)
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Io>> {
        let node = self.tree.get(path)?;
        let (Some(offset), Some(size)) = (node.payload, node.size) else {
            return Err(ErrorCode::NotAFile).with_context(|| format!("{path:?} is a directory"));
        };
        Ok(Box::new(SliceIo::new(self.io.duplicate()?, offset, size)?))
    }

    fn stat(&self, path: &str) -> Result<Stat> {
        self.tree.stat(path)
    }
}
