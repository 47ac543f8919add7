//! PKWARE zip archives.
//!
//! The central directory is read once when the archive is opened and kept in an
//! [`EntryTree`]. Member data is located through the local header on every open:
//! stored members are served straight from the archive, deflated members are
//! inflated into memory.
//!
//! Supported: stored and deflate methods, data prepended to the archive
//! (self-extracting executables), Unix symlinks. Not supported: multi-disk
//! archives, zip64 and encryption.

use std::io::Read;

use anyhow::Context;
use chrono::{Local, NaiveDate, TimeZone};
use flate2::Crc;
use flate2::read::DeflateDecoder;

use crate::archive::{ArchiveInfo, EntryTree, FileType, Node, Stat};
use crate::core::io::{IoReader, MemoryIo, SliceIo, read_all};
use crate::core::{Archive, Archiver, ErrorCode, Io, Result};

const LOCAL_HEADER_SIG: u32 = 0x04034b50;
const CENTRAL_HEADER_SIG: u32 = 0x02014b50;
const END_OF_CENTRAL_DIR_SIG: u32 = 0x06054b50;
const ZIP64_LOCATOR_SIG: u32 = 0x07064b50;

const LOCAL_HEADER_LEN: u64 = 30;
const CENTRAL_HEADER_LEN: usize = 46;
const END_OF_CENTRAL_DIR_LEN: u64 = 22;
const ZIP64_LOCATOR_LEN: u64 = 20;
const MAX_COMMENT_LEN: u64 = 0xFFFF;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;
const FLAG_ENCRYPTED: u16 = 1 << 0;

const UNIX_FILETYPE_MASK: u32 = 0o170000;
const UNIX_FILETYPE_SYMLINK: u32 = 0o120000;

/// Maximum number of symlinks followed when opening one member.
const MAX_SYMLINK_HOPS: usize = 16;

/// Upper bound of the buffer reserved up front for an inflated member.
const MAX_PREALLOCATION: u64 = 1 << 20;

pub struct ZipArchiver {
    info: ArchiveInfo,
}

impl ZipArchiver {
    pub fn new() -> Self {
        Self {
            info: ArchiveInfo::new("ZIP", "PkZip/WinZip/Info-Zip compatible", "Ryan C. Gordon", true),
        }
    }
}

impl Default for ZipArchiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Archiver for ZipArchiver {
    fn info(&self) -> &ArchiveInfo {
        &self.info
    }

    fn open(&self, mut io: Box<dyn Io>, name: &str, for_writing: bool) -> Result<Box<dyn Archive>> {
        if for_writing {
            return Err(ErrorCode::ReadOnly).context("zip archives cannot be written");
        }

        let length = io.length()?;
        let eocd_pos = find_end_of_central_dir(io.as_mut(), length)
            .with_context(|| format!("{name} is not a zip archive"))?;
        let eocd = EndOfCentralDir::read(io.as_mut(), eocd_pos)?;

        if eocd_pos >= ZIP64_LOCATOR_LEN {
            io.seek(eocd_pos - ZIP64_LOCATOR_LEN)?;
            let mut sig = [0u8; 4];
            if io.read(&mut sig)? == 4 && u32::from_le_bytes(sig) == ZIP64_LOCATOR_SIG {
                return Err(ErrorCode::Unsupported).with_context(|| format!("{name}: zip64 archives are not supported"));
            }
        }
        eocd.check_supported().with_context(|| format!("{name}: unsupported zip layout"))?;

        // Anything in front of the archive (a self-extractor stub) shifts every offset.
        let data_start = eocd_pos
            .checked_sub(eocd.cd_offset + eocd.cd_size)
            .ok_or(ErrorCode::Corrupt)
            .with_context(|| format!("{name}: central directory overlaps its end record"))?;

        let mut central = vec![0u8; eocd.cd_size as usize];
        io.seek(data_start + eocd.cd_offset)?;
        read_all(io.as_mut(), &mut central)
            .with_context(|| format!("{name}: truncated central directory"))?;

        let tree = parse_central_dir(&central, eocd.entries, data_start)
            .with_context(|| format!("{name}: bad central directory"))?;

        tracing::debug!(
            archive = name,
            entries = eocd.entries,
            nodes = tree.len(),
            data_start,
            "opened zip archive"
        );
        Ok(Box::new(ZipArchive { io, tree }))
    }
}

fn find_end_of_central_dir(io: &mut dyn Io, length: u64) -> Result<u64> {
    if length < END_OF_CENTRAL_DIR_LEN {
        return Err(ErrorCode::Unsupported).context("too short");
    }
    let tail_len = length.min(MAX_COMMENT_LEN + END_OF_CENTRAL_DIR_LEN);
    let tail_start = length - tail_len;
    let mut tail = vec![0u8; tail_len as usize];
    io.seek(tail_start)?;
    read_all(io, &mut tail)?;

    let sig = END_OF_CENTRAL_DIR_SIG.to_le_bytes();
    let last = tail.len() - END_OF_CENTRAL_DIR_LEN as usize;
    (0..=last)
        .rev()
        .find(|&pos| tail[pos..pos + 4] == sig)
        .map(|pos| tail_start + pos as u64)
        .ok_or(ErrorCode::Unsupported)
        .context("no end of central directory record")
}

struct EndOfCentralDir {
    disk: u16,
    cd_disk: u16,
    entries_on_disk: u16,
    entries: u16,
    cd_size: u64,
    cd_offset: u64,
}

impl EndOfCentralDir {
    fn read(io: &mut dyn Io, pos: u64) -> Result<Self> {
        let mut raw = [0u8; END_OF_CENTRAL_DIR_LEN as usize];
        io.seek(pos)?;
        read_all(io, &mut raw)?;
        Ok(Self {
            disk: u16_at(&raw, 4),
            cd_disk: u16_at(&raw, 6),
            entries_on_disk: u16_at(&raw, 8),
            entries: u16_at(&raw, 10),
            cd_size: u32_at(&raw, 12) as u64,
            cd_offset: u32_at(&raw, 16) as u64,
        })
    }

    fn check_supported(&self) -> Result<()> {
        if self.disk != 0 || self.cd_disk != 0 || self.entries_on_disk != self.entries {
            return Err(ErrorCode::Unsupported).context("multi-disk archive");
        }
        if self.entries == 0xFFFF || self.cd_size == 0xFFFF_FFFF || self.cd_offset == 0xFFFF_FFFF {
            return Err(ErrorCode::Unsupported).context("zip64 archive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ZipEntry {
    method: u16,
    encrypted: bool,
    crc: u32,
    compressed_size: u64,
    local_header: u64, // absolute position in the archive stream
}

fn parse_central_dir(central: &[u8], count: u16, data_start: u64) -> Result<EntryTree<ZipEntry>> {
    let mut tree = EntryTree::new();
    let mut pos = 0usize;
    for _ in 0..count {
        let header = central
            .get(pos..pos + CENTRAL_HEADER_LEN)
            .ok_or(ErrorCode::Corrupt)
            .context("truncated entry")?;
        if u32_at(header, 0) != CENTRAL_HEADER_SIG {
            return Err(ErrorCode::Corrupt).context("bad entry signature");
        }
        let version = u16_at(header, 4);
        let flags = u16_at(header, 8);
        let method = u16_at(header, 10);
        let time = u16_at(header, 12);
        let date = u16_at(header, 14);
        let crc = u32_at(header, 16);
        let compressed_size = u32_at(header, 20);
        let size = u32_at(header, 24);
        let name_len = u16_at(header, 28) as usize;
        let extra_len = u16_at(header, 30) as usize;
        let comment_len = u16_at(header, 32) as usize;
        let external_attr = u32_at(header, 38);
        let local_header = u32_at(header, 42);

        if [compressed_size, size, local_header].contains(&0xFFFF_FFFF) {
            return Err(ErrorCode::Unsupported).context("zip64 entry");
        }

        let name_start = pos + CENTRAL_HEADER_LEN;
        let raw_name = central
            .get(name_start..name_start + name_len)
            .ok_or(ErrorCode::Corrupt)
            .context("truncated entry name")?;
        let mut name = String::from_utf8_lossy(raw_name).into_owned();
        if !host_does_symlinks(version) {
            name = name.replace('\\', "/");
        }
        pos = name_start + name_len + extra_len + comment_len;

        let modtime = dos_time_to_unix(date, time);
        let added = if name.ends_with('/') {
            tree.add_dir(&name, modtime)
        } else {
            let file_type = if is_symlink(version, external_attr) {
                FileType::Symlink
            } else {
                FileType::Regular
            };
            let entry = ZipEntry {
                method,
                encrypted: flags & FLAG_ENCRYPTED != 0,
                crc,
                compressed_size: compressed_size as u64,
                local_header: data_start + local_header as u64,
            };
            tree.add(&name, file_type, size as u64, modtime, entry)
        };
        match added {
            Err(err) if ErrorCode::BadFilename.matches(&err) => {
                tracing::warn!(entry = %name, "skipping zip entry with an insecure name");
            }
            other => other?,
        }
    }
    Ok(tree)
}

/// Host systems that can't produce symlinks, per Info-ZIP. Everything else is
/// treated as Unix-like.
fn host_does_symlinks(version: u16) -> bool {
    !matches!(version >> 8, 0 | 1 | 2 | 4 | 6 | 11 | 13 | 14 | 15 | 18)
}

fn is_symlink(version: u16, external_attr: u32) -> bool {
    host_does_symlinks(version) && (external_attr >> 16) & UNIX_FILETYPE_MASK == UNIX_FILETYPE_SYMLINK
}

/// Converts an MS-DOS date and time (local time) to seconds since the Unix epoch.
fn dos_time_to_unix(date: u16, time: u16) -> Option<i64> {
    let year = 1980 + ((date >> 9) & 0x7F) as i32;
    let month = ((date >> 5) & 0x0F) as u32;
    let day = (date & 0x1F) as u32;
    let hour = ((time >> 11) & 0x1F) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let second = ((time & 0x1F) * 2) as u32;
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|time| time.timestamp())
}

/// Resolves a symlink `target` found in directory `dir`.
/// Returns `None` when the target climbs above the archive root.
fn resolve_link_target(dir: &str, target: &str) -> Option<String> {
    let mut parts: Vec<&str> = if target.starts_with('/') || dir.is_empty() {
        Vec::new()
    } else {
        dir.split('/').collect()
    };
    for part in target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            part => parts.push(part),
        }
    }
    Some(parts.join("/"))
}

fn u16_at(buf: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([buf[pos], buf[pos + 1]])
}

fn u32_at(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

struct ZipArchive {
    io: Box<dyn Io>,
    tree: EntryTree<ZipEntry>,
}

impl ZipArchive {
    /// Finds the node `path` names, following symlinks.
    fn resolve(&self, path: &str) -> Result<&Node<ZipEntry>> {
        let mut current = path.to_string();
        let mut node = self.tree.get(&current)?;
        for _ in 0..MAX_SYMLINK_HOPS {
            if node.file_type != FileType::Symlink {
                return Ok(node);
            }
            let target = self.read_link(node)?;
            current = resolve_link_target(crate::core::utils::parent(&current), &target)
                .ok_or(ErrorCode::Corrupt)
                .with_context(|| format!("symlink {current:?} points outside the archive"))?;
            tracing::trace!(link = path, target = %current, "following zip symlink");
            node = self
                .tree
                .find(&current)
                .ok_or(ErrorCode::Corrupt)
                .with_context(|| format!("broken symlink to {current:?}"))?;
        }
        if node.file_type == FileType::Symlink {
            return Err(ErrorCode::SymlinkLoop).with_context(|| format!("resolving {path:?}"));
        }
        Ok(node)
    }

    fn read_link(&self, node: &Node<ZipEntry>) -> Result<String> {
        let mut io = self.open_member(node)?;
        let mut target = vec![0u8; io.length()? as usize];
        read_all(io.as_mut(), &mut target)?;
        String::from_utf8(target)
            .map_err(|_| ErrorCode::Corrupt)
            .context("symlink target is not valid UTF-8")
    }

    fn open_member(&self, node: &Node<ZipEntry>) -> Result<Box<dyn Io>> {
        let (Some(entry), Some(size)) = (&node.payload, node.size) else {
            return Err(ErrorCode::NotAFile).context("zip entry is a directory");
        };
        if entry.encrypted {
            return Err(ErrorCode::Unsupported).context("encrypted zip entries are not supported");
        }

        let mut io = self.io.duplicate()?;
        let mut local = [0u8; LOCAL_HEADER_LEN as usize];
        io.seek(entry.local_header)?;
        read_all(io.as_mut(), &mut local).context("truncated local header")?;
        if u32_at(&local, 0) != LOCAL_HEADER_SIG {
            return Err(ErrorCode::Corrupt).context("bad local header signature");
        }
        let data = entry.local_header
            + LOCAL_HEADER_LEN
            + u16_at(&local, 26) as u64
            + u16_at(&local, 28) as u64;

        match entry.method {
            METHOD_STORED => Ok(Box::new(SliceIo::new(io, data, size)?)),
            METHOD_DEFLATE => {
                let mut compressed = SliceIo::new(io, data, entry.compressed_size)?;
                let capacity = size
                    .min(entry.compressed_size.saturating_mul(4))
                    .min(MAX_PREALLOCATION);
                let mut inflated = Vec::with_capacity(capacity as usize);
                // One byte past the declared size is enough to tell the stream lies.
                DeflateDecoder::new(IoReader(&mut compressed))
                    .take(size + 1)
                    .read_to_end(&mut inflated)
                    .map_err(|_| ErrorCode::Corrupt)
                    .context("bad deflate stream")?;
                if inflated.len() as u64 != size {
                    return Err(ErrorCode::Corrupt).context("inflated size mismatch");
                }
                let mut crc = Crc::new();
                crc.update(&inflated);
                if crc.sum() != entry.crc {
                    return Err(ErrorCode::Corrupt).context("crc mismatch");
                }
                Ok(Box::new(MemoryIo::new(inflated)))
            }
            method => Err(ErrorCode::Unsupported)
                .with_context(|| format!("compression method {method} is not supported")),
        }
    }
}

impl Archive for ZipArchive {
    fn enumerate(&self, dir: &str) -> Result<Vec<String>> {
        self.tree.children(dir)
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Io>> {
        let node = self.resolve(path)?;
        self.open_member(node)
            .with_context(|| format!("cannot open {path:?}"))
    }

    fn stat(&self, path: &str) -> Result<Stat> {
        self.tree.stat(path)
    }
}
