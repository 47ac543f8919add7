use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// Metadata of a file system entry. Times are seconds since the Unix epoch;
/// `None` means the archive doesn't know.
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub file_type: FileType,
    pub size: Option<u64>,
    pub modtime: Option<i64>,
    pub createtime: Option<i64>,
    pub accesstime: Option<i64>,
    pub readonly: bool,
}

impl Stat {
    pub fn new(file_type: FileType) -> Stat {
        Stat {
            file_type,
            size: None,
            modtime: None,
            createtime: None,
            accesstime: None,
            readonly: true,
        }
    }

    pub fn directory() -> Stat {
        Stat::new(FileType::Directory)
    }

    pub fn from_metadata(metadata: &Metadata) -> Stat {
        let file_type = if metadata.file_type().is_symlink() {
            FileType::Symlink
        } else if metadata.is_dir() {
            FileType::Directory
        } else if metadata.is_file() {
            FileType::Regular
        } else {
            FileType::Other
        };
        Stat {
            file_type,
            size: (file_type == FileType::Regular).then(|| metadata.len()),
            modtime: metadata.modified().ok().and_then(unix_seconds),
            createtime: metadata.created().ok().and_then(unix_seconds),
            accesstime: metadata.accessed().ok().and_then(unix_seconds),
            readonly: metadata.permissions().readonly(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::Regular
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

fn unix_seconds(time: SystemTime) -> Option<i64> {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_secs()).ok(),
        Err(before) => i64::try_from(before.duration().as_secs()).ok().map(|s| -s),
    }
}
