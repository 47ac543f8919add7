//! Byte streams behind open files and packed archives.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::core::{ErrorCode, Result};

/// A seekable stream of bytes.
///
/// `read` fills as much of `buf` as it can and returns 0 only at end of stream.
/// Positions are absolute byte offsets.
pub trait Io: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(ErrorCode::ReadOnly.into())
    }

    fn seek(&mut self, pos: u64) -> Result<()>;

    fn tell(&self) -> Result<u64>;

    fn length(&self) -> Result<u64>;

    /// Opens an independent stream over the same data, positioned at 0.
    fn duplicate(&self) -> Result<Box<dyn Io>>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Reads exactly `buf.len()` bytes or fails with [`ErrorCode::PastEof`].
pub fn read_all(io: &mut dyn Io, buf: &mut [u8]) -> Result<()> {
    let n = io.read(buf)?;
    if n != buf.len() {
        return Err(ErrorCode::PastEof.into());
    }
    Ok(())
}

/// Adapts an [`Io`] to `std::io::Read`, for decoders that want one.
pub struct IoReader<'a>(pub &'a mut dyn Io);

impl Read for IoReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf).map_err(std::io::Error::other)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

/// A host file.
pub struct NativeIo {
    file: std::fs::File,
    path: PathBuf,
    mode: OpenMode,
}

impl NativeIo {
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::Append => options.append(true).create(true),
        };
        let file = options
            .open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        if file.metadata()?.is_dir() {
            return Err(ErrorCode::NotAFile).with_context(|| format!("{} is a directory", path.display()));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            mode,
        })
    }
}

impl Io for NativeIo {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.mode != OpenMode::Read {
            return Err(ErrorCode::OpenForWriting.into());
        }
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.mode == OpenMode::Read {
            return Err(ErrorCode::OpenForReading.into());
        }
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn tell(&self) -> Result<u64> {
        Ok((&self.file).stream_position()?)
    }

    fn length(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn duplicate(&self) -> Result<Box<dyn Io>> {
        if self.mode != OpenMode::Read {
            return Err(ErrorCode::Unsupported).context("only read streams can be duplicated");
        }
        Ok(Box::new(NativeIo::open(&self.path, OpenMode::Read)?))
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// A read-only stream over shared bytes.
#[derive(Clone)]
pub struct MemoryIo {
    data: Arc<[u8]>,
    pos: u64,
}

impl MemoryIo {
    pub fn new<D: Into<Arc<[u8]>>>(data: D) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl Io for MemoryIo {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let start = (self.pos as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.data.len() as u64 {
            return Err(ErrorCode::PastEof.into());
        }
        self.pos = pos;
        Ok(())
    }

    fn tell(&self) -> Result<u64> {
        Ok(self.pos)
    }

    fn length(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn duplicate(&self) -> Result<Box<dyn Io>> {
        Ok(Box::new(MemoryIo::new(Arc::clone(&self.data))))
    }
}

/// A read-only window `[start, start + len)` of another stream.
pub struct SliceIo {
    inner: Box<dyn Io>,
    start: u64,
    len: u64,
    pos: u64,
}

impl SliceIo {
    pub fn new(inner: Box<dyn Io>, start: u64, len: u64) -> Result<Self> {
        let total = inner.length()?;
        if start.checked_add(len).is_none_or(|end| end > total) {
            return Err(ErrorCode::Corrupt).context("archive member runs past the end of the archive");
        }
        Ok(Self {
            inner,
            start,
            len,
            pos: 0,
        })
    }
}

impl Io for SliceIo {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.len - self.pos;
        let want = (buf.len() as u64).min(remaining) as usize;
        if want == 0 {
            return Ok(0);
        }
        self.inner.seek(self.start + self.pos)?;
        let n = self.inner.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.len {
            return Err(ErrorCode::PastEof.into());
        }
        self.pos = pos;
        Ok(())
    }

    fn tell(&self) -> Result<u64> {
        Ok(self.pos)
    }

    fn length(&self) -> Result<u64> {
        Ok(self.len)
    }

    fn duplicate(&self) -> Result<Box<dyn Io>> {
        Ok(Box::new(SliceIo::new(self.inner.duplicate()?, self.start, self.len)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    mod memory {
        use super::*;

        #[test]
        fn test_memory_read_and_seek() -> Result<()> {
            let mut io = MemoryIo::new(b"hello world".to_vec());
            let mut buf = [0u8; 5];
            assert_eq!(io.read(&mut buf)?, 5);
            assert_eq!(&buf, b"hello");
            assert_eq!(io.tell()?, 5);

            io.seek(6)?;
            let mut rest = Vec::new();
            let mut chunk = [0u8; 16];
            let n = io.read(&mut chunk)?;
            rest.extend_from_slice(&chunk[..n]);
            assert_eq!(rest, b"world");
            assert_eq!(io.read(&mut chunk)?, 0);
            Ok(())
        }

        #[test]
        fn test_memory_seek_past_end() {
            let mut io = MemoryIo::new(b"abc".to_vec());
            assert!(io.seek(3).is_ok());
            let err = io.seek(4).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::PastEof);
        }

        #[test]
        fn test_memory_is_read_only() {
            let mut io = MemoryIo::new(b"abc".to_vec());
            let err = io.write(b"x").unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::ReadOnly);
        }

        #[test]
        fn test_memory_duplicate_is_independent() -> Result<()> {
            let mut io = MemoryIo::new(b"abcdef".to_vec());
            io.seek(4)?;
            let mut dup = io.duplicate()?;
            assert_eq!(dup.tell()?, 0);
            let mut buf = [0u8; 2];
            read_all(dup.as_mut(), &mut buf)?;
            assert_eq!(&buf, b"ab");
            assert_eq!(io.tell()?, 4);
            Ok(())
        }
    }

    mod slice {
        use super::*;

        #[test]
        fn test_slice_window() -> Result<()> {
            let base = Box::new(MemoryIo::new(b"0123456789".to_vec()));
            let mut io = SliceIo::new(base, 3, 4)?;
            assert_eq!(io.length()?, 4);

            let mut buf = [0u8; 10];
            let n = io.read(&mut buf)?;
            assert_eq!(&buf[..n], b"3456");
            assert_eq!(io.read(&mut buf)?, 0);

            io.seek(2)?;
            let n = io.read(&mut buf)?;
            assert_eq!(&buf[..n], b"56");
            assert!(io.seek(5).is_err());
            Ok(())
        }

        #[test]
        fn test_slice_past_archive_end() {
            let base = Box::new(MemoryIo::new(b"0123".to_vec()));
            let err = SliceIo::new(base, 2, 10).err().unwrap();
            assert_eq!(ErrorCode::of(&err), ErrorCode::Corrupt);
        }
    }

    mod native {
        use super::*;

        #[test]
        fn test_native_write_then_read() -> Result<()> {
            let temp_dir = TempDir::new("native_io")?;
            let path = temp_dir.path().join("data.bin");

            let mut out = NativeIo::open(&path, OpenMode::Write)?;
            assert_eq!(out.write(b"abc")?, 3);
            out.flush()?;
            drop(out);

            let mut out = NativeIo::open(&path, OpenMode::Append)?;
            out.write(b"def")?;
            drop(out);

            let mut io = NativeIo::open(&path, OpenMode::Read)?;
            assert_eq!(io.length()?, 6);
            let mut buf = [0u8; 6];
            read_all(&mut io, &mut buf)?;
            assert_eq!(&buf, b"abcdef");
            assert_eq!(io.tell()?, 6);

            let err = io.write(b"x").unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::OpenForReading);
            Ok(())
        }

        #[test]
        fn test_native_open_missing() -> Result<()> {
            let temp_dir = TempDir::new("native_io")?;
            let err = NativeIo::open(temp_dir.path().join("nope"), OpenMode::Read)
                .err()
                .unwrap();
            assert_eq!(ErrorCode::of(&err), ErrorCode::NotFound);
            Ok(())
        }

        #[test]
        fn test_native_open_directory() -> Result<()> {
            let temp_dir = TempDir::new("native_io")?;
            let err = NativeIo::open(temp_dir.path(), OpenMode::Read).err().unwrap();
            assert_eq!(ErrorCode::of(&err), ErrorCode::NotAFile);
            Ok(())
        }

        #[test]
        fn test_native_write_handle_cannot_read() -> Result<()> {
            let temp_dir = TempDir::new("native_io")?;
            let mut io = NativeIo::open(temp_dir.path().join("w.txt"), OpenMode::Write)?;
            let mut buf = [0u8; 1];
            let err = io.read(&mut buf).unwrap_err();
            assert_eq!(ErrorCode::of(&err), ErrorCode::OpenForWriting);
            Ok(())
        }
    }
}
