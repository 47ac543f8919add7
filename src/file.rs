//! Open file handles.
//!
//! A [`File`] is opened either for reading (from the search path) or for writing
//! (into the write dir). Handles are buffered on request with [`File::set_buffer`].
//!
//! ### Buffering
//!
//! - **Reads** fill the buffer with up to `size` bytes at a time and serve from it.
//!   Seeking inside the buffered window only moves the buffer cursor.
//! - **Writes** collect in the buffer and are written out when it would overflow,
//!   on [`File::flush`], on [`File::close`] and (best effort) on drop.

use std::sync::Arc;

use anyhow::Context;

use crate::core::io::MemoryIo;
use crate::core::{ErrorCode, Io, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

pub struct File {
    io: Box<dyn Io>,
    access: Access,
    buffer: Vec<u8>, // len() is the buffer size, 0 when unbuffered
    buffill: usize,  // bytes of `buffer` in use
    bufpos: usize,   // read cursor (reading) or flushed prefix (writing)
    handle: Arc<()>,  // keeps the owning mount busy
}

impl File {
    pub(crate) fn reader(io: Box<dyn Io>, handle: Arc<()>) -> File {
        File::new(io, Access::Read, handle)
    }

    pub(crate) fn writer(io: Box<dyn Io>, handle: Arc<()>) -> File {
        File::new(io, Access::Write, handle)
    }

    fn new(io: Box<dyn Io>, access: Access, handle: Arc<()>) -> File {
        File {
            io,
            access,
            buffer: Vec::new(),
            buffill: 0,
            bufpos: 0,
            handle,
        }
    }

    pub fn is_reader(&self) -> bool {
        self.access == Access::Read
    }

    /// Reads up to `buf.len()` bytes. Returns 0 at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.access != Access::Read {
            return Err(ErrorCode::OpenForWriting.into());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if self.buffer.is_empty() {
            return self.io.read(buf);
        }
        self.buffered_read(buf)
    }

    fn buffered_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            if self.bufpos == self.buffill {
                self.bufpos = 0;
                self.buffill = self.io.read(&mut self.buffer)?;
                if self.buffill == 0 {
                    break;
                }
            }
            let n = (buf.len() - total).min(self.buffill - self.bufpos);
            buf[total..total + n].copy_from_slice(&self.buffer[self.bufpos..self.bufpos + n]);
            self.bufpos += n;
            total += n;
        }
        Ok(total)
    }

    /// Reads exactly `buf.len()` bytes or fails with [`ErrorCode::PastEof`].
    pub fn read_all(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.read(buf)? != buf.len() {
            return Err(ErrorCode::PastEof.into());
        }
        Ok(())
    }

    /// Reads everything from the current position to the end of the file.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.access != Access::Write {
            return Err(ErrorCode::OpenForReading.into());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if self.buffill + buf.len() < self.buffer.len() {
            self.buffer[self.buffill..self.buffill + buf.len()].copy_from_slice(buf);
            self.buffill += buf.len();
            return Ok(buf.len());
        }
        self.flush_buffer()?;
        self.io.write(buf)
    }

    /// Writes out buffered data. A no-op for read handles.
    pub fn flush(&mut self) -> Result<()> {
        if self.access == Access::Read {
            return Ok(());
        }
        self.flush_buffer()?;
        self.io.flush()
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.access == Access::Write && self.bufpos < self.buffill {
            let mut pending = self.bufpos..self.buffill;
            while !pending.is_empty() {
                let n = self.io.write(&self.buffer[pending.clone()])?;
                if n == 0 {
                    return Err(ErrorCode::Io).context("short write while flushing");
                }
                pending.start += n;
            }
        }
        self.buffill = 0;
        self.bufpos = 0;
        Ok(())
    }

    /// Moves to the absolute position `pos`.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        if self.access == Access::Read && !self.buffer.is_empty() {
            let current = self.tell()?;
            let window_start = current - self.bufpos as u64;
            let window_end = window_start + self.buffill as u64;
            if pos >= window_start && pos < window_end {
                self.bufpos = (pos - window_start) as usize;
                return Ok(());
            }
        }
        self.flush_buffer()?;
        self.io.seek(pos)
    }

    /// Current position, buffered data included.
    pub fn tell(&self) -> Result<u64> {
        let pos = self.io.tell()?;
        Ok(match self.access {
            Access::Read => pos - self.buffill as u64 + self.bufpos as u64,
            Access::Write => pos + self.buffill as u64,
        })
    }

    /// True when a read handle has consumed all of its data. Always false for writers.
    pub fn eof(&self) -> Result<bool> {
        if self.access != Access::Read || self.bufpos < self.buffill {
            return Ok(false);
        }
        Ok(self.io.tell()? >= self.io.length()?)
    }

    pub fn length(&self) -> Result<u64> {
        self.io.length()
    }

    /// Resizes the buffer; 0 turns buffering off.
    ///
    /// Pending writes are flushed first. Buffered read data is dropped and the
    /// underlying stream is moved back to the logical position.
    pub fn set_buffer(&mut self, size: usize) -> Result<()> {
        match self.access {
            Access::Write => self.flush_buffer()?,
            Access::Read if self.bufpos < self.buffill => {
                let pos = self.tell()?;
                self.io.seek(pos)?;
                self.buffill = 0;
                self.bufpos = 0;
            }
            Access::Read => {
                self.buffill = 0;
                self.bufpos = 0;
            }
        }
        self.buffer = vec![0u8; size];
        Ok(())
    }

    /// Turns a read handle into a stream an archiver can open. The stream and all
    /// of its duplicates keep the mount this file came from busy.
    pub(crate) fn into_io(mut self) -> Result<Box<dyn Io>> {
        if !self.is_reader() {
            return Err(ErrorCode::OpenForWriting).context("only files open for reading can be mounted");
        }
        let io = std::mem::replace(&mut self.io, Box::new(MemoryIo::new(Vec::<u8>::new())));
        Ok(Box::new(HandleIo {
            io,
            handle: Arc::clone(&self.handle),
        }))
    }

    /// Flushes and closes the handle.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::warn!(error = %err, "failed to flush a file while dropping it");
        }
    }
}

struct HandleIo {
    io: Box<dyn Io>,
    handle: Arc<()>,
}

impl Io for HandleIo {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.io.read(buf)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.io.seek(pos)
    }

    fn tell(&self) -> Result<u64> {
        self.io.tell()
    }

    fn length(&self) -> Result<u64> {
        self.io.length()
    }

    fn duplicate(&self) -> Result<Box<dyn Io>> {
        Ok(Box::new(HandleIo {
            io: self.io.duplicate()?,
            handle: Arc::clone(&self.handle),
        }))
    }
}

impl std::io::Read for File {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        File::read(self, buf).map_err(std::io::Error::other)
    }
}

impl std::io::Write for File {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        File::write(self, buf).map_err(std::io::Error::other)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        File::flush(self).map_err(std::io::Error::other)
    }
}

impl std::io::Seek for File {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            std::io::SeekFrom::Start(pos) => Some(pos),
            std::io::SeekFrom::Current(delta) => {
                let current = self.tell().map_err(std::io::Error::other)?;
                current.checked_add_signed(delta)
            }
            std::io::SeekFrom::End(delta) => {
                let length = self.length().map_err(std::io::Error::other)?;
                length.checked_add_signed(delta)
            }
        };
        let target = target.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        File::seek(self, target).map_err(std::io::Error::other)?;
        Ok(target)
    }
}
