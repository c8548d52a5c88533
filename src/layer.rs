//! Bidirectional byte-stream abstraction.
//!
//! Every storage, slicing, ciphering, compression and framing component of
//! the engine is a [`Layer`]: a random-access byte stream that may sit on top
//! of another layer. Layers are composed into a [`crate::stack::Stack`].

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Access mode of a layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Read,
    Write,
    ReadWrite,
}

impl Mode {
    /// Whether a layer of mode `self` may be stacked on a layer of mode
    /// `below`. A wider mode cannot sit on a narrower one.
    pub fn compatible_over(self, below: Mode) -> bool {
        match below {
            Mode::ReadWrite => true,
            Mode::Read => self == Mode::Read,
            Mode::Write => self == Mode::Write,
        }
    }
}

/// Direction argument of [`Layer::skippable`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SkipDirection {
    Forward,
    Backward,
}

/// A bidirectional random-access byte stream.
///
/// `terminate` finalizes the layer's own state (trailing bytes, digests,
/// flushes into the layer below) and must be called at most once; any I/O
/// after it is a contract violation.
pub trait Layer {
    fn mode(&self) -> Mode;

    /// Reads up to `buf.len()` bytes. Returns 0 at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Moves to the given absolute position. Returns false when the position
    /// is out of reach (the stream position is then unspecified but valid).
    fn skip(&mut self, pos: u64) -> Result<bool>;

    /// Moves relative to the current position.
    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        let pos = self.position()?;
        let target = if delta >= 0 {
            pos.checked_add(delta as u64)
        } else {
            pos.checked_sub(delta.unsigned_abs())
        };
        match target {
            Some(t) => self.skip(t),
            None => Ok(false),
        }
    }

    /// Moves to the end of the stream and returns the position reached.
    fn skip_to_eof(&mut self) -> Result<u64>;

    /// Whether a skip of `amount` bytes in `direction` can succeed without
    /// breaking the layer's framing.
    fn skippable(&self, direction: SkipDirection, amount: u64) -> bool;

    /// Current absolute position.
    fn position(&mut self) -> Result<u64>;

    /// Flushes pending written bytes down the stack.
    fn sync_write(&mut self) -> Result<()>;

    /// Drops any read-ahead state so the next read hits the layer below.
    fn flush_read(&mut self) -> Result<()>;

    /// Finalizes the layer. At most once.
    fn terminate(&mut self) -> Result<()>;

    /// The layer directly below, if any.
    fn below_mut(&mut self) -> Option<&mut dyn Layer> {
        None
    }

    /// Typed access for stack navigation: the tape-mark layer answers here.
    fn as_escape(&mut self) -> Option<&mut crate::escape::Escape> {
        None
    }

    /// Typed access for stack navigation: the compression layer answers
    /// here.
    fn as_compressor(&mut self) -> Option<&mut crate::compressor::Compressor> {
        None
    }

    /// Detaches and returns the layer directly below, if any.
    fn take_below(&mut self) -> Option<Box<dyn Layer>> {
        None
    }

    /// Reads exactly `buf.len()` bytes or fails with a data error.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..])?;
            if n == 0 {
                return Err(Error::Data("unexpected end of stream".into()));
            }
            done += n;
        }
        Ok(())
    }
}

/// Placeholder left behind when a layer's lower neighbour is detached.
/// Every operation on it is a contract violation.
pub struct NoLayer;

impl Layer for NoLayer {
    fn mode(&self) -> Mode {
        Mode::Read
    }
    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::bug())
    }
    fn write_all(&mut self, _buf: &[u8]) -> Result<()> {
        Err(Error::bug())
    }
    fn skip(&mut self, _pos: u64) -> Result<bool> {
        Err(Error::bug())
    }
    fn skip_to_eof(&mut self) -> Result<u64> {
        Err(Error::bug())
    }
    fn skippable(&self, _direction: SkipDirection, _amount: u64) -> bool {
        false
    }
    fn position(&mut self) -> Result<u64> {
        Err(Error::bug())
    }
    fn sync_write(&mut self) -> Result<()> {
        Err(Error::bug())
    }
    fn flush_read(&mut self) -> Result<()> {
        Err(Error::bug())
    }
    fn terminate(&mut self) -> Result<()> {
        Err(Error::bug())
    }
}

/// Bottom layer over a plain file.
pub struct FileLayer {
    file: File,
    path: PathBuf,
    mode: Mode,
    terminated: bool,
}

impl FileLayer {
    pub fn new(file: File, path: PathBuf, mode: Mode) -> Self {
        Self {
            file,
            path,
            mode,
            terminated: false,
        }
    }

    fn ctx(&self) -> String {
        self.path.display().to_string()
    }
}

impl Layer for FileLayer {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.mode == Mode::Write {
            return Err(Error::bug());
        }
        self.file
            .read(buf)
            .map_err(|e| Error::system(self.ctx(), e))
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.mode == Mode::Read {
            return Err(Error::bug());
        }
        self.file
            .write_all(buf)
            .map_err(|e| Error::system(self.ctx(), e))
    }

    fn skip(&mut self, pos: u64) -> Result<bool> {
        self.file
            .seek(SeekFrom::Start(pos))
            .map(|_| true)
            .map_err(|e| Error::system(self.ctx(), e))
    }

    fn skip_to_eof(&mut self) -> Result<u64> {
        self.file
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::system(self.ctx(), e))
    }

    fn skippable(&self, _direction: SkipDirection, _amount: u64) -> bool {
        true
    }

    fn position(&mut self) -> Result<u64> {
        self.file
            .stream_position()
            .map_err(|e| Error::system(self.ctx(), e))
    }

    fn sync_write(&mut self) -> Result<()> {
        if self.mode != Mode::Read {
            self.file.flush().map_err(|e| Error::system(self.ctx(), e))?;
        }
        Ok(())
    }

    fn flush_read(&mut self) -> Result<()> {
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Err(Error::bug());
        }
        self.terminated = true;
        self.sync_write()
    }
}

/// RAM-backed layer, used for catalogue staging and in tests.
pub struct MemoryLayer {
    data: Vec<u8>,
    pos: usize,
    mode: Mode,
    terminated: bool,
}

impl MemoryLayer {
    pub fn new(mode: Mode) -> Self {
        Self {
            data: Vec::new(),
            pos: 0,
            mode,
            terminated: false,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            mode: Mode::ReadWrite,
            terminated: false,
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Layer for MemoryLayer {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let avail = self.data.len().saturating_sub(self.pos);
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.pos < self.data.len() {
            let overlap = (self.data.len() - self.pos).min(buf.len());
            self.data[self.pos..self.pos + overlap].copy_from_slice(&buf[..overlap]);
            self.data.extend_from_slice(&buf[overlap..]);
        } else {
            self.data.extend_from_slice(buf);
        }
        self.pos += buf.len();
        Ok(())
    }

    fn skip(&mut self, pos: u64) -> Result<bool> {
        if pos as usize > self.data.len() {
            self.pos = self.data.len();
            return Ok(false);
        }
        self.pos = pos as usize;
        Ok(true)
    }

    fn skip_to_eof(&mut self) -> Result<u64> {
        self.pos = self.data.len();
        Ok(self.pos as u64)
    }

    fn skippable(&self, _direction: SkipDirection, _amount: u64) -> bool {
        true
    }

    fn position(&mut self) -> Result<u64> {
        Ok(self.pos as u64)
    }

    fn sync_write(&mut self) -> Result<()> {
        Ok(())
    }

    fn flush_read(&mut self) -> Result<()> {
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Err(Error::bug());
        }
        self.terminated = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_compatibility() {
        assert!(Mode::Read.compatible_over(Mode::ReadWrite));
        assert!(Mode::Read.compatible_over(Mode::Read));
        assert!(!Mode::Write.compatible_over(Mode::Read));
        assert!(!Mode::ReadWrite.compatible_over(Mode::Write));
    }

    #[test]
    fn memory_layer_round_trip() {
        let mut m = MemoryLayer::new(Mode::ReadWrite);
        m.write_all(b"hello world").unwrap();
        assert_eq!(m.position().unwrap(), 11);
        assert!(m.skip(6).unwrap());
        let mut buf = [0u8; 5];
        m.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
        assert_eq!(m.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn memory_layer_overwrite_in_place() {
        let mut m = MemoryLayer::from_vec(b"abcdef".to_vec());
        m.skip(2).unwrap();
        m.write_all(b"XYZW").unwrap();
        assert_eq!(m.as_slice(), b"abXYZW");
        m.write_all(b"!").unwrap();
        assert_eq!(m.as_slice(), b"abXYZW!");
    }
}
