//! Read/write buffering layer.
//!
//! Entry records are written a handful of bytes at a time; without buffering
//! each of those writes would cross the cipher layer and force tiny blocks.
//! The cache batches them. Reads are buffered the same way, invalidated on
//! any skip or write.

use crate::error::{Error, Result};
use crate::layer::{Layer, Mode, NoLayer, SkipDirection};

const DEFAULT_BUFFER: usize = 102_400;

pub struct Cache {
    below: Box<dyn Layer>,
    buffer: Vec<u8>,
    capacity: usize,
    /// Position in the layer below of the first buffered byte.
    buffer_start: u64,
    /// Read cursor within `buffer`; writes always append to `buffer`.
    cursor: usize,
    writing: bool,
    terminated: bool,
}

impl Cache {
    pub fn new(below: Box<dyn Layer>) -> Result<Self> {
        Self::with_capacity(below, DEFAULT_BUFFER)
    }

    pub fn with_capacity(mut below: Box<dyn Layer>, capacity: usize) -> Result<Self> {
        let buffer_start = below.position()?;
        Ok(Self {
            below,
            buffer: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            buffer_start,
            cursor: 0,
            writing: false,
            terminated: false,
        })
    }

    fn flush_pending_write(&mut self) -> Result<()> {
        if self.writing {
            if !self.buffer.is_empty() {
                self.below.write_all(&self.buffer)?;
            }
            self.buffer_start += self.buffer.len() as u64;
        } else if !self.buffer.is_empty() {
            // drop the read-ahead, the below position is past our cursor
            self.buffer_start += self.cursor as u64;
            self.below.skip(self.buffer_start)?;
        }
        self.buffer.clear();
        self.cursor = 0;
        self.writing = false;
        Ok(())
    }
}

impl Layer for Cache {
    fn mode(&self) -> Mode {
        self.below.mode()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.terminated {
            return Err(Error::bug());
        }
        if self.writing {
            self.flush_pending_write()?;
        }
        if self.cursor >= self.buffer.len() {
            // refill
            self.buffer_start += self.buffer.len() as u64;
            self.buffer.resize(self.capacity, 0);
            let got = self.below.read(&mut self.buffer)?;
            self.buffer.truncate(got);
            self.cursor = 0;
            if got == 0 {
                return Ok(0);
            }
        }
        let n = (self.buffer.len() - self.cursor).min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.terminated {
            return Err(Error::bug());
        }
        if !self.writing {
            self.flush_pending_write()?;
            self.writing = true;
        }
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= self.capacity {
            self.below.write_all(&self.buffer)?;
            self.buffer_start += self.buffer.len() as u64;
            self.buffer.clear();
        }
        Ok(())
    }

    fn skip(&mut self, pos: u64) -> Result<bool> {
        self.flush_pending_write()?;
        let moved = self.below.skip(pos)?;
        self.buffer_start = self.below.position()?;
        Ok(moved)
    }

    fn skip_to_eof(&mut self) -> Result<u64> {
        self.flush_pending_write()?;
        let pos = self.below.skip_to_eof()?;
        self.buffer_start = pos;
        Ok(pos)
    }

    fn skippable(&self, direction: SkipDirection, amount: u64) -> bool {
        self.below.skippable(direction, amount)
    }

    fn position(&mut self) -> Result<u64> {
        if self.writing {
            Ok(self.buffer_start + self.buffer.len() as u64)
        } else {
            Ok(self.buffer_start + self.cursor as u64)
        }
    }

    fn sync_write(&mut self) -> Result<()> {
        if self.writing {
            self.flush_pending_write()?;
        }
        self.below.sync_write()
    }

    fn flush_read(&mut self) -> Result<()> {
        if !self.writing {
            self.flush_pending_write()?;
        }
        self.below.flush_read()
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Err(Error::bug());
        }
        self.flush_pending_write()?;
        self.terminated = true;
        Ok(())
    }

    fn below_mut(&mut self) -> Option<&mut dyn Layer> {
        Some(self.below.as_mut())
    }

    fn take_below(&mut self) -> Option<Box<dyn Layer>> {
        Some(std::mem::replace(&mut self.below, Box::new(NoLayer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::MemoryLayer;

    #[test]
    fn batches_small_writes() {
        let below = Box::new(MemoryLayer::new(Mode::ReadWrite));
        let mut cache = Cache::with_capacity(below, 16).unwrap();
        for _ in 0..10 {
            cache.write_all(b"ab").unwrap();
        }
        assert_eq!(cache.position().unwrap(), 20);
        cache.terminate().unwrap();
        let below = cache.below_mut().unwrap();
        assert_eq!(below.position().unwrap(), 20);
    }

    #[test]
    fn read_through_after_write() {
        let below = Box::new(MemoryLayer::new(Mode::ReadWrite));
        let mut cache = Cache::with_capacity(below, 8).unwrap();
        cache.write_all(b"0123456789").unwrap();
        cache.skip(2).unwrap();
        let mut buf = [0u8; 4];
        cache.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"2345");
        assert_eq!(cache.position().unwrap(), 6);
        cache.terminate().unwrap();
    }
}
