//! Tape-mark framing layer.
//!
//! When sequential marks are enabled, the archive stream is sprinkled with
//! marks: a fixed 5-byte prefix followed by a one-byte kind. Marks flag the
//! start of entry headers, data, EA and FSA blocks, the catalogue, and a few
//! exceptional conditions. They are what makes a truncated or streamed
//! archive readable without its catalogue.
//!
//! Data that happens to contain the prefix is escaped on write by inserting
//! a reserved kind byte right after it, and the escape is undone on read.
//! The prefix has no self-overlap, so a partial prefix held back at a write
//! boundary can never combine with later bytes into a false mark.

use crate::error::{Error, Result};
use crate::layer::{Layer, Mode, NoLayer, SkipDirection};

/// Fixed bytes announcing a mark.
const PREFIX: [u8; 5] = [0xad, 0xfd, 0xea, 0x77, 0x21];
/// Kind byte meaning "the prefix was data".
const KIND_DATA: u8 = b'$';

/// What a mark announces.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Mark {
    EntryHeader,
    DataStart,
    DataEnd,
    EaStart,
    EaEnd,
    FsaStart,
    FsaEnd,
    CatalogueStart,
    Dirty,
    ChangedDuringRead,
    FailedBackup,
    CatalogueDataName,
}

impl Mark {
    fn kind(self) -> u8 {
        match self {
            Self::EntryHeader => b'H',
            Self::DataStart => b'D',
            Self::DataEnd => b'd',
            Self::EaStart => b'E',
            Self::EaEnd => b'e',
            Self::FsaStart => b'F',
            Self::FsaEnd => b'f',
            Self::CatalogueStart => b'C',
            Self::Dirty => b'!',
            Self::ChangedDuringRead => b'~',
            Self::FailedBackup => b'X',
            Self::CatalogueDataName => b'N',
        }
    }

    fn from_kind(kind: u8) -> Option<Self> {
        Some(match kind {
            b'H' => Self::EntryHeader,
            b'D' => Self::DataStart,
            b'd' => Self::DataEnd,
            b'E' => Self::EaStart,
            b'e' => Self::EaEnd,
            b'F' => Self::FsaStart,
            b'f' => Self::FsaEnd,
            b'C' => Self::CatalogueStart,
            b'!' => Self::Dirty,
            b'~' => Self::ChangedDuringRead,
            b'X' => Self::FailedBackup,
            b'N' => Self::CatalogueDataName,
            _ => return None,
        })
    }
}

/// Longest suffix of `buf` that is a proper prefix of [`PREFIX`].
fn partial_prefix_len(buf: &[u8]) -> usize {
    for k in (1..PREFIX.len()).rev() {
        if buf.len() >= k && buf[buf.len() - k..] == PREFIX[..k] {
            return k;
        }
    }
    0
}

pub struct Escape {
    below: Box<dyn Layer>,
    mode: Mode,
    /// When false the layer is a pure pass-through.
    enabled: bool,
    /// Marks that [`Escape::skip_to_next_mark`] refuses to jump over.
    unjumpable: Vec<Mark>,
    /// Write side: trailing bytes forming a partial prefix.
    carry: Vec<u8>,
    /// Read side: raw bytes fetched from below, not yet delivered.
    rbuf: Vec<u8>,
    rpos: usize,
    /// Whether the end of the lower stream has been seen.
    reof: bool,
    /// A real mark was reached; reads return 0 until it is consumed.
    pending_mark: Option<Mark>,
    terminated: bool,
}

impl Escape {
    pub fn new(below: Box<dyn Layer>, mode: Mode, enabled: bool) -> Self {
        Self {
            below,
            mode,
            enabled,
            unjumpable: Vec::new(),
            carry: Vec::new(),
            rbuf: Vec::new(),
            rpos: 0,
            reof: false,
            pending_mark: None,
            terminated: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn register_unjumpable(&mut self, mark: Mark) {
        if !self.unjumpable.contains(&mark) {
            self.unjumpable.push(mark);
        }
    }

    fn flush_carry(&mut self) -> Result<()> {
        if !self.carry.is_empty() {
            let carry = std::mem::take(&mut self.carry);
            self.below.write_all(&carry)?;
        }
        Ok(())
    }

    /// Writes a mark at the current position.
    pub fn add_mark(&mut self, mark: Mark) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.mode == Mode::Read {
            return Err(Error::bug());
        }
        self.flush_carry()?;
        self.below.write_all(&PREFIX)?;
        self.below.write_all(&[mark.kind()])
    }

    /// Pulls more raw bytes from below into the scan buffer.
    fn refill(&mut self) -> Result<()> {
        if self.rpos > 0 {
            self.rbuf.drain(..self.rpos);
            self.rpos = 0;
        }
        let old = self.rbuf.len();
        self.rbuf.resize(old + 8192, 0);
        let got = self.below.read(&mut self.rbuf[old..])?;
        self.rbuf.truncate(old + got);
        if got == 0 {
            self.reof = true;
        }
        Ok(())
    }

    /// Consumes the mark the reader stopped at, if any.
    pub fn read_mark(&mut self) -> Option<Mark> {
        self.pending_mark.take()
    }

    /// Scans forward to the next mark of the wanted kind.
    ///
    /// Marks in the unjumpable set stop the scan (returning false) unless
    /// `jump_over` is set. Returns false at end of stream.
    pub fn skip_to_next_mark(&mut self, wanted: Mark, jump_over: bool) -> Result<bool> {
        if !self.enabled {
            return Err(Error::Libcall(
                "archive carries no tape marks to seek to".into(),
            ));
        }
        let mut scratch = [0u8; 8192];
        loop {
            // drain data until the reader halts on a mark or the stream ends
            while self.pending_mark.is_none() {
                if self.read(&mut scratch)? == 0 && self.pending_mark.is_none() {
                    return Ok(false);
                }
            }
            let mark = self.pending_mark.take().ok_or_else(Error::bug)?;
            if mark == wanted {
                return Ok(true);
            }
            if !jump_over && self.unjumpable.contains(&mark) {
                self.pending_mark = Some(mark);
                return Ok(false);
            }
        }
    }

    /// Scans forward to the next mark of any kind.
    pub fn next_mark(&mut self) -> Result<Option<Mark>> {
        if let Some(mark) = self.pending_mark.take() {
            return Ok(Some(mark));
        }
        let mut scratch = [0u8; 8192];
        loop {
            if self.read(&mut scratch)? == 0 {
                return Ok(self.pending_mark.take());
            }
        }
    }
}

impl Layer for Escape {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.mode == Mode::Write {
            return Err(Error::bug());
        }
        if !self.enabled {
            return self.below.read(buf);
        }
        if self.pending_mark.is_some() || buf.is_empty() {
            return Ok(0);
        }
        let mut out = 0;
        loop {
            let avail = self.rbuf.len() - self.rpos;
            if avail < PREFIX.len() + 1 && !self.reof {
                self.refill()?;
                continue;
            }
            if avail == 0 {
                return Ok(out);
            }
            let window = &self.rbuf[self.rpos..];
            // find the first possible prefix position
            let hit = window
                .windows(PREFIX.len())
                .position(|w| w == PREFIX)
                .map(|p| (p, true));
            let (safe, at_prefix) = match hit {
                Some((p, _)) => (p, true),
                None => {
                    // everything except a trailing partial prefix is data,
                    // and at EOF even that is data
                    if self.reof {
                        (window.len(), false)
                    } else {
                        (window.len() - partial_prefix_len(window), false)
                    }
                }
            };
            let deliver = safe.min(buf.len() - out);
            buf[out..out + deliver].copy_from_slice(&window[..deliver]);
            self.rpos += deliver;
            out += deliver;
            if out == buf.len() || !at_prefix || deliver < safe {
                return Ok(out);
            }
            // positioned exactly on a prefix
            if self.rbuf.len() - self.rpos < PREFIX.len() + 1 {
                if self.reof {
                    // truncated mark at end of stream: deliver as data
                    let rest = self.rbuf.len() - self.rpos;
                    let deliver = rest.min(buf.len() - out);
                    let start = self.rpos;
                    buf[out..out + deliver]
                        .copy_from_slice(&self.rbuf[start..start + deliver]);
                    self.rpos += deliver;
                    return Ok(out + deliver);
                }
                self.refill()?;
                continue;
            }
            let kind = self.rbuf[self.rpos + PREFIX.len()];
            if kind == KIND_DATA {
                // escaped data: deliver the prefix bytes, drop the escape
                let deliver = PREFIX.len().min(buf.len() - out);
                buf[out..out + deliver].copy_from_slice(&PREFIX[..deliver]);
                if deliver < PREFIX.len() {
                    // not enough room: deliver what fits and requeue the
                    // remaining prefix bytes as plain data
                    let mut rest = PREFIX[deliver..].to_vec();
                    rest.extend_from_slice(&self.rbuf[self.rpos + PREFIX.len() + 1..]);
                    self.rbuf = rest;
                    self.rpos = 0;
                    return Ok(out + deliver);
                }
                self.rpos += PREFIX.len() + 1;
                out += deliver;
                if out == buf.len() {
                    return Ok(out);
                }
                continue;
            }
            let Some(mark) = Mark::from_kind(kind) else {
                return Err(Error::Data(format!("unknown tape mark kind {kind:#x}")));
            };
            self.rpos += PREFIX.len() + 1;
            self.pending_mark = Some(mark);
            return Ok(out);
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.mode == Mode::Read || self.terminated {
            return Err(Error::bug());
        }
        if !self.enabled {
            return self.below.write_all(buf);
        }
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(buf);

        let mut written_to = 0;
        let mut i = 0;
        while i + PREFIX.len() <= data.len() {
            if data[i..i + PREFIX.len()] == PREFIX {
                let upto = i + PREFIX.len();
                self.below.write_all(&data[written_to..upto])?;
                self.below.write_all(&[KIND_DATA])?;
                written_to = upto;
                i = upto;
            } else {
                i += 1;
            }
        }
        let keep = partial_prefix_len(&data[written_to..]);
        let flush_end = data.len() - keep;
        if flush_end > written_to {
            self.below.write_all(&data[written_to..flush_end])?;
        }
        self.carry = data[flush_end..].to_vec();
        Ok(())
    }

    fn skip(&mut self, pos: u64) -> Result<bool> {
        if self.mode != Mode::Read {
            return Err(Error::bug());
        }
        self.rbuf.clear();
        self.rpos = 0;
        self.reof = false;
        self.pending_mark = None;
        self.below.skip(pos)
    }

    fn skip_to_eof(&mut self) -> Result<u64> {
        self.rbuf.clear();
        self.rpos = 0;
        self.reof = false;
        self.pending_mark = None;
        self.below.skip_to_eof()
    }

    fn skippable(&self, direction: SkipDirection, amount: u64) -> bool {
        self.below.skippable(direction, amount)
    }

    fn position(&mut self) -> Result<u64> {
        match self.mode {
            Mode::Read => {
                let ahead = (self.rbuf.len() - self.rpos) as u64;
                Ok(self.below.position()? - ahead)
            }
            _ => Ok(self.below.position()? + self.carry.len() as u64),
        }
    }

    fn sync_write(&mut self) -> Result<()> {
        if self.mode != Mode::Read {
            self.flush_carry()?;
        }
        self.below.sync_write()
    }

    fn flush_read(&mut self) -> Result<()> {
        self.rbuf.clear();
        self.rpos = 0;
        self.reof = false;
        self.pending_mark = None;
        self.below.flush_read()
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Err(Error::bug());
        }
        self.terminated = true;
        if self.mode != Mode::Read {
            self.flush_carry()?;
        }
        Ok(())
    }

    fn below_mut(&mut self) -> Option<&mut dyn Layer> {
        Some(self.below.as_mut())
    }

    fn as_escape(&mut self) -> Option<&mut Escape> {
        Some(self)
    }

    fn take_below(&mut self) -> Option<Box<dyn Layer>> {
        Some(std::mem::replace(&mut self.below, Box::new(NoLayer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::MemoryLayer;

    fn written(escape: Escape) -> Vec<u8> {
        let mut e = escape;
        let mut below = e.take_below().unwrap();
        let end = below.position().unwrap();
        below.skip(0).unwrap();
        let mut out = vec![0u8; end as usize];
        below.read_exact(&mut out).unwrap();
        out
    }

    fn reader(raw: Vec<u8>) -> Escape {
        Escape::new(Box::new(MemoryLayer::from_vec(raw)), Mode::Read, true)
    }

    #[test]
    fn marks_and_data_round_trip() {
        let below = Box::new(MemoryLayer::new(Mode::ReadWrite));
        let mut esc = Escape::new(below, Mode::Write, true);
        esc.add_mark(Mark::EntryHeader).unwrap();
        esc.write_all(b"header bytes").unwrap();
        esc.add_mark(Mark::DataStart).unwrap();
        esc.write_all(b"file data").unwrap();
        esc.add_mark(Mark::DataEnd).unwrap();
        esc.terminate().unwrap();
        let raw = written(esc);

        let mut esc = reader(raw);
        assert!(esc.skip_to_next_mark(Mark::EntryHeader, false).unwrap());
        let mut head = [0u8; 12];
        esc.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"header bytes");
        // reader halts on the next mark
        let mut probe = [0u8; 4];
        assert_eq!(esc.read(&mut probe).unwrap(), 0);
        assert_eq!(esc.read_mark(), Some(Mark::DataStart));
        let mut data = [0u8; 9];
        esc.read_exact(&mut data).unwrap();
        assert_eq!(&data, b"file data");
        assert_eq!(esc.read(&mut probe).unwrap(), 0);
        assert_eq!(esc.read_mark(), Some(Mark::DataEnd));
    }

    #[test]
    fn data_containing_the_prefix_is_escaped() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"before");
        payload.extend_from_slice(&PREFIX);
        payload.extend_from_slice(b"after");

        let below = Box::new(MemoryLayer::new(Mode::ReadWrite));
        let mut esc = Escape::new(below, Mode::Write, true);
        esc.write_all(&payload).unwrap();
        esc.terminate().unwrap();
        let raw = written(esc);
        assert_eq!(raw.len(), payload.len() + 1);

        let mut esc = reader(raw);
        let mut back = vec![0u8; payload.len()];
        esc.read_exact(&mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn prefix_split_across_writes() {
        let below = Box::new(MemoryLayer::new(Mode::ReadWrite));
        let mut esc = Escape::new(below, Mode::Write, true);
        esc.write_all(&PREFIX[..2]).unwrap();
        esc.write_all(&PREFIX[2..]).unwrap();
        esc.write_all(b"tail").unwrap();
        esc.terminate().unwrap();
        let raw = written(esc);

        let mut esc = reader(raw);
        let mut back = vec![0u8; PREFIX.len() + 4];
        esc.read_exact(&mut back).unwrap();
        assert_eq!(&back[..5], &PREFIX);
        assert_eq!(&back[5..], b"tail");
    }

    #[test]
    fn unjumpable_marks_stop_the_scan() {
        let below = Box::new(MemoryLayer::new(Mode::ReadWrite));
        let mut esc = Escape::new(below, Mode::Write, true);
        esc.write_all(b"aaa").unwrap();
        esc.add_mark(Mark::CatalogueStart).unwrap();
        esc.write_all(b"bbb").unwrap();
        esc.add_mark(Mark::DataStart).unwrap();
        esc.terminate().unwrap();
        let raw = written(esc);

        let mut esc = reader(raw);
        esc.register_unjumpable(Mark::CatalogueStart);
        assert!(!esc.skip_to_next_mark(Mark::DataStart, false).unwrap());
        // the blocking mark is still available
        assert_eq!(esc.read_mark(), Some(Mark::CatalogueStart));

        let mut esc = reader(written_again());
        fn written_again() -> Vec<u8> {
            let below = Box::new(MemoryLayer::new(Mode::ReadWrite));
            let mut esc = Escape::new(below, Mode::Write, true);
            esc.write_all(b"aaa").unwrap();
            esc.add_mark(Mark::CatalogueStart).unwrap();
            esc.write_all(b"bbb").unwrap();
            esc.add_mark(Mark::DataStart).unwrap();
            esc.terminate().unwrap();
            written(esc)
        }
        assert!(esc.skip_to_next_mark(Mark::DataStart, true).unwrap());
    }

    #[test]
    fn disabled_layer_is_transparent() {
        let below = Box::new(MemoryLayer::new(Mode::ReadWrite));
        let mut esc = Escape::new(below, Mode::Write, false);
        esc.add_mark(Mark::EntryHeader).unwrap();
        esc.write_all(&PREFIX).unwrap();
        esc.terminate().unwrap();
        let raw = written(esc);
        assert_eq!(raw, PREFIX.to_vec());
    }
}
