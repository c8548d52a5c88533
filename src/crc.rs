//! Variable-width cyclic checksum.
//!
//! Data, EA and FSA blocks each carry a checksum whose width grows with the
//! amount of bytes covered. The checksum folds every byte into a cyclic
//! window by XOR, which makes it cheap, order-sensitive within the window,
//! and lets runs of zeros (sparse holes) be accounted for by advancing the
//! cursor without touching the window.

use crate::error::{Error, Result};
use crate::infinint;
use crate::layer::Layer;

/// Checksum width in bytes for a field of `size` bytes.
pub fn width_for_size(size: u64) -> usize {
    match size {
         0..0x1_0000 => 1,
        0x1_0000..0x10_0000 => 2,
        0x10_0000..0x4000_0000 => 4,
        _ => 8,
    }
}

/// A running cyclic checksum.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Crc {
    window: Vec<u8>,
    cursor: usize,
}

impl Crc {
    /// Creates a zeroed checksum of the given width. Width is at least one.
    pub fn new(width: usize) -> Self {
        Self {
            window: vec![0; width.max(1)],
            cursor: 0,
        }
    }

    /// Checksum sized for a field of `size` bytes.
    pub fn for_size(size: u64) -> Self {
        Self::new(width_for_size(size))
    }

    pub fn width(&self) -> usize {
        self.window.len()
    }

    /// Folds bytes into the window.
    pub fn add(&mut self, data: &[u8]) {
        for b in data {
            self.window[self.cursor] ^= b;
            self.cursor = (self.cursor + 1) % self.window.len();
        }
    }

    /// Accounts for `count` zero bytes without touching the window.
    pub fn add_zeros(&mut self, count: u64) {
        self.cursor = ((self.cursor as u64 + count) % self.window.len() as u64) as usize;
    }

    pub fn value(&self) -> &[u8] {
        &self.window
    }

    /// Reduces the checksum to a narrower window. Valid because every
    /// supported width divides the widest one, so byte positions congruent
    /// modulo the narrow width fold together.
    pub fn fold_to(&self, width: usize) -> Self {
        let width = width.max(1);
        if width >= self.window.len() {
            return self.clone();
        }
        let mut folded = Self::new(width);
        for (i, b) in self.window.iter().enumerate() {
            folded.window[i % width] ^= b;
        }
        folded.cursor = self.cursor % width;
        folded
    }

    /// Serializes the checksum: width then window bytes.
    pub fn dump(&self, f: &mut dyn Layer) -> Result<()> {
        infinint::dump_u64(f, self.window.len() as u64)?;
        f.write_all(&self.window)
    }

    /// Deserializes a checksum written by [`Crc::dump`].
    pub fn read(f: &mut dyn Layer) -> Result<Self> {
        let width = infinint::read_u64(f)?;
        if width == 0 || width > 64 {
            return Err(Error::Data("invalid checksum width".into()));
        }
        let mut window = vec![0u8; width as usize];
        f.read_exact(&mut window)?;
        Ok(Self { window, cursor: 0 })
    }
}

/// Pass-through adapter folding every byte read or written into a checksum.
pub struct CrcTee<'a> {
    below: &'a mut dyn Layer,
    crc: &'a mut Crc,
}

impl<'a> CrcTee<'a> {
    pub fn new(below: &'a mut dyn Layer, crc: &'a mut Crc) -> Self {
        Self { below, crc }
    }
}

impl Layer for CrcTee<'_> {
    fn mode(&self) -> crate::layer::Mode {
        self.below.mode()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.below.read(buf)?;
        self.crc.add(&buf[..n]);
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.crc.add(buf);
        self.below.write_all(buf)
    }

    fn skip(&mut self, _pos: u64) -> Result<bool> {
        // a seek would leave the checksum covering a hole
        Err(Error::bug())
    }

    fn skip_to_eof(&mut self) -> Result<u64> {
        Err(Error::bug())
    }

    fn skippable(&self, _d: crate::layer::SkipDirection, _n: u64) -> bool {
        false
    }

    fn position(&mut self) -> Result<u64> {
        self.below.position()
    }

    fn sync_write(&mut self) -> Result<()> {
        self.below.sync_write()
    }

    fn flush_read(&mut self) -> Result<()> {
        self.below.flush_read()
    }

    fn terminate(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{MemoryLayer, Mode};

    #[test]
    fn width_heuristic() {
        assert_eq!(width_for_size(0), 1);
        assert_eq!(width_for_size(0xffff), 1);
        assert_eq!(width_for_size(0x1_0000), 2);
        assert_eq!(width_for_size(0x10_0000), 4);
        assert_eq!(width_for_size(u64::MAX), 8);
    }

    #[test]
    fn detects_any_single_bit_flip() {
        let data = b"some archive payload with enough bytes to wrap the window";
        let mut reference = Crc::new(4);
        reference.add(data);
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut corrupted = data.to_vec();
                corrupted[byte] ^= 1 << bit;
                let mut crc = Crc::new(4);
                crc.add(&corrupted);
                assert_ne!(crc, reference, "flip at {byte}:{bit} undetected");
            }
        }
    }

    #[test]
    fn folding_matches_direct_computation() {
        let data = b"folding across widths must be exact, whatever the phase";
        for width in [1usize, 2, 4] {
            let mut wide = Crc::new(8);
            wide.add(data);
            let mut direct = Crc::new(width);
            direct.add(data);
            assert_eq!(wide.fold_to(width).value(), direct.value(), "width {width}");
        }
    }

    #[test]
    fn zeros_shortcut_matches_explicit_zeros() {
        let mut explicit = Crc::new(4);
        explicit.add(b"abc");
        explicit.add(&[0u8; 1000]);
        explicit.add(b"xyz");

        let mut shortcut = Crc::new(4);
        shortcut.add(b"abc");
        shortcut.add_zeros(1000);
        shortcut.add(b"xyz");

        assert_eq!(explicit, shortcut);
    }

    #[test]
    fn dump_read_round_trip() {
        let mut crc = Crc::new(2);
        crc.add(b"hello");
        let mut m = MemoryLayer::new(Mode::ReadWrite);
        crc.dump(&mut m).unwrap();
        m.skip(0).unwrap();
        let back = Crc::read(&mut m).unwrap();
        assert_eq!(back.value(), crc.value());
    }
}
