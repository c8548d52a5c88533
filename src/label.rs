//! 16-byte opaque identity labels.
//!
//! Each archive is stamped with a random label (its data name) written in
//! every slice header and in the catalogue. An isolated catalogue keeps the
//! label of the archive it was extracted from, which is how the engine
//! refuses to pair a catalogue with the wrong archive's slices.

use std::fmt;

use crate::error::Result;
use crate::layer::Layer;

/// Type representing an archive identity label.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Label(pub [u8; 16]);

impl Label {
    pub const SIZE: usize = 16;

    /// Generates a random label.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// The all-zero label, used before an identity is assigned.
    pub fn cleared() -> Self {
        Self([0; 16])
    }

    pub fn is_cleared(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn dump(&self, f: &mut dyn Layer) -> Result<()> {
        f.write_all(&self.0)
    }

    pub fn read(f: &mut dyn Layer) -> Result<Self> {
        let mut bytes = [0u8; 16];
        f.read_exact(&mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(fmt, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{MemoryLayer, Mode};

    #[test]
    fn random_labels_differ() {
        assert_ne!(Label::random(), Label::random());
        assert!(!Label::random().is_cleared());
        assert!(Label::cleared().is_cleared());
    }

    #[test]
    fn round_trip() {
        let label = Label::random();
        let mut m = MemoryLayer::new(Mode::ReadWrite);
        label.dump(&mut m).unwrap();
        m.skip(0).unwrap();
        assert_eq!(Label::read(&mut m).unwrap(), label);
    }
}
