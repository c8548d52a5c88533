//! Extended attributes.
//!
//! An inode carries an EA status, and when the status is `Full` an ordered
//! name to value mapping. The mapping bytes live in the data stream at the
//! offset recorded with the inode; the catalogue only keeps status, offset,
//! size and checksum.

use crate::error::{Error, Result};
use crate::infinint;
use crate::layer::Layer;

/// EA situation of an inode.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EaStatus {
    /// No EA on the filesystem entry.
    #[default]
    None,
    /// EA exist but are not stored in this archive; ctime tracks changes.
    Partial,
    /// EA exist and their bytes are stored.
    Full,
    /// Legacy status found in old reference catalogues.
    Fake,
    /// EA existed in the reference and were removed since.
    Removed,
}

impl EaStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::None => b'n',
            Self::Partial => b'p',
            Self::Full => b'f',
            Self::Fake => b'k',
            Self::Removed => b'r',
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            b'n' => Ok(Self::None),
            b'p' => Ok(Self::Partial),
            b'f' => Ok(Self::Full),
            b'k' => Ok(Self::Fake),
            b'r' => Ok(Self::Removed),
            _ => Err(Error::Data(format!("unknown EA status {code:#x}"))),
        }
    }
}

/// Ordered EA name to value mapping.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EaSet {
    entries: Vec<(String, Vec<u8>)>,
}

impl EaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an attribute, keeping insertion order on replace.
    pub fn add(&mut self, name: impl Into<String>, value: Vec<u8>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| n != name);
        self.entries.len() != before
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes of names and values, used to size the checksum.
    pub fn byte_size(&self) -> u64 {
        self.entries
            .iter()
            .map(|(n, v)| (n.len() + v.len()) as u64)
            .sum()
    }

    pub fn dump(&self, f: &mut dyn Layer) -> Result<()> {
        infinint::dump_u64(f, self.entries.len() as u64)?;
        for (name, value) in &self.entries {
            infinint::dump_string(f, name)?;
            infinint::dump_byte_block(f, value)?;
        }
        Ok(())
    }

    pub fn read(f: &mut dyn Layer) -> Result<Self> {
        let count = infinint::read_u64(f)?;
        let mut set = Self::new();
        for _ in 0..count {
            let name = infinint::read_string(f)?;
            let value = infinint::read_byte_block(f)?;
            set.entries.push((name, value));
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{MemoryLayer, Mode};

    #[test]
    fn ordered_add_replace_remove() {
        let mut set = EaSet::new();
        set.add("user.comment", b"one".to_vec());
        set.add("security.selinux", b"ctx".to_vec());
        set.add("user.comment", b"two".to_vec());
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("user.comment"), Some(b"two".as_slice()));
        let names: Vec<_> = set.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["user.comment", "security.selinux"]);
        assert!(set.remove("user.comment"));
        assert!(!set.remove("user.comment"));
    }

    #[test]
    fn round_trip() {
        let mut set = EaSet::new();
        set.add("user.a", b"alpha".to_vec());
        set.add("user.b", vec![0, 1, 2, 255]);
        let mut m = MemoryLayer::new(Mode::ReadWrite);
        set.dump(&mut m).unwrap();
        m.skip(0).unwrap();
        assert_eq!(EaSet::read(&mut m).unwrap(), set);
    }
}
