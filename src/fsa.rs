//! Filesystem-specific attributes.
//!
//! FSA mirror extended attributes but are scoped by filesystem family: the
//! ext family carries inode flags (append-only, immutable, ...), HFS+
//! carries a creation date. An inode records which families it holds
//! attributes for; the attribute bytes live in the data stream like EA.

use crate::error::{Error, Result};
use crate::infinint;
use crate::layer::Layer;

/// Filesystem family an attribute belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsaFamily {
    HfsPlus,
    LinuxExtX,
}

impl FsaFamily {
    /// Bit used in the families mask of an inode.
    pub fn bit(self) -> u8 {
        match self {
            Self::HfsPlus => 0x01,
            Self::LinuxExtX => 0x02,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::HfsPlus => b'h',
            Self::LinuxExtX => b'x',
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            b'h' => Ok(Self::HfsPlus),
            b'x' => Ok(Self::LinuxExtX),
            _ => Err(Error::Data(format!("unknown FSA family {code:#x}"))),
        }
    }
}

/// FSA situation of an inode, like the EA status.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FsaStatus {
    #[default]
    None,
    /// FSA exist on the filesystem but are not stored in this archive.
    Partial,
    /// FSA are stored.
    Full,
}

impl FsaStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::None => b'n',
            Self::Partial => b'p',
            Self::Full => b'f',
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            b'n' => Ok(Self::None),
            b'p' => Ok(Self::Partial),
            b'f' => Ok(Self::Full),
            _ => Err(Error::Data(format!("unknown FSA status {code:#x}"))),
        }
    }
}

/// What a single attribute describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsaNature {
    AppendOnly,
    Immutable,
    NoDump,
    NoAtime,
    CreationDate,
}

impl FsaNature {
    pub fn code(self) -> u8 {
        match self {
            Self::AppendOnly => b'a',
            Self::Immutable => b'i',
            Self::NoDump => b'd',
            Self::NoAtime => b't',
            Self::CreationDate => b'c',
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            b'a' => Ok(Self::AppendOnly),
            b'i' => Ok(Self::Immutable),
            b'd' => Ok(Self::NoDump),
            b't' => Ok(Self::NoAtime),
            b'c' => Ok(Self::CreationDate),
            _ => Err(Error::Data(format!("unknown FSA nature {code:#x}"))),
        }
    }
}

/// Attribute value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsaValue {
    Bool(bool),
    Time(i64),
}

/// One {family, nature, value} triple.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Fsa {
    pub family: FsaFamily,
    pub nature: FsaNature,
    pub value: FsaValue,
}

/// The attributes carried by one inode.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FsaSet {
    items: Vec<Fsa>,
}

impl FsaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fsa: Fsa) {
        self.items.push(fsa);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fsa> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Mask of the families present in the set.
    pub fn families(&self) -> u8 {
        self.items.iter().fold(0, |acc, f| acc | f.family.bit())
    }

    /// Approximate byte weight, used to size the checksum.
    pub fn byte_size(&self) -> u64 {
        self.items.len() as u64 * 11
    }

    pub fn dump(&self, f: &mut dyn Layer) -> Result<()> {
        infinint::dump_u64(f, self.items.len() as u64)?;
        for fsa in &self.items {
            f.write_all(&[fsa.family.code(), fsa.nature.code()])?;
            match fsa.value {
                FsaValue::Bool(b) => f.write_all(&[b'b', b as u8])?,
                FsaValue::Time(t) => {
                    f.write_all(&[b't'])?;
                    infinint::dump_i64(f, t)?;
                }
            }
        }
        Ok(())
    }

    pub fn read(f: &mut dyn Layer) -> Result<Self> {
        let count = infinint::read_u64(f)?;
        let mut set = Self::new();
        for _ in 0..count {
            let mut head = [0u8; 2];
            f.read_exact(&mut head)?;
            let family = FsaFamily::from_code(head[0])?;
            let nature = FsaNature::from_code(head[1])?;
            let mut kind = [0u8; 1];
            f.read_exact(&mut kind)?;
            let value = match kind[0] {
                b'b' => {
                    let mut b = [0u8; 1];
                    f.read_exact(&mut b)?;
                    FsaValue::Bool(b[0] != 0)
                }
                b't' => FsaValue::Time(infinint::read_i64(f)?),
                _ => return Err(Error::Data("unknown FSA value kind".into())),
            };
            set.push(Fsa {
                family,
                nature,
                value,
            });
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{MemoryLayer, Mode};

    #[test]
    fn families_mask() {
        let mut set = FsaSet::new();
        assert_eq!(set.families(), 0);
        set.push(Fsa {
            family: FsaFamily::LinuxExtX,
            nature: FsaNature::Immutable,
            value: FsaValue::Bool(true),
        });
        set.push(Fsa {
            family: FsaFamily::HfsPlus,
            nature: FsaNature::CreationDate,
            value: FsaValue::Time(1_500_000_000),
        });
        assert_eq!(set.families(), 0x03);
    }

    #[test]
    fn round_trip() {
        let mut set = FsaSet::new();
        set.push(Fsa {
            family: FsaFamily::LinuxExtX,
            nature: FsaNature::AppendOnly,
            value: FsaValue::Bool(false),
        });
        set.push(Fsa {
            family: FsaFamily::HfsPlus,
            nature: FsaNature::CreationDate,
            value: FsaValue::Time(-12345),
        });
        let mut m = MemoryLayer::new(Mode::ReadWrite);
        set.dump(&mut m).unwrap();
        m.skip(0).unwrap();
        assert_eq!(FsaSet::read(&mut m).unwrap(), set);
    }
}
