//! Archive header.
//!
//! The header opens the archive in cleartext (the cipher parameters must be
//! readable before any key is derived) and is written a second time inside
//! the trailer, followed by the catalogue offset. Optional fields are
//! announced by a flags byte.

use crate::cipher::{CipherAlgo, KdfHash, KdfParams};
use crate::compressor::CompressionAlgo;
use crate::error::{Error, Result};
use crate::infinint;
use crate::label::Label;
use crate::layer::Layer;
use crate::slicer::SliceLayout;

const HEADER_MAGIC: &[u8; 8] = b"CofArHd\x01";
/// Current wire format edition.
pub const FORMAT_EDITION: u8 = 1;

const FLAG_TAPE_MARKS: u8 = 0x01;
const FLAG_CIPHERED: u8 = 0x02;
const FLAG_INITIAL_OFFSET: u8 = 0x04;
const FLAG_CRYPTED_KEY: u8 = 0x08;
const FLAG_REF_SLICING: u8 = 0x10;

/// Cleartext prefix (and trailer core) of every archive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArchiveHeader {
    pub edition: u8,
    pub compression: CompressionAlgo,
    pub cipher: Option<CipherAlgo>,
    /// Free-form user comment.
    pub comment: String,
    /// Identity tying the catalogue to this archive's data.
    pub data_name: Label,
    /// Whether the stream carries tape marks.
    pub tape_marks: bool,
    /// Offset of the first entry, when the archive does not start at zero.
    pub initial_offset: Option<u64>,
    /// Cleartext bytes per encrypted block, when ciphered.
    pub crypto_block_size: u64,
    /// Passphrase key derivation parameters.
    pub kdf: Option<KdfParams>,
    /// Session key wrapped for asymmetric recipients.
    pub crypted_key: Option<Vec<u8>>,
    /// Slicing of the archive of reference (isolated catalogues only).
    pub ref_slicing: Option<SliceLayout>,
}

impl ArchiveHeader {
    pub fn new(compression: CompressionAlgo, data_name: Label) -> Self {
        Self {
            edition: FORMAT_EDITION,
            compression,
            cipher: None,
            comment: String::new(),
            data_name,
            tape_marks: true,
            initial_offset: None,
            crypto_block_size: 0,
            kdf: None,
            crypted_key: None,
            ref_slicing: None,
        }
    }

    pub fn is_ciphered(&self) -> bool {
        self.cipher.is_some()
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.tape_marks {
            flags |= FLAG_TAPE_MARKS;
        }
        if self.cipher.is_some() {
            flags |= FLAG_CIPHERED;
        }
        if self.initial_offset.is_some() {
            flags |= FLAG_INITIAL_OFFSET;
        }
        if self.crypted_key.is_some() {
            flags |= FLAG_CRYPTED_KEY;
        }
        if self.ref_slicing.is_some() {
            flags |= FLAG_REF_SLICING;
        }
        flags
    }

    pub fn dump(&self, f: &mut dyn Layer) -> Result<()> {
        f.write_all(HEADER_MAGIC)?;
        f.write_all(&[self.edition, self.flags(), self.compression.code()])?;
        if let Some(cipher) = self.cipher {
            f.write_all(&[cipher.code()])?;
            infinint::dump_u64(f, self.crypto_block_size)?;
            match &self.kdf {
                Some(kdf) => {
                    f.write_all(&[1, kdf.hash.code()])?;
                    infinint::dump_u64(f, kdf.iterations as u64)?;
                    infinint::dump_byte_block(f, &kdf.salt)?;
                }
                None => f.write_all(&[0])?,
            }
        }
        if let Some(key) = &self.crypted_key {
            infinint::dump_byte_block(f, key)?;
        }
        if let Some(offset) = self.initial_offset {
            infinint::dump_u64(f, offset)?;
        }
        if let Some(layout) = &self.ref_slicing {
            layout.dump(f)?;
        }
        infinint::dump_string(f, &self.comment)?;
        self.data_name.dump(f)
    }

    pub fn read(f: &mut dyn Layer) -> Result<Self> {
        let mut magic = [0u8; 8];
        f.read_exact(&mut magic)?;
        if &magic != HEADER_MAGIC {
            return Err(Error::Data("bad archive header magic".into()));
        }
        let mut fixed = [0u8; 3];
        f.read_exact(&mut fixed)?;
        let [edition, flags, compression] = fixed;
        if edition != FORMAT_EDITION {
            return Err(Error::Data(format!(
                "unsupported archive format edition {edition}"
            )));
        }
        let compression = CompressionAlgo::from_code(compression)?;

        let mut cipher = None;
        let mut kdf = None;
        let mut crypto_block_size = 0;
        if flags & FLAG_CIPHERED != 0 {
            let mut code = [0u8; 1];
            f.read_exact(&mut code)?;
            cipher = Some(CipherAlgo::from_code(code[0])?);
            crypto_block_size = infinint::read_u64(f)?;
            let mut has_kdf = [0u8; 1];
            f.read_exact(&mut has_kdf)?;
            if has_kdf[0] == 1 {
                let mut hash = [0u8; 1];
                f.read_exact(&mut hash)?;
                let hash = KdfHash::from_code(hash[0])?;
                let iterations = infinint::read_u64(f)?;
                let iterations = u32::try_from(iterations)
                    .map_err(|_| Error::Data("KDF iteration count out of range".into()))?;
                let salt = infinint::read_byte_block(f)?;
                kdf = Some(KdfParams {
                    hash,
                    iterations,
                    salt,
                });
            }
        }
        let crypted_key = if flags & FLAG_CRYPTED_KEY != 0 {
            Some(infinint::read_byte_block(f)?)
        } else {
            None
        };
        let initial_offset = if flags & FLAG_INITIAL_OFFSET != 0 {
            Some(infinint::read_u64(f)?)
        } else {
            None
        };
        let ref_slicing = if flags & FLAG_REF_SLICING != 0 {
            Some(SliceLayout::read(f)?)
        } else {
            None
        };
        let comment = infinint::read_string(f)?;
        let data_name = Label::read(f)?;

        Ok(Self {
            edition,
            compression,
            cipher,
            comment,
            data_name,
            tape_marks: flags & FLAG_TAPE_MARKS != 0,
            initial_offset,
            crypto_block_size,
            kdf,
            crypted_key,
            ref_slicing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{MemoryLayer, Mode};

    fn round_trip(header: &ArchiveHeader) -> ArchiveHeader {
        let mut m = MemoryLayer::new(Mode::ReadWrite);
        header.dump(&mut m).unwrap();
        m.skip(0).unwrap();
        ArchiveHeader::read(&mut m).unwrap()
    }

    #[test]
    fn plain_header_round_trip() {
        let header = ArchiveHeader::new(CompressionAlgo::None, Label::random());
        assert_eq!(round_trip(&header), header);
    }

    #[test]
    fn full_header_round_trip() {
        let mut header = ArchiveHeader::new(CompressionAlgo::Gzip, Label::random());
        header.comment = "nightly backup of /home".into();
        header.cipher = Some(CipherAlgo::Aes256);
        header.crypto_block_size = 10_240;
        header.kdf = Some(KdfParams {
            hash: KdfHash::Sha512,
            iterations: 200_000,
            salt: vec![7; 16],
        });
        header.crypted_key = Some(vec![1, 2, 3, 4]);
        header.initial_offset = Some(117);
        header.ref_slicing = Some(SliceLayout::sliced(10_000_000, 10_000_000));
        header.tape_marks = false;
        assert_eq!(round_trip(&header), header);
    }

    #[test]
    fn rejects_foreign_stream() {
        let mut m = MemoryLayer::from_vec(b"definitely not an archive".to_vec());
        assert!(matches!(ArchiveHeader::read(&mut m), Err(Error::Data(_))));
    }
}
