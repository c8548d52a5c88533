//! Block encryption layer.
//!
//! The ciphered region is a sequence of independently encrypted blocks of a
//! fixed cleartext size (10 KiB by default). Each block is framed as a
//! 4-byte cleartext length, the ciphertext, and a 32-byte authentication
//! tag over the block index, the length and the ciphertext. Keeping the
//! frames independent gives random access at block granularity: skips to
//! non-block-aligned offsets are reported non-skippable and served by
//! decrypting the containing block.
//!
//! Keys are derived from the passphrase with PBKDF2 (iteration count, salt
//! and hash function recorded in the archive header), or provided directly
//! when the header carries a wrapped session key. The legacy `scrambling`
//! transformation (XOR with the cycled passphrase) is supported for reading
//! old archives only.

use aes::Aes256;
use aes::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

use crate::error::{Error, Result};
use crate::layer::{Layer, Mode, NoLayer, SkipDirection};
use crate::secure::SecuString;

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Default cleartext bytes per encrypted block.
pub const DEFAULT_BLOCK_SIZE: usize = 10_240;
/// Frame overhead: length prefix + authentication tag.
const FRAME_OVERHEAD: u64 = 4 + 32;
/// Derived key material: 32 bytes cipher key + 32 bytes MAC key.
const KEY_LEN: usize = 64;

/// Symmetric cipher algorithms known to the wire format.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CipherAlgo {
    /// Legacy XOR transformation. Read-only.
    Scrambling,
    Blowfish,
    Aes256,
    Twofish256,
    Serpent256,
    Camellia256,
}

impl CipherAlgo {
    pub fn code(self) -> u8 {
        match self {
            Self::Scrambling => b'S',
            Self::Blowfish => b'B',
            Self::Aes256 => b'A',
            Self::Twofish256 => b'T',
            Self::Serpent256 => b'P',
            Self::Camellia256 => b'C',
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            b'S' => Ok(Self::Scrambling),
            b'B' => Ok(Self::Blowfish),
            b'A' => Ok(Self::Aes256),
            b'T' => Ok(Self::Twofish256),
            b'P' => Ok(Self::Serpent256),
            b'C' => Ok(Self::Camellia256),
            _ => Err(Error::Data(format!("unknown cipher code {code:#x}"))),
        }
    }
}

/// Hash function driving the key derivation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KdfHash {
    Sha1,
    Sha512,
}

impl KdfHash {
    pub fn code(self) -> u8 {
        match self {
            Self::Sha1 => b'1',
            Self::Sha512 => b'5',
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            b'1' => Ok(Self::Sha1),
            b'5' => Ok(Self::Sha512),
            _ => Err(Error::Data(format!("unknown KDF hash code {code:#x}"))),
        }
    }
}

/// Key derivation parameters, recorded in the archive header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KdfParams {
    pub hash: KdfHash,
    pub iterations: u32,
    pub salt: Vec<u8>,
}

impl KdfParams {
    /// Fresh parameters with a random salt.
    pub fn generate(hash: KdfHash, iterations: u32) -> Self {
        use rand_core::RngCore;
        let mut salt = vec![0u8; 16];
        rand_core::OsRng.fill_bytes(&mut salt);
        Self {
            hash,
            iterations,
            salt,
        }
    }

    /// Derives the block-cipher and MAC keys from a passphrase.
    pub fn derive(&self, passphrase: &SecuString) -> Result<SecuString> {
        let mut key = vec![0u8; KEY_LEN];
        let outcome = match self.hash {
            KdfHash::Sha1 => pbkdf2::pbkdf2::<Hmac<sha1::Sha1>>(
                passphrase.as_bytes(),
                &self.salt,
                self.iterations,
                &mut key,
            ),
            KdfHash::Sha512 => pbkdf2::pbkdf2::<Hmac<Sha512>>(
                passphrase.as_bytes(),
                &self.salt,
                self.iterations,
                &mut key,
            ),
        };
        outcome.map_err(|_| Error::bug())?;
        Ok(SecuString::new(key))
    }
}

/// Generates a random session key, for use with recipient-wrapped keys.
pub fn random_session_key() -> SecuString {
    use rand_core::RngCore;
    let mut key = vec![0u8; KEY_LEN];
    rand_core::OsRng.fill_bytes(&mut key);
    SecuString::new(key)
}

enum Algorithm {
    /// AES-256-CTR with per-block IV and HMAC-SHA256 tags.
    Block,
    /// Byte-wise XOR with the cycled passphrase.
    Scrambling,
}

/// The encryption layer.
pub struct Cipher {
    below: Box<dyn Layer>,
    mode: Mode,
    algorithm: Algorithm,
    /// 64 bytes for block ciphers; the raw passphrase for scrambling.
    key: SecuString,
    block_size: usize,
    /// Offset in the layer below where the ciphered region starts.
    region_start: u64,
    /// Offset in the layer below where the region ends (read side).
    region_end: u64,
    /// Cleartext buffered for the current block (write side).
    pending: Vec<u8>,
    blocks_written: u64,
    suspended: bool,
    /// False once a short block was emitted mid-stream; random access is
    /// then no longer possible.
    uniform: bool,
    /// Decrypted block cache (read side).
    cache: Vec<u8>,
    cache_block: Option<u64>,
    logical: u64,
    terminated: bool,
}

impl Cipher {
    /// Creates the writing side over `below`, starting at its current
    /// position.
    pub fn create(
        mut below: Box<dyn Layer>,
        algo: CipherAlgo,
        key: SecuString,
        block_size: usize,
    ) -> Result<Self> {
        let algorithm = match algo {
            CipherAlgo::Aes256 => Algorithm::Block,
            CipherAlgo::Scrambling => {
                return Err(Error::Range(
                    "refusing to create an archive with the legacy scrambling cipher".into(),
                ));
            }
            _ => return Err(Error::Feature("cipher algorithm")),
        };
        if matches!(algorithm, Algorithm::Block) && key.len() != KEY_LEN {
            return Err(Error::Libcall("cipher key has the wrong length".into()));
        }
        let region_start = below.position()?;
        Ok(Self {
            below,
            mode: Mode::Write,
            algorithm,
            key,
            block_size: block_size.max(1),
            region_start,
            region_end: 0,
            pending: Vec::new(),
            blocks_written: 0,
            suspended: false,
            uniform: true,
            cache: Vec::new(),
            cache_block: None,
            logical: 0,
            terminated: false,
        })
    }

    /// Opens the reading side over the region `[start, end)` of `below`.
    pub fn open(
        below: Box<dyn Layer>,
        algo: CipherAlgo,
        key: SecuString,
        block_size: usize,
        region_start: u64,
        region_end: u64,
    ) -> Result<Self> {
        let algorithm = match algo {
            CipherAlgo::Aes256 => Algorithm::Block,
            CipherAlgo::Scrambling => Algorithm::Scrambling,
            _ => return Err(Error::Feature("cipher algorithm")),
        };
        Ok(Self {
            below,
            mode: Mode::Read,
            algorithm,
            key,
            block_size: block_size.max(1),
            region_start,
            region_end,
            pending: Vec::new(),
            blocks_written: 0,
            suspended: false,
            uniform: true,
            cache: Vec::new(),
            cache_block: None,
            logical: 0,
            terminated: false,
        })
    }

    fn frame_len(&self) -> u64 {
        self.block_size as u64 + FRAME_OVERHEAD
    }

    /// Total cleartext bytes in the region (read side).
    pub fn cleartext_len(&self) -> Result<u64> {
        match self.algorithm {
            Algorithm::Scrambling => Ok(self.region_end - self.region_start),
            Algorithm::Block => {
                let region = self.region_end - self.region_start;
                let full = region / self.frame_len();
                let rest = region % self.frame_len();
                if rest != 0 && rest < FRAME_OVERHEAD {
                    return Err(Error::Data("truncated cipher block".into()));
                }
                let tail = if rest == 0 { 0 } else { rest - FRAME_OVERHEAD };
                Ok(full * self.block_size as u64 + tail)
            }
        }
    }

    fn keystream(&self, block_index: u64, data: &mut [u8]) -> Result<()> {
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&block_index.to_be_bytes());
        let mut ctr = Aes256Ctr::new_from_slices(&self.key.as_bytes()[..32], &iv)
            .map_err(|_| Error::bug())?;
        ctr.apply_keystream(data);
        Ok(())
    }

    fn tag(&self, block_index: u64, ciphertext: &[u8]) -> Result<[u8; 32]> {
        let mut mac = HmacSha256::new_from_slice(&self.key.as_bytes()[32..])
            .map_err(|_| Error::bug())?;
        mac.update(&block_index.to_be_bytes());
        mac.update(&(ciphertext.len() as u32).to_be_bytes());
        mac.update(ciphertext);
        let out = mac.finalize().into_bytes();
        Ok(out.into())
    }

    fn emit_block(&mut self, cleartext: &[u8]) -> Result<()> {
        let mut ct = cleartext.to_vec();
        self.keystream(self.blocks_written, &mut ct)?;
        let tag = self.tag(self.blocks_written, &ct)?;
        self.below.write_all(&(ct.len() as u32).to_be_bytes())?;
        self.below.write_all(&ct)?;
        self.below.write_all(&tag)?;
        self.blocks_written += 1;
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        while self.pending.len() >= self.block_size {
            let block: Vec<u8> = self.pending.drain(..self.block_size).collect();
            self.emit_block(&block)?;
        }
        Ok(())
    }

    fn flush_partial(&mut self) -> Result<()> {
        self.flush_pending()?;
        if !self.pending.is_empty() {
            let block = std::mem::take(&mut self.pending);
            self.emit_block(&block)?;
        }
        Ok(())
    }

    fn load_block(&mut self, block_index: u64) -> Result<()> {
        if self.cache_block == Some(block_index) {
            return Ok(());
        }
        let frame_start = self.region_start + block_index * self.frame_len();
        if frame_start >= self.region_end {
            self.cache.clear();
            self.cache_block = Some(block_index);
            return Ok(());
        }
        self.below.skip(frame_start)?;
        let mut len = [0u8; 4];
        self.below.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len) as usize;
        if len > self.block_size {
            return Err(Error::Data("cipher block length out of range".into()));
        }
        let mut ct = vec![0u8; len];
        self.below.read_exact(&mut ct)?;
        let mut tag = [0u8; 32];
        self.below.read_exact(&mut tag)?;
        let expected = self.tag(block_index, &ct)?;
        if expected != tag {
            return Err(Error::Data(
                "cipher block authentication failed (wrong key or corrupted data)".into(),
            ));
        }
        self.keystream(block_index, &mut ct)?;
        self.cache = ct;
        self.cache_block = Some(block_index);
        Ok(())
    }

    /// Stops ciphering: following writes go through as cleartext.
    pub fn suspend(&mut self) -> Result<()> {
        if self.mode != Mode::Write || self.suspended {
            return Err(Error::bug());
        }
        self.flush_partial()?;
        if self.blocks_written > 0 {
            self.uniform = false;
        }
        self.suspended = true;
        Ok(())
    }

    /// Resumes ciphering after [`Cipher::suspend`].
    pub fn resume(&mut self) -> Result<()> {
        if self.mode != Mode::Write || !self.suspended {
            return Err(Error::bug());
        }
        self.suspended = false;
        Ok(())
    }
}

impl Layer for Cipher {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.mode != Mode::Read || buf.is_empty() {
            return Err(Error::bug());
        }
        match self.algorithm {
            Algorithm::Scrambling => {
                let avail = (self.region_end - self.region_start).saturating_sub(self.logical);
                if avail == 0 {
                    return Ok(0);
                }
                self.below.skip(self.region_start + self.logical)?;
                let want = (buf.len() as u64).min(avail) as usize;
                let got = self.below.read(&mut buf[..want])?;
                let pass = self.key.as_bytes();
                for (i, b) in buf[..got].iter_mut().enumerate() {
                    *b ^= pass[(self.logical as usize + i) % pass.len()];
                }
                self.logical += got as u64;
                Ok(got)
            }
            Algorithm::Block => {
                let block = self.logical / self.block_size as u64;
                let offset = (self.logical % self.block_size as u64) as usize;
                self.load_block(block)?;
                if offset >= self.cache.len() {
                    return Ok(0);
                }
                let n = (self.cache.len() - offset).min(buf.len());
                buf[..n].copy_from_slice(&self.cache[offset..offset + n]);
                self.logical += n as u64;
                Ok(n)
            }
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.mode != Mode::Write || self.terminated {
            return Err(Error::bug());
        }
        if self.suspended {
            return self.below.write_all(buf);
        }
        self.pending.extend_from_slice(buf);
        self.logical += buf.len() as u64;
        self.flush_pending()
    }

    fn skip(&mut self, pos: u64) -> Result<bool> {
        if self.mode != Mode::Read {
            return Err(Error::bug());
        }
        if !self.uniform {
            return Err(Error::Libcall(
                "random access in a non-uniform ciphered stream".into(),
            ));
        }
        self.logical = pos;
        Ok(pos <= self.cleartext_len()?)
    }

    fn skip_to_eof(&mut self) -> Result<u64> {
        if self.mode == Mode::Read {
            self.logical = self.cleartext_len()?;
        }
        Ok(self.position()?)
    }

    fn skippable(&self, _direction: SkipDirection, _amount: u64) -> bool {
        match self.algorithm {
            Algorithm::Scrambling => self.mode == Mode::Read,
            Algorithm::Block => {
                self.mode == Mode::Read && self.logical % self.block_size as u64 == 0
            }
        }
    }

    fn position(&mut self) -> Result<u64> {
        Ok(self.logical)
    }

    fn sync_write(&mut self) -> Result<()> {
        self.below.sync_write()
    }

    fn flush_read(&mut self) -> Result<()> {
        self.cache.clear();
        self.cache_block = None;
        self.below.flush_read()
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Err(Error::bug());
        }
        self.terminated = true;
        if self.mode == Mode::Write && !self.suspended {
            self.flush_partial()?;
        }
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

    fn key() -> SecuString {
        let params = KdfParams {
            hash: KdfHash::Sha512,
            iterations: 1000,
            salt: b"0123456789abcdef".to_vec(),
        };
        params.derive(&SecuString::from_str("Pa$$w0rd")).unwrap()
    }

    fn encrypt(data: &[u8], block_size: usize) -> Vec<u8> {
        let below = Box::new(MemoryLayer::new(Mode::ReadWrite));
        let mut cipher = Cipher::create(below, CipherAlgo::Aes256, key(), block_size).unwrap();
        cipher.write_all(data).unwrap();
        cipher.terminate().unwrap();
        let mut below = cipher.take_below().unwrap();
        let end = below.position().unwrap();
        below.skip(0).unwrap();
        let mut out = vec![0u8; end as usize];
        below.read_exact(&mut out).unwrap();
        out
    }

    #[test]
    fn round_trip_across_blocks() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let raw = encrypt(&data, 64);

        let below = Box::new(MemoryLayer::from_vec(raw.clone()));
        let mut cipher = Cipher::open(
            below,
            CipherAlgo::Aes256,
            key(),
            64,
            0,
            raw.len() as u64,
        )
        .unwrap();
        assert_eq!(cipher.cleartext_len().unwrap(), data.len() as u64);
        let mut back = vec![0u8; data.len()];
        cipher.read_exact(&mut back).unwrap();
        assert_eq!(back, data);

        // random access
        cipher.skip(700).unwrap();
        let mut probe = [0u8; 1];
        cipher.read_exact(&mut probe).unwrap();
        assert_eq!(probe[0], data[700]);
    }

    #[test]
    fn ciphertext_hides_cleartext() {
        let raw = encrypt(b"secretsecretsecret", 1024);
        let needle = b"secret";
        assert!(
            !raw.windows(needle.len()).any(|w| w == needle),
            "cleartext visible in ciphertext"
        );
    }

    #[test]
    fn wrong_passphrase_fails_authentication() {
        let raw = encrypt(b"payload", 1024);
        let params = KdfParams {
            hash: KdfHash::Sha512,
            iterations: 1000,
            salt: b"0123456789abcdef".to_vec(),
        };
        let bad = params.derive(&SecuString::from_str("wrong")).unwrap();
        let below = Box::new(MemoryLayer::from_vec(raw.clone()));
        let mut cipher =
            Cipher::open(below, CipherAlgo::Aes256, bad, 1024, 0, raw.len() as u64).unwrap();
        let mut buf = [0u8; 7];
        assert!(matches!(cipher.read_exact(&mut buf), Err(Error::Data(_))));
    }

    #[test]
    fn corrupted_block_detected() {
        let mut raw = encrypt(b"some block payload", 1024);
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        let len = raw.len() as u64;
        let below = Box::new(MemoryLayer::from_vec(raw));
        let mut cipher = Cipher::open(below, CipherAlgo::Aes256, key(), 1024, 0, len).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(cipher.read_exact(&mut buf), Err(Error::Data(_))));
    }

    #[test]
    fn scrambling_reads_back() {
        // scrambling archives can only come from old writers; emulate one
        let pass = b"key";
        let data = b"legacy content";
        let scrambled: Vec<u8> = data
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ pass[i % pass.len()])
            .collect();
        let len = scrambled.len() as u64;
        let below = Box::new(MemoryLayer::from_vec(scrambled));
        let mut cipher = Cipher::open(
            below,
            CipherAlgo::Scrambling,
            SecuString::new(pass.to_vec()),
            DEFAULT_BLOCK_SIZE,
            0,
            len,
        )
        .unwrap();
        let mut back = vec![0u8; data.len()];
        cipher.read_exact(&mut back).unwrap();
        assert_eq!(&back, data);

        // and can never be written
        let below = Box::new(MemoryLayer::new(Mode::ReadWrite));
        assert!(Cipher::create(
            below,
            CipherAlgo::Scrambling,
            SecuString::new(pass.to_vec()),
            DEFAULT_BLOCK_SIZE,
        )
        .is_err());
    }
}
