//! Hash-tee layer.
//!
//! Wraps one slice file and feeds every byte written through it into an
//! incremental digest. On terminate, the digest is written to a sidecar file
//! `<slice-name>.<algo>` in the `digest  filename` format that standard
//! checking tools accept.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha512};

use crate::error::{Error, Result};
use crate::layer::{Layer, Mode, NoLayer, SkipDirection};

/// Sidecar digest algorithms.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha512,
}

impl HashAlgo {
    /// Extension of the sidecar file.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha512 => "sha512",
        }
    }
}

enum HashState {
    Md5(Md5),
    Sha1(Sha1),
    Sha512(Box<Sha512>),
}

impl HashState {
    fn new(algo: HashAlgo) -> Self {
        match algo {
            HashAlgo::Md5 => Self::Md5(Md5::new()),
            HashAlgo::Sha1 => Self::Sha1(Sha1::new()),
            HashAlgo::Sha512 => Self::Sha512(Box::new(Sha512::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn hex(self) -> String {
        fn to_hex(bytes: &[u8]) -> String {
            bytes.iter().map(|b| format!("{b:02x}")).collect()
        }
        match self {
            Self::Md5(h) => to_hex(&h.finalize()),
            Self::Sha1(h) => to_hex(&h.finalize()),
            Self::Sha512(h) => to_hex(&h.finalize()),
        }
    }
}

/// Write-only tee computing a digest of everything it passes down.
pub struct Hasher {
    below: Box<dyn Layer>,
    state: HashState,
    sidecar: Box<dyn Layer>,
    /// Name written next to the digest in the sidecar.
    file_name: String,
    terminated: bool,
}

impl Hasher {
    pub fn new(
        below: Box<dyn Layer>,
        algo: HashAlgo,
        sidecar: Box<dyn Layer>,
        file_name: String,
    ) -> Self {
        Self {
            below,
            state: HashState::new(algo),
            sidecar,
            file_name,
            terminated: false,
        }
    }
}

impl Layer for Hasher {
    fn mode(&self) -> Mode {
        Mode::Write
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::bug())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.terminated {
            return Err(Error::bug());
        }
        self.state.update(buf);
        self.below.write_all(buf)
    }

    fn skip(&mut self, _pos: u64) -> Result<bool> {
        // a seek would make the digest meaningless
        Err(Error::bug())
    }

    fn skip_to_eof(&mut self) -> Result<u64> {
        self.below.position()
    }

    fn skippable(&self, _direction: SkipDirection, _amount: u64) -> bool {
        false
    }

    fn position(&mut self) -> Result<u64> {
        self.below.position()
    }

    fn sync_write(&mut self) -> Result<()> {
        self.below.sync_write()
    }

    fn flush_read(&mut self) -> Result<()> {
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Err(Error::bug());
        }
        self.terminated = true;
        let state = std::mem::replace(&mut self.state, HashState::new(HashAlgo::Md5));
        let line = format!("{}  {}\n", state.hex(), self.file_name);
        self.sidecar.write_all(line.as_bytes())?;
        self.sidecar.terminate()?;
        self.below.terminate()
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
    use crate::entrepot::Entrepot;
    use crate::layer::MemoryLayer;

    #[test]
    fn sidecar_carries_known_digest() {
        let dir = std::env::temp_dir().join(format!("coffre-hash-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let ent = crate::entrepot::LocalEntrepot::new(&dir);
        let how = crate::entrepot::OpenHow {
            mode: Mode::Write,
            permission: 0o644,
            fail_if_exists: false,
            erase: true,
        };
        let sidecar = ent
            .open(std::path::Path::new("out.1.dar.sha512"), how)
            .unwrap();

        let below = Box::new(MemoryLayer::new(Mode::ReadWrite));
        let mut h = Hasher::new(below, HashAlgo::Sha512, sidecar, "out.1.dar".into());
        h.write_all(b"ab").unwrap();
        h.write_all(b"c").unwrap();
        h.terminate().unwrap();

        let line = std::fs::read_to_string(dir.join("out.1.dar.sha512")).unwrap();
        let expected = "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
                        2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f";
        assert_eq!(line, format!("{expected}  out.1.dar\n"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn refuses_seek_and_read() {
        let below = Box::new(MemoryLayer::new(Mode::ReadWrite));
        let sidecar = Box::new(MemoryLayer::new(Mode::ReadWrite));
        let mut h = Hasher::new(below, HashAlgo::Md5, sidecar, "x".into());
        assert!(h.skip(0).is_err());
        let mut buf = [0u8; 1];
        assert!(h.read(&mut buf).is_err());
        assert!(!h.skippable(SkipDirection::Forward, 1));
        h.terminate().unwrap();
    }
}
