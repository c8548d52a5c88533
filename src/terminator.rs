//! End-of-archive terminator.
//!
//! The very last bytes of the logical stream are a fixed-size record: the
//! absolute position of the archive trailer followed by a magic sequence.
//! Readers find the trailer by seeking sixteen bytes before the end; when
//! the terminator is damaged, lax mode falls back to a sequential scan
//! through the tape marks.

use crate::error::{Error, Result};
use crate::layer::Layer;

const TERMINATOR_MAGIC: &[u8; 8] = b"CofArEnd";
/// Total terminator size: trailer position + magic.
pub const TERMINATOR_LEN: u64 = 8 + 8;

/// Writes the terminator. Must be the final write of the stream.
pub fn write_terminator(f: &mut dyn Layer, trailer_pos: u64) -> Result<()> {
    f.write_all(&trailer_pos.to_be_bytes())?;
    f.write_all(TERMINATOR_MAGIC)
}

/// Locates the trailer by reading the terminator at end of stream.
pub fn locate_trailer(f: &mut dyn Layer) -> Result<u64> {
    let end = f.skip_to_eof()?;
    if end < TERMINATOR_LEN {
        return Err(Error::Data("stream too short to hold a terminator".into()));
    }
    f.skip(end - TERMINATOR_LEN)?;
    let mut record = [0u8; TERMINATOR_LEN as usize];
    f.read_exact(&mut record)?;
    if &record[8..] != TERMINATOR_MAGIC {
        return Err(Error::Data("archive terminator not found".into()));
    }
    let trailer_pos = u64::from_be_bytes(record[..8].try_into().unwrap());
    if trailer_pos >= end - TERMINATOR_LEN {
        return Err(Error::Data("archive terminator points past itself".into()));
    }
    Ok(trailer_pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{MemoryLayer, Mode};

    #[test]
    fn locate_written_terminator() {
        let mut m = MemoryLayer::new(Mode::ReadWrite);
        m.write_all(b"body bytes").unwrap();
        let trailer_pos = m.position().unwrap();
        m.write_all(b"trailer").unwrap();
        write_terminator(&mut m, trailer_pos).unwrap();
        assert_eq!(locate_trailer(&mut m).unwrap(), trailer_pos);
    }

    #[test]
    fn missing_terminator_is_a_data_error() {
        let mut m = MemoryLayer::from_vec(b"no terminator here at all".to_vec());
        assert!(matches!(locate_trailer(&mut m), Err(Error::Data(_))));
        let mut short = MemoryLayer::from_vec(b"x".to_vec());
        assert!(matches!(locate_trailer(&mut short), Err(Error::Data(_))));
    }
}
