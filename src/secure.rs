//! Secret byte storage wiped on drop.

use std::fmt;
use std::ptr;

/// A passphrase or derived key held in memory that is zeroed before release.
///
/// The wipe uses volatile writes so it cannot be elided. The container never
/// reallocates: it is built in one piece from its source.
pub struct SecuString {
    bytes: Vec<u8>,
}

impl SecuString {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn from_str(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Clone for SecuString {
    fn clone(&self) -> Self {
        Self::new(self.bytes.clone())
    }
}

impl Drop for SecuString {
    fn drop(&mut self) {
        for b in self.bytes.iter_mut() {
            unsafe {
                ptr::write_volatile(b, 0);
            }
        }
    }
}

impl fmt::Debug for SecuString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecuString({} bytes)", self.bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_bytes() {
        let s = SecuString::from_str("Pa$$w0rd");
        assert_eq!(s.as_bytes(), b"Pa$$w0rd");
        assert_eq!(s.len(), 8);
        assert!(!s.is_empty());
    }

    #[test]
    fn debug_does_not_leak() {
        let s = SecuString::from_str("secret");
        assert!(!format!("{s:?}").contains("secret"));
    }
}
