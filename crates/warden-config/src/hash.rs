//! Content hashes for policies

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha224};
use std::fmt;
use std::time::Duration;

/// Number of bytes in a policy hash
pub const HASH_LEN: usize = 28;

/// A 224-bit content hash identifying a policy
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PolicyHash([u8; HASH_LEN]);

impl PolicyHash {
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Display for PolicyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for PolicyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PolicyHash({})", self)
    }
}

/// Feeds length-prefixed fields into a SHA-224 digest.
///
/// Integers are written as 8-byte little-endian values and strings are
/// prefixed with their byte length, so adjacent fields cannot run together.
pub(crate) struct HashWriter {
    digest: Sha224,
}

impl HashWriter {
    pub fn new() -> Self {
        Self {
            digest: Sha224::new(),
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.digest.update(v.to_le_bytes());
    }

    pub fn write_len(&mut self, len: usize) {
        self.write_u64(len as u64);
    }

    pub fn write_duration(&mut self, d: Duration) {
        self.write_u64(d.as_nanos().min(u64::MAX as u128) as u64);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_len(s.len());
        self.digest.update(s.as_bytes());
    }

    pub fn finish(self) -> PolicyHash {
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&self.digest.finalize());
        PolicyHash(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefix_separates_fields() {
        let mut a = HashWriter::new();
        a.write_str("ab");
        a.write_str("c");
        let mut b = HashWriter::new();
        b.write_str("a");
        b.write_str("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn displays_as_unpadded_url_safe_base64() {
        let h = HashWriter::new().finish();
        let s = h.to_string();
        // 28 bytes encode to 38 characters without padding
        assert_eq!(s.len(), 38);
        assert!(!s.contains('='));
        assert!(!s.contains('+') && !s.contains('/'));
    }
}
