//! The content-addressing hash type used throughout the core.
//!
//! This is a newtype over the bare `[u8; 20]` SHA-1-class digest so that it
//! can carry `Display`, `Ord`, and a hex `FromStr` impl -- comparisons and
//! orderings on hashes are pervasive here (peer ids, chunk ids, tie-breaks
//! in peer selection) in a way that justifies the newtype over a bare type
//! alias.

use std::fmt;
use std::str::FromStr;

/// The fixed width, in bytes, of a [`Hash`].
pub const HASH_LEN: usize = 20;

/// An opaque, total-orderable, 20-byte content/peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// Wraps a raw 20 byte digest.
    pub fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Returns the hash as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Error returned when parsing a [`Hash`] from a hex string fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashParseError;

impl fmt::Display for HashParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid hash hex string")
    }
}

impl std::error::Error for HashParseError {}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(s).map_err(|_| HashParseError)?;
        if decoded.len() != HASH_LEN {
            return Err(HashParseError);
        }
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl From<[u8; HASH_LEN]> for Hash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let hash = Hash::new([7; HASH_LEN]);
        let hex = hash.to_hex();
        let parsed: Hash = hex.parse().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_ordering_is_byte_lexicographic() {
        let a = Hash::new([1; HASH_LEN]);
        let b = Hash::new([2; HASH_LEN]);
        assert!(a < b);
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert!("not-hex".parse::<Hash>().is_err());
        assert!("aabb".parse::<Hash>().is_err()); // too short
    }
}
