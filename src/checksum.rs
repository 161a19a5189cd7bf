//! Chunk checksums
//!
//! A chunk digest is the low 16 bits of CRC-32 over the chunk's encoded
//! payload (upper-case base32 ASCII), truncated to the bits that fit in
//! `length` base32 characters and rendered most-significant first,
//! zero-padded. The default 3-character digest keeps 15 bits.
//!
//! Both sides checksum the *encoded* substring so the server can verify a
//! chunk without decoding it; a lone chunk is usually not decodable on its
//! own anyway.

use serde::{Deserialize, Serialize};

use crate::codec::ALPHABET;

/// Default digest length in characters
pub const DEFAULT_LENGTH: usize = 3;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// CRC-32 folded to 16 bits
    #[default]
    Crc16,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Crc16 => "crc16",
        }
    }
}

/// 16-bit CRC of `payload`, case-normalised
pub fn crc16(payload: &str) -> u16 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload.to_ascii_uppercase().as_bytes());
    (hasher.finalize() & 0xFFFF) as u16
}

/// Compute the `length`-character base32 digest of `payload`
pub fn checksum(payload: &str, length: usize) -> String {
    let bits = (length * 5).min(16);
    let mask = if bits >= 16 { 0xFFFF } else { (1u32 << bits) - 1 };
    let value = crc16(payload) as u32 & mask;

    let alphabet = ALPHABET.as_bytes();
    (0..length)
        .rev()
        .map(|i| {
            let shift = i * 5;
            let idx = if shift >= 32 { 0 } else { (value >> shift) & 0x1F };
            alphabet[idx as usize] as char
        })
        .collect()
}

/// Recompute and compare (case-insensitive)
pub fn verify(payload: &str, digest: &str) -> bool {
    !digest.is_empty() && checksum(payload, digest.len()).eq_ignore_ascii_case(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_fixed_width() {
        for payload in ["", "A", "NBSWY3DPEB3W64TMMQ", &"Z".repeat(50)] {
            let digest = checksum(payload, DEFAULT_LENGTH);
            assert_eq!(digest.len(), 3);
            assert!(crate::codec::is_base32(&digest));
        }
    }

    #[test]
    fn test_digest_is_deterministic() {
        let a = checksum("NBSWY3DPEB3W64TMMQ", 3);
        let b = checksum("NBSWY3DPEB3W64TMMQ", 3);
        assert_eq!(a, b);
    }

    #[test]
    fn test_digest_keeps_fifteen_bits() {
        let payload = "NBSWY3DPEB3W64TMMQ";
        let value = crc16(payload) & 0x7FFF;
        let digest = checksum(payload, 3);
        let decoded = digest.bytes().fold(0u16, |acc, c| {
            let idx = ALPHABET.bytes().position(|a| a == c).unwrap() as u16;
            (acc << 5) | idx
        });
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_algorithm_name_matches_config_spelling() {
        assert_eq!(ChecksumAlgorithm::Crc16.as_str(), "crc16");
        let parsed: ChecksumAlgorithm = serde_json::from_str("\"crc16\"").unwrap();
        assert_eq!(parsed, ChecksumAlgorithm::default());
    }

    #[test]
    fn test_verify() {
        let payload = "NBSWY3DPEB3W64TMMQ";
        let digest = checksum(payload, 3);
        assert!(verify(payload, &digest));
        assert!(verify(&payload.to_lowercase(), &digest.to_lowercase()));
        let first = if digest.starts_with('A') { "B" } else { "A" };
        let wrong = format!("{}{}", first, &digest[1..]);
        assert!(!verify(payload, &wrong));
        assert!(!verify(payload, ""));
    }

    #[test]
    fn test_longer_digests_cover_sixteen_bits() {
        let payload = "MZXW6YTBOI";
        let digest = checksum(payload, 4);
        assert_eq!(digest.len(), 4);
        let decoded = digest.bytes().fold(0u32, |acc, c| {
            let idx = ALPHABET.bytes().position(|a| a == c).unwrap() as u32;
            (acc << 5) | idx
        });
        assert_eq!(decoded, crc16(payload) as u32);
    }
}
