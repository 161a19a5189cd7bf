//! Unpadded base32 codec for DNS labels
//!
//! Payload bytes travel as RFC 4648 base32 with the `=` padding stripped, so
//! every character is a valid (case-insensitive) DNS label character.
//! Decoding re-pads internally and distinguishes "this prefix cannot be a
//! complete encoding yet" from "these characters are not base32".

use data_encoding::{BASE32, BASE32_NOPAD};
use rand::RngCore;

/// RFC 4648 base32 alphabet (upper case)
pub const ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Lengths (mod 8) reachable by stripping padding from valid base32
const DECODABLE_RESIDUES: [usize; 5] = [0, 2, 4, 5, 7];

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Length cannot be produced by unpadded base32; more input is needed
    #[error("incomplete base32 input: length {0} is not decodable")]
    Incomplete(usize),

    /// Input is the right length but not valid base32
    #[error("corrupt base32 input at position {position}")]
    Corrupt { position: usize },
}

impl DecodeError {
    /// True when the failure only means more characters are needed
    pub fn is_incomplete(&self) -> bool {
        matches!(self, DecodeError::Incomplete(_))
    }
}

/// Encode bytes as unpadded upper-case base32
pub fn encode(data: &[u8]) -> String {
    BASE32_NOPAD.encode(data)
}

/// Decode unpadded base32 (case-insensitive)
pub fn decode(encoded: &str) -> Result<Vec<u8>, DecodeError> {
    if !is_decodable_len(encoded.len()) {
        return Err(DecodeError::Incomplete(encoded.len()));
    }

    let mut padded = encoded.to_ascii_uppercase();
    let padding = (8 - padded.len() % 8) % 8;
    padded.extend(std::iter::repeat('=').take(padding));

    BASE32
        .decode(padded.as_bytes())
        .map_err(|e| DecodeError::Corrupt {
            position: e.position,
        })
}

/// Whether an unpadded base32 string of this length can be decoded
pub fn is_decodable_len(len: usize) -> bool {
    DECODABLE_RESIDUES.contains(&(len % 8))
}

/// Number of unpadded base32 characters produced for `bytes` input bytes
pub fn encoded_len(bytes: usize) -> usize {
    (bytes * 8 + 4) / 5
}

/// True if every character belongs to the base32 alphabet (either case)
pub fn is_base32(s: &str) -> bool {
    s.bytes()
        .all(|b| matches!(b.to_ascii_uppercase(), b'A'..=b'Z' | b'2'..=b'7'))
}

/// Generate a random session id of `length` base32 characters
///
/// Six characters carry 30 bits of entropy; ids are probabilistically
/// unique, not guaranteed.
pub fn generate_session_id(length: usize) -> String {
    let mut bytes = vec![0u8; (length * 5 + 7) / 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut id = encode(&bytes);
    id.truncate(length);
    id
}
