use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::error::TypeError;

/// Length of a raw digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Length of the text form of a digest (two characters per byte).
pub const DIGEST_HEX_LEN: usize = DIGEST_LEN * 2;

/// First character of the nibble alphabet. Nibble `n` encodes as `b'A' + n`.
const ALPHABET_BASE: u8 = b'A';

/// SHA-256 digest identifying a block's content.
///
/// Two blocks with equal digests are treated as equal content. The text form
/// uses the nibble alphabet `A..=P` (0 -> `A`, 15 -> `P`) rather than
/// conventional hex, and is what every index key is written as.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Hash a block's exact bytes. Short blocks are hashed over their real
    /// length, never padded.
    pub fn of(block: &[u8]) -> Self {
        Self(Sha256::digest(block).into())
    }

    /// Wrap a pre-computed hash.
    pub const fn from_raw(raw: [u8; DIGEST_LEN]) -> Self {
        Self(raw)
    }

    /// Parse a raw digest record (e.g. from a manifest).
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        let raw: [u8; DIGEST_LEN] = bytes.try_into().map_err(|_| TypeError::InvalidLength {
            expected: DIGEST_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(raw))
    }

    /// The raw 32-byte hash.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Fixed-width `A..=P` text form.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(DIGEST_HEX_LEN);
        for byte in self.0 {
            out.push(char::from(ALPHABET_BASE + (byte >> 4)));
            out.push(char::from(ALPHABET_BASE + (byte & 0x0f)));
        }
        out
    }

    /// Short text form (first 8 characters), for log lines.
    pub fn short_hex(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(8);
        hex
    }

    /// Parse the `A..=P` text form.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        if s.len() != DIGEST_HEX_LEN {
            return Err(TypeError::InvalidLength {
                expected: DIGEST_HEX_LEN,
                actual: s.len(),
            });
        }
        let mut raw = [0u8; DIGEST_LEN];
        let bytes = s.as_bytes();
        for (i, slot) in raw.iter_mut().enumerate() {
            let hi = decode_nibble(bytes[2 * i], 2 * i)?;
            let lo = decode_nibble(bytes[2 * i + 1], 2 * i + 1)?;
            *slot = (hi << 4) | lo;
        }
        Ok(Self(raw))
    }
}

fn decode_nibble(ch: u8, position: usize) -> Result<u8, TypeError> {
    match ch {
        b'A'..=b'P' => Ok(ch - ALPHABET_BASE),
        _ => Err(TypeError::InvalidHex {
            ch: char::from(ch),
            position,
        }),
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::str::FromStr for Digest {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(raw: [u8; DIGEST_LEN]) -> Self {
        Self(raw)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
