// src/id.rs

//! Time-ordered lexicographic identifiers.
//!
//! An [`Id`] concatenates a 48-bit millisecond timestamp with 80 random
//! bits, then encodes the 128 bits as 26 Crockford base-32 characters. IDs
//! sort lexicographically by creation time, which is what lets `hashes.id`
//! double as both a primary key and an insertion-order index.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// A 26-character ULID-style identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id {
    timestamp_ms: u64,
    randomness: [u8; 10],
}

impl Id {
    /// Build an id stamped with the current wall-clock time.
    pub fn now() -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as u64;
        Self::at(timestamp_ms)
    }

    /// Build an id stamped with an explicit millisecond timestamp, used when
    /// a file's mtime should drive the hash id's time component.
    pub fn at(timestamp_ms: u64) -> Self {
        assert!(
            timestamp_ms <= 0xFFFF_FFFF_FFFF,
            "timestamp {timestamp_ms} does not fit in 48 bits"
        );
        let mut randomness = [0u8; 10];
        rand::thread_rng().fill_bytes(&mut randomness);
        Id {
            timestamp_ms,
            randomness,
        }
    }

    /// Parse a previously-encoded 26-character id back into its parts.
    pub fn parse(text: &str) -> Option<Self> {
        if text.len() != 26 {
            return None;
        }
        let chars: Vec<u8> = text.bytes().collect();
        let mut value: u128 = 0;
        for c in chars {
            let digit = crockford_decode(c)? as u128;
            value = (value << 5) | digit;
        }
        let timestamp_ms = (value >> 80) as u64 & 0xFFFF_FFFF_FFFF;
        let mut randomness = [0u8; 10];
        let rand_bits = value & ((1u128 << 80) - 1);
        for (i, byte) in randomness.iter_mut().enumerate() {
            let shift = 72 - i * 8;
            *byte = (rand_bits >> shift) as u8;
        }
        Some(Id {
            timestamp_ms,
            randomness,
        })
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Render as the 26-character Crockford base-32 string stored in the
    /// `hashes.id` column.
    pub fn encode(&self) -> String {
        let mut value: u128 = (self.timestamp_ms as u128) << 80;
        for (i, byte) in self.randomness.iter().enumerate() {
            value |= (*byte as u128) << (72 - i * 8);
        }
        let mut out = [0u8; 26];
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = 125 - i * 5;
            let digit = ((value >> shift) & 0x1F) as usize;
            *slot = CROCKFORD_ALPHABET[digit];
        }
        // SAFETY: every byte written above is drawn from CROCKFORD_ALPHABET, all ASCII.
        String::from_utf8(out.to_vec()).expect("crockford alphabet is ascii")
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

fn crockford_decode(c: u8) -> Option<u8> {
    let c = c.to_ascii_uppercase();
    CROCKFORD_ALPHABET.iter().position(|&a| a == c).map(|p| p as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_to_26_chars() {
        let id = Id::now();
        assert_eq!(id.encode().len(), 26);
    }

    #[test]
    fn is_lexicographically_sortable_by_time() {
        let earlier = Id::at(1_000_000);
        let later = Id::at(2_000_000);
        assert!(earlier.encode() < later.encode());
    }

    #[test]
    fn roundtrips_through_parse() {
        let id = Id::at(123_456_789);
        let encoded = id.encode();
        let parsed = Id::parse(&encoded).expect("should parse");
        assert_eq!(parsed.timestamp_ms(), id.timestamp_ms());
        assert_eq!(parsed.encode(), encoded);
    }

    #[test]
    #[should_panic]
    fn rejects_timestamps_above_48_bits() {
        Id::at(1u64 << 48);
    }
}
