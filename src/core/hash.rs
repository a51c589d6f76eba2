//! Canonical State Hashing
//!
//! Desync detection across peers depends on every implementation hashing
//! byte-identical input. The canonical form is a sequence of decimal
//! integer fields joined by a single `|` separator (a byte that cannot
//! appear in decimal text), digested with MD5 and rendered as lowercase
//! hex.
//!
//! Only deterministic simulation state may enter a digest. Wall-clock
//! timestamps, transport state and render-only data must stay out.

use md5::{Digest, Md5};
use sha2::Sha256;

/// Field separator in the canonical byte serialization.
pub const FIELD_SEPARATOR: char = '|';

/// Accumulates integer fields into the canonical byte form and digests
/// them. Field order is part of the contract; callers must feed fields in
/// a fixed, documented order.
#[derive(Debug, Default)]
pub struct CanonicalHasher {
    buf: String,
}

impl CanonicalHasher {
    /// Start an empty canonical serialization.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a signed field as decimal text.
    pub fn field_i32(&mut self, value: i32) {
        if !self.buf.is_empty() {
            self.buf.push(FIELD_SEPARATOR);
        }
        self.buf.push_str(&value.to_string());
    }

    /// Append an unsigned field as decimal text.
    pub fn field_u32(&mut self, value: u32) {
        if !self.buf.is_empty() {
            self.buf.push(FIELD_SEPARATOR);
        }
        self.buf.push_str(&value.to_string());
    }

    /// Canonical bytes accumulated so far.
    pub fn bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }

    /// MD5 over the canonical bytes, as lowercase hex.
    pub fn finalize(self) -> String {
        hex::encode(Md5::digest(self.buf.as_bytes()))
    }
}

/// MD5 hex digest of arbitrary bytes.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Derive the per-room PRNG seed from the room identifier.
///
/// Domain-separated SHA-256, truncated to the first four little-endian
/// bytes. Every peer of a room derives the same seed from the same id.
pub fn derive_room_seed(room_id: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(b"LOCKSTEP_ROOM_SEED_V1");
    hasher.update(room_id.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&digest[..4]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_form() {
        let mut hasher = CanonicalHasher::new();
        hasher.field_i32(1);
        hasher.field_i32(-65536);
        hasher.field_u32(300);
        assert_eq!(hasher.bytes(), b"1|-65536|300");
    }

    #[test]
    fn test_digest_stable() {
        let digest = |fields: &[i32]| {
            let mut h = CanonicalHasher::new();
            for &f in fields {
                h.field_i32(f);
            }
            h.finalize()
        };

        assert_eq!(digest(&[1, 2, 3]), digest(&[1, 2, 3]));
        assert_ne!(digest(&[1, 2, 3]), digest(&[1, 3, 2]));
    }

    #[test]
    fn test_digest_matches_md5_of_bytes() {
        let mut h = CanonicalHasher::new();
        h.field_i32(7);
        h.field_i32(-7);
        assert_eq!(h.finalize(), md5_hex(b"7|-7"));
    }

    #[test]
    fn test_separator_prevents_ambiguity() {
        // "1|23" and "12|3" must not collide.
        let mut a = CanonicalHasher::new();
        a.field_i32(1);
        a.field_i32(23);
        let mut b = CanonicalHasher::new();
        b.field_i32(12);
        b.field_i32(3);
        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_room_seed_deterministic() {
        let a = derive_room_seed("room_001");
        let b = derive_room_seed("room_001");
        let c = derive_room_seed("room_002");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
