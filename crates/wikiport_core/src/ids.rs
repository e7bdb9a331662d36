use std::fmt;

use rand::Rng;
use serde::{Serialize, Serializer};

pub const DEFAULT_ID_BITS: u32 = 94;

/// Opaque entity identifier, rendered as lowercase hex without `0x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(u128);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Draws ids uniformly from `[2^(bits-1), 2^bits - 1]`, so every id of one
/// generator has the same hex width. No registry is kept; uniqueness is
/// probabilistic.
#[derive(Debug, Clone, Copy)]
pub struct IdGenerator {
    min: u128,
    max: u128,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::with_bits(DEFAULT_ID_BITS)
    }
}

impl IdGenerator {
    /// `bits` is clamped to `1..=128`.
    pub fn with_bits(bits: u32) -> Self {
        let bits = bits.clamp(1, 128);
        let min = 1u128 << (bits - 1);
        let max = if bits == 128 {
            u128::MAX
        } else {
            (1u128 << bits) - 1
        };
        Self { min, max }
    }

    pub fn bits(&self) -> u32 {
        128 - self.max.leading_zeros()
    }

    pub fn new_id(&self) -> Id {
        Id(rand::rng().random_range(self.min..=self.max))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn default_ids_are_24_lowercase_hex_digits() {
        let generator = IdGenerator::default();
        assert_eq!(generator.bits(), 94);
        for _ in 0..64 {
            let rendered = generator.new_id().to_string();
            assert_eq!(rendered.len(), 24, "{rendered}");
            assert!(rendered.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
            assert!(!rendered.starts_with("0x"));
        }
    }

    #[test]
    fn ids_do_not_collide_in_practice() {
        let generator = IdGenerator::default();
        let ids: HashSet<Id> = (0..10_000).map(|_| generator.new_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn width_is_configurable() {
        let small = IdGenerator::with_bits(8);
        for _ in 0..32 {
            let id = small.new_id().0;
            assert!((128..=255).contains(&id));
        }
        assert_eq!(IdGenerator::with_bits(0).bits(), 1);
        assert_eq!(IdGenerator::with_bits(500).bits(), 128);
        assert_eq!(IdGenerator::with_bits(128).new_id().to_string().len(), 32);
    }

    #[test]
    fn id_serializes_as_hex_string() {
        let id = Id(0xabc);
        assert_eq!(serde_json::to_string(&id).expect("serialize"), "\"abc\"");
    }
}
