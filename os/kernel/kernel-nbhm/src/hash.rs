//! Key hashing.

/// Hashes a map key to 32 bits.
pub trait KeyHasher {
    fn hash(&self, key: u64) -> u32;
}

/// `MurmurHash3_x86_32` over the eight little-endian bytes of the key.
///
/// Suited to addresses: the low twelve bits of page-aligned keys are all
/// zero and still spread over the whole table.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddressHasher {
    pub seed: u32,
}

impl AddressHasher {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    #[inline]
    const fn mix(h: u32, block: u32) -> u32 {
        let k = block
            .wrapping_mul(Self::C1)
            .rotate_left(15)
            .wrapping_mul(Self::C2);
        (h ^ k).rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64)
    }

    #[inline]
    const fn fmix(mut h: u32) -> u32 {
        h ^= h >> 16;
        h = h.wrapping_mul(0x85eb_ca6b);
        h ^= h >> 13;
        h = h.wrapping_mul(0xc2b2_ae35);
        h ^ (h >> 16)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn murmur3(&self, key: u64) -> u32 {
        let h = Self::mix(self.seed, key as u32);
        let h = Self::mix(h, (key >> 32) as u32);
        Self::fmix(h ^ 8)
    }
}

impl KeyHasher for AddressHasher {
    #[inline]
    fn hash(&self, key: u64) -> u32 {
        self.murmur3(key)
    }
}

impl<F: Fn(u64) -> u32> KeyHasher for F {
    #[inline]
    fn hash(&self, key: u64) -> u32 {
        self(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_vectors() {
        // MurmurHash3_x86_32 of eight zero bytes, seed 0
        let h = AddressHasher::default();
        assert_eq!(h.hash(0), 0x6385_2afc);
        assert_ne!(h.hash(1), h.hash(2));
        assert_ne!(h.hash(0x1000), h.hash(0x2000));
    }

    #[test]
    fn page_aligned_keys_spread() {
        let h = AddressHasher::default();
        let buckets: std::collections::HashSet<_> =
            (0..64u64).map(|i| h.hash(i << 12) & 63).collect();
        assert!(buckets.len() > 32);
    }
}
