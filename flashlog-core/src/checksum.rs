//! Fletcher-64 checksum
//!
//! Two 32-bit running sums over little-endian 32-bit words. A trailing
//! partial word is zero-padded. Used for records and for the house-keeping
//! header.

/// Compute the Fletcher-64 checksum of `data`
///
/// Iterates `ceil(len / 4)` words:
/// `sum0 = sum0 + word`, `sum1 = sum1 + sum0`, both modulo 2^32.
/// The result is `(sum1 << 32) | sum0`.
pub fn fletcher64(data: &[u8]) -> u64 {
    let mut sum0: u32 = 0;
    let mut sum1: u32 = 0;

    for chunk in data.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        sum0 = sum0.wrapping_add(u32::from_le_bytes(word));
        sum1 = sum1.wrapping_add(sum0);
    }

    ((sum1 as u64) << 32) | sum0 as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty() {
        assert_eq!(fletcher64(&[]), 0);
    }

    #[test]
    fn test_two_words() {
        let data = [1, 0, 0, 0, 2, 0, 0, 0];
        // sum0: 1, 3  sum1: 1, 4
        assert_eq!(fletcher64(&data), 0x0000_0004_0000_0003);
    }

    #[test]
    fn test_partial_word_zero_padded() {
        assert_eq!(fletcher64(&[1, 2, 3]), fletcher64(&[1, 2, 3, 0]));
        assert_eq!(fletcher64(&[1, 2, 3]), 0x0003_0201_0003_0201);
    }

    #[test]
    fn test_sums_wrap() {
        let data = [0xFF; 8];
        // sum0: 0xFFFFFFFF, 0xFFFFFFFE  sum1: 0xFFFFFFFF, 0xFFFFFFFD
        assert_eq!(fletcher64(&data), 0xFFFF_FFFD_FFFF_FFFE);
    }

    #[test]
    fn test_order_sensitive() {
        assert_ne!(
            fletcher64(&[1, 0, 0, 0, 2, 0, 0, 0]),
            fletcher64(&[2, 0, 0, 0, 1, 0, 0, 0])
        );
    }

    proptest! {
        #[test]
        fn prop_single_bit_flip_changes_checksum(
            data in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<proptest::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut flipped = data.clone();
            let i = index.index(flipped.len());
            flipped[i] ^= 1 << bit;
            prop_assert_ne!(fletcher64(&data), fletcher64(&flipped));
        }
    }
}
