//! Payload masking, RFC 6455 Section 5.3.
//!
//! Masking XORs every payload byte `i` with `key[i % 4]`, so applying the same
//! key twice restores the original payload.

/// Mask or unmask `buf` in place.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    // Eight bytes at a time: the key repeats every four bytes, so a doubled key
    // lines up with every 8-byte chunk.
    let wide = u64::from_ne_bytes([
        key[0], key[1], key[2], key[3], key[0], key[1], key[2], key[3],
    ]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ wide;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    apply_mask_fallback(chunks.into_remainder(), key);
}

/// Byte-at-a-time masking, used for the tail that does not fill a word.
#[inline]
fn apply_mask_fallback(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_fallback() {
        let keys = [
            [0x00, 0x00, 0x00, 0x00],
            [0xFF, 0xFF, 0xFF, 0xFF],
            [0x6d, 0xb6, 0xb2, 0x80],
            [0x01, 0x23, 0x45, 0x67],
        ];

        for key in keys {
            for size in 0..=40 {
                let data: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();

                let mut expected = data.clone();
                apply_mask_fallback(&mut expected, key);

                let mut actual = data.clone();
                apply_mask(&mut actual, key);

                assert_eq!(expected, actual, "key {key:?} size {size}");
            }
        }
    }

    #[test]
    fn test_mask_is_involutive() {
        let key = [0xAA, 0xBB, 0xCC, 0xDD];
        let original = b"Hello, World! This is a test message with various lengths.";

        let mut data = original.to_vec();
        apply_mask(&mut data, key);
        assert_ne!(&data[..], &original[..]);

        apply_mask(&mut data, key);
        assert_eq!(&data[..], &original[..]);
    }

    #[test]
    fn test_mask_involutive_for_many_keys_and_offsets() {
        let buffer: Vec<u8> = (0..=255).collect();
        for seed in 0u8..16 {
            let key = [seed, seed.wrapping_mul(31), seed ^ 0x5A, !seed];
            for offset in 0..8 {
                let mut data = buffer[offset..].to_vec();
                apply_mask(&mut data, key);
                for (i, byte) in data.iter().enumerate() {
                    assert_eq!(*byte, buffer[offset + i] ^ key[i % 4]);
                }
                apply_mask(&mut data, key);
                assert_eq!(&data[..], &buffer[offset..]);
            }
        }
    }

    #[test]
    fn test_mask_short_buffers() {
        let key = [0x12, 0x34, 0x56, 0x78];

        let mut empty: Vec<u8> = vec![];
        apply_mask(&mut empty, key);
        assert!(empty.is_empty());

        let mut three = vec![0xAB, 0xCD, 0xEF];
        apply_mask(&mut three, key);
        assert_eq!(three, vec![0xAB ^ 0x12, 0xCD ^ 0x34, 0xEF ^ 0x56]);
    }
}
