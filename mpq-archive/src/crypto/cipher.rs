//! The 32-bit word stream cipher
//!
//! Fixed tables (hash table, block table, sector-offset tables) and file
//! sectors are transformed word by word under an evolving `(key, seed)` pair.
//! The word-level functions operate on native `u32` buffers; the byte-slice
//! wrappers convert through little-endian and leave any trailing 1-3 bytes
//! untransformed, matching the on-disk behavior for lengths that are not a
//! multiple of four.

use super::table::CRYPT_TABLE;

/// Encrypt a block of 32-bit words in place
pub fn encrypt_block(data: &mut [u32], mut key: u32) {
    let mut seed: u32 = 0xEEEE_EEEE;

    for value in data.iter_mut() {
        seed = seed.wrapping_add(CRYPT_TABLE[0x400 + (key & 0xFF) as usize]);

        let plain = *value;
        *value = plain ^ key.wrapping_add(seed);

        key = (!key << 0x15).wrapping_add(0x1111_1111) | (key >> 0x0B);
        seed = plain
            .wrapping_add(seed)
            .wrapping_add(seed << 5)
            .wrapping_add(3);
    }
}

/// Decrypt a block of 32-bit words in place
pub fn decrypt_block(data: &mut [u32], mut key: u32) {
    let mut seed: u32 = 0xEEEE_EEEE;

    for value in data.iter_mut() {
        seed = seed.wrapping_add(CRYPT_TABLE[0x400 + (key & 0xFF) as usize]);

        let plain = *value ^ key.wrapping_add(seed);
        *value = plain;

        key = (!key << 0x15).wrapping_add(0x1111_1111) | (key >> 0x0B);
        seed = plain
            .wrapping_add(seed)
            .wrapping_add(seed << 5)
            .wrapping_add(3);
    }
}

/// Decrypt only the leading word of a block
///
/// Cheaper than [`decrypt_block`] when a caller needs to probe the first
/// word of a sector-offset table under a candidate key.
pub fn decrypt_u32(value: u32, key: u32) -> u32 {
    let seed = 0xEEEE_EEEEu32.wrapping_add(CRYPT_TABLE[0x400 + (key & 0xFF) as usize]);
    value ^ key.wrapping_add(seed)
}

/// Encrypt a little-endian byte buffer in place
///
/// Only the 4-byte-aligned prefix is transformed; trailing bytes pass
/// through unchanged.
pub fn encrypt_bytes(data: &mut [u8], key: u32) {
    let word_bytes = (data.len() / 4) * 4;
    let (head, _tail) = data.split_at_mut(word_bytes);

    let mut words: Vec<u32> = head
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    encrypt_block(&mut words, key);
    for (chunk, word) in head.chunks_exact_mut(4).zip(&words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}

/// Decrypt a little-endian byte buffer in place
///
/// Only the 4-byte-aligned prefix is transformed; trailing bytes pass
/// through unchanged.
pub fn decrypt_bytes(data: &mut [u8], key: u32) {
    let word_bytes = (data.len() / 4) * 4;
    let (head, _tail) = data.split_at_mut(word_bytes);

    let mut words: Vec<u32> = head
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    decrypt_block(&mut words, key);
    for (chunk, word) in head.chunks_exact_mut(4).zip(&words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let original = vec![
            0x12345678u32,
            0x9ABCDEF0,
            0x13579BDF,
            0x2468ACE0,
            0xFEDCBA98,
            0x76543210,
        ];
        let key = 0xC1EB1CEF;

        let mut data = original.clone();
        encrypt_block(&mut data, key);
        assert_ne!(data, original);

        decrypt_block(&mut data, key);
        assert_eq!(data, original);
    }

    #[test]
    fn test_decrypt_u32_matches_block_decrypt() {
        let key = 0xDEADBEEF;
        let mut block = [0x0000_1234u32];
        encrypt_block(&mut block, key);
        assert_eq!(decrypt_u32(block[0], key), 0x0000_1234);
    }

    #[test]
    fn test_trailing_bytes_pass_through() {
        let mut data = vec![1u8, 2, 3, 4, 5, 6, 7];
        let key = 0x0BADF00D;

        encrypt_bytes(&mut data, key);
        // The trailing 3 bytes are untouched
        assert_eq!(&data[4..], &[5, 6, 7]);

        decrypt_bytes(&mut data, key);
        assert_eq!(data, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_different_keys_differ() {
        let original = vec![0x12345678u32, 0x9ABCDEF0];
        let mut a = original.clone();
        let mut b = original.clone();

        encrypt_block(&mut a, 0x11111111);
        encrypt_block(&mut b, 0x22222222);
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn prop_byte_round_trip(data in proptest::collection::vec(any::<u8>(), 0..512), key in any::<u32>()) {
            let mut buf = data.clone();
            encrypt_bytes(&mut buf, key);
            decrypt_bytes(&mut buf, key);
            prop_assert_eq!(buf, data);
        }

        #[test]
        fn prop_word_round_trip(data in proptest::collection::vec(any::<u32>(), 0..128), key in any::<u32>()) {
            let mut buf = data.clone();
            encrypt_block(&mut buf, key);
            decrypt_block(&mut buf, key);
            prop_assert_eq!(buf, data);
        }
    }
}
