//! Path hashing
//!
//! The directory is driven by three 32-bit hashes over the uppercased,
//! backslash-normalized path, and a fourth hash type derives per-file
//! encryption keys. ASCII lowercase letters are uppercased byte-wise; all
//! other bytes (including values >= 0x80) pass through unchanged, which makes
//! the hash of non-ASCII paths dependent on their source encoding.

use super::table::CRYPT_TABLE;

/// Hash types selecting the table section used by [`hash_path`]
pub mod hash_type {
    /// Probe start index into the hash table
    pub const TABLE_OFFSET: u32 = 0;
    /// First path verification hash
    pub const NAME_A: u32 = 1;
    /// Second path verification hash
    pub const NAME_B: u32 = 2;
    /// File encryption key derivation
    pub const FILE_KEY: u32 = 3;
}

/// Hash a raw byte path
///
/// Forward slashes are folded to backslashes before hashing so that either
/// separator resolves to the same entry.
pub fn hash_path_bytes(path: &[u8], hash_type: u32) -> u32 {
    let mut seed1: u32 = 0x7FED_7FED;
    let mut seed2: u32 = 0xEEEE_EEEE;

    for &byte in path {
        let mut ch = byte;
        if ch == b'/' {
            ch = b'\\';
        }
        if (0x61..=0x7A).contains(&ch) {
            ch -= 0x20;
        }

        let table_index = ((hash_type << 8) + ch as u32) as usize;
        seed1 = CRYPT_TABLE[table_index] ^ seed1.wrapping_add(seed2);
        seed2 = (ch as u32)
            .wrapping_add(seed1)
            .wrapping_add(seed2)
            .wrapping_add(seed2 << 5)
            .wrapping_add(3);
    }

    seed1
}

/// Hash a path string
pub fn hash_path(path: &str, hash_type: u32) -> u32 {
    hash_path_bytes(path.as_bytes(), hash_type)
}

/// Encryption key for the on-disk hash table
pub fn hash_table_key() -> u32 {
    hash_path("(hash table)", hash_type::FILE_KEY)
}

/// Encryption key for the on-disk block table
pub fn block_table_key() -> u32 {
    hash_path("(block table)", hash_type::FILE_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_hash_values() {
        // Test vectors from the format documentation
        assert_eq!(
            hash_path("(listfile)", hash_type::TABLE_OFFSET),
            0x5F3DE859
        );
        assert_eq!(hash_path("(hash table)", hash_type::FILE_KEY), 0xC3AF3770);
        assert_eq!(hash_path("(block table)", hash_type::FILE_KEY), 0xEC83B3A3);
        assert_eq!(
            hash_path("path\\to\\file", hash_type::TABLE_OFFSET),
            0x534CC8EE
        );
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(
            hash_path("File.txt", hash_type::TABLE_OFFSET),
            hash_path("FILE.TXT", hash_type::TABLE_OFFSET)
        );
        assert_eq!(
            hash_path("path\\to\\FILE", hash_type::NAME_A),
            hash_path("PATH\\TO\\file", hash_type::NAME_A)
        );
    }

    #[test]
    fn test_slash_direction_invariant() {
        assert_eq!(
            hash_path("path/to/file.txt", hash_type::TABLE_OFFSET),
            hash_path("path\\to\\file.txt", hash_type::TABLE_OFFSET)
        );
        assert_eq!(
            hash_path("path/to/file.txt", hash_type::NAME_B),
            hash_path("path\\to\\file.txt", hash_type::NAME_B)
        );
    }

    #[test]
    fn test_high_bytes_pass_through() {
        // Bytes >= 0x80 are hashed as-is, so differently encoded paths
        // hash differently
        let latin1 = hash_path_bytes(b"caf\xE9", hash_type::NAME_A);
        let utf8 = hash_path_bytes("café".as_bytes(), hash_type::NAME_A);
        assert_ne!(latin1, utf8);
    }
}
