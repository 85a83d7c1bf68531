//! Codec bitmask definitions
//!
//! Each compressed sector leads with one byte whose bits name the codecs
//! applied to it. Bits combine; the order they unwind in is fixed (see
//! [`super::decompress`]).

use crate::{Error, Result};

/// Codec mask bits
pub mod flags {
    /// Storm Huffman coding
    pub const HUFFMAN: u8 = 0x01;
    /// zlib deflate
    pub const ZLIB: u8 = 0x02;
    /// PKWARE Data Compression Library
    pub const PKWARE: u8 = 0x08;
    /// bzip2
    pub const BZIP2: u8 = 0x10;
    /// IMA ADPCM, one channel (lossy, audio only)
    pub const ADPCM_MONO: u8 = 0x40;
    /// IMA ADPCM, two channels (lossy, audio only)
    pub const ADPCM_STEREO: u8 = 0x80;

    /// Every bit a known codec claims
    pub const KNOWN_MASK: u8 = HUFFMAN | ZLIB | PKWARE | BZIP2 | ADPCM_MONO | ADPCM_STEREO;

    /// Bits naming lossy codecs
    pub const LOSSY_MASK: u8 = ADPCM_MONO | ADPCM_STEREO;
}

/// Reject masks containing bits no known codec claims
pub fn validate_mask(mask: u8) -> Result<()> {
    if mask & !flags::KNOWN_MASK != 0 {
        return Err(Error::InvalidCompressor(mask));
    }
    Ok(())
}

/// Check whether every codec named by the mask round-trips exactly
pub fn is_lossless(mask: u8) -> bool {
    mask & flags::LOSSY_MASK == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_mask() {
        assert!(validate_mask(0).is_ok());
        assert!(validate_mask(flags::ZLIB).is_ok());
        assert!(validate_mask(flags::ZLIB | flags::PKWARE).is_ok());
        assert!(validate_mask(flags::KNOWN_MASK).is_ok());

        assert!(matches!(
            validate_mask(0x04),
            Err(Error::InvalidCompressor(0x04))
        ));
        assert!(validate_mask(0x20 | flags::ZLIB).is_err());
    }

    #[test]
    fn test_lossless_classification() {
        assert!(is_lossless(flags::ZLIB | flags::BZIP2));
        assert!(!is_lossless(flags::ADPCM_MONO));
        assert!(!is_lossless(flags::ADPCM_STEREO | flags::HUFFMAN));
    }
}
