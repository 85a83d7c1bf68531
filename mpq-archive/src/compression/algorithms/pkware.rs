//! PKWARE Data Compression Library codec
//!
//! The implode direction goes through `pklib`; the explode direction through
//! the `implode` crate's block decoder. The dictionary size follows the
//! historical selection by input length: 0x400 below 0x600 bytes, 0x800
//! below 0xC00, 0x1000 otherwise.

use crate::compression::error_helpers::compression_error;
use crate::{Error, Result};
use implode::exploder::Exploder;
use implode::symbol::DEFAULT_CODE_TABLE;
use pklib::{implode_bytes, CompressionMode, DictionarySize};

/// Compress with PKWARE DCL implode
pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let dict_size = if data.len() < 0x600 {
        DictionarySize::Size1K
    } else if data.len() < 0xC00 {
        DictionarySize::Size2K
    } else {
        DictionarySize::Size4K
    };

    implode_bytes(data, CompressionMode::ASCII, dict_size)
        .map_err(|e| compression_error("PKWARE", e))
}

/// Decompress PKWARE DCL imploded data
pub(crate) fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let mut exploder = Exploder::new(&DEFAULT_CODE_TABLE);
    let mut output = Vec::with_capacity(expected_size);
    let mut input_pos = 0;

    while !exploder.ended && input_pos < data.len() && output.len() < expected_size {
        let (consumed, block) = exploder
            .explode_block(&data[input_pos..])
            .map_err(|e| Error::decompression(format!("PKWARE explode failed: {e:?}")))?;
        input_pos += consumed;

        let take = block.len().min(expected_size - output.len());
        output.extend_from_slice(&block[..take]);
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_data() {
        assert_eq!(compress(b"").unwrap(), Vec::<u8>::new());
        assert_eq!(decompress(b"", 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_round_trip() {
        let original = b"ABCABCABCABC repeated text compresses well under DCL ABCABCABCABC";
        let compressed = compress(original).expect("implode failed");
        let decompressed = decompress(&compressed, original.len()).expect("explode failed");
        assert_eq!(decompressed, original);
    }

    #[test]
    fn test_dictionary_size_thresholds_round_trip() {
        // One payload per dictionary bucket
        for len in [0x200usize, 0x800, 0x2000] {
            let original: Vec<u8> = (0..len).map(|i| (i % 59) as u8).collect();
            let compressed = compress(&original).expect("implode failed");
            let decompressed = decompress(&compressed, original.len()).expect("explode failed");
            assert_eq!(decompressed, original);
        }
    }
}
