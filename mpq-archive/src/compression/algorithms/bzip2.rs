//! bzip2 codec

use crate::compression::error_helpers::{compression_error, decompression_error};
use crate::Result;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use std::io::{Read, Write};

/// Decompress a bzip2 stream
pub(crate) fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let mut decoder = BzDecoder::new(data);
    let mut decompressed = Vec::with_capacity(expected_size);

    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| decompression_error("bzip2", e))?;

    Ok(decompressed)
}

/// Compress with bzip2
///
/// `level` maps to blockSize100k; values outside 1..=9 select the default.
pub(crate) fn compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let compression = if (1..=9).contains(&level) {
        Compression::new(level as u32)
    } else {
        Compression::default()
    };

    let mut encoder = BzEncoder::new(Vec::new(), compression);
    encoder
        .write_all(data)
        .map_err(|e| compression_error("bzip2", e))?;
    encoder.finish().map_err(|e| compression_error("bzip2", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let original = b"Hello, World! This is a test of bzip2 compression in MPQ archives.";

        let compressed = compress(original, -1).expect("compression failed");
        let decompressed = decompress(&compressed, original.len()).expect("decompression failed");
        assert_eq!(decompressed, original);
    }

    #[test]
    fn test_quality_levels_round_trip() {
        let original: Vec<u8> = (0u16..2048).map(|v| (v % 251) as u8).collect();
        for level in [1, 5, 9] {
            let compressed = compress(&original, level).expect("compression failed");
            let decompressed =
                decompress(&compressed, original.len()).expect("decompression failed");
            assert_eq!(decompressed, original);
        }
    }
}
