//! zlib deflate codec

use crate::compression::error_helpers::{compression_error, decompression_error};
use crate::Result;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Decompress a zlib stream
pub(crate) fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut decompressed = Vec::with_capacity(expected_size);

    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| decompression_error("zlib", e))?;

    if decompressed.len() != expected_size {
        log::debug!(
            "zlib output size mismatch: expected {}, got {}",
            expected_size,
            decompressed.len()
        );
    }
    Ok(decompressed)
}

/// Compress with zlib deflate
///
/// `level` outside 0..=9 selects the zlib default.
pub(crate) fn compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let compression = if (0..=9).contains(&level) {
        Compression::new(level as u32)
    } else {
        Compression::default()
    };

    let mut encoder = ZlibEncoder::new(Vec::new(), compression);
    encoder
        .write_all(data)
        .map_err(|e| compression_error("zlib", e))?;
    encoder.finish().map_err(|e| compression_error("zlib", e))
}
