//! Multi-codec decompression

use super::algorithms;
use super::methods::{flags, validate_mask};
use crate::Result;

/// Decompress a payload whose leading mask byte has already been removed
///
/// Codecs unwind in fixed order: bzip2, PKWARE, zlib, Huffman, ADPCM stereo,
/// ADPCM mono (the reverse of the order they were applied). `expected_size`
/// is the decompressed size of the whole payload; it caps every stage, which
/// is safe because a stage that failed to shrink its input was stored
/// verbatim instead of compressed.
pub fn decompress(data: &[u8], mask: u8, expected_size: usize) -> Result<Vec<u8>> {
    validate_mask(mask)?;

    if mask == 0 || data.is_empty() {
        return Ok(data.to_vec());
    }

    log::trace!(
        "decompressing {} bytes to {} with mask 0x{:02X}",
        data.len(),
        expected_size,
        mask
    );

    let mut current = data.to_vec();

    if mask & flags::BZIP2 != 0 {
        current = algorithms::bzip2::decompress(&current, expected_size)?;
    }
    if mask & flags::PKWARE != 0 {
        current = algorithms::pkware::decompress(&current, expected_size)?;
    }
    if mask & flags::ZLIB != 0 {
        current = algorithms::zlib::decompress(&current, expected_size)?;
    }
    if mask & flags::HUFFMAN != 0 {
        current = algorithms::huffman::decompress(&current, expected_size)?;
    }
    if mask & flags::ADPCM_STEREO != 0 {
        current = algorithms::adpcm::decompress_stereo(&current, expected_size)?;
    }
    if mask & flags::ADPCM_MONO != 0 {
        current = algorithms::adpcm::decompress_mono(&current, expected_size)?;
    }

    Ok(current)
}

/// Decompress a stored sector, interpreting its leading mask byte
///
/// A sector whose stored length already equals the expected output is a
/// verbatim copy and carries no mask byte.
pub fn decompress_sector(raw: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    if raw.len() >= expected_size || raw.is_empty() {
        return Ok(raw.to_vec());
    }
    decompress(&raw[1..], raw[0], expected_size)
}
