//! Multi-codec compression

use super::algorithms;
use super::methods::{flags, validate_mask};
use crate::Result;

/// Compress a payload under the requested codec mask
///
/// Codecs apply in fixed order: ADPCM mono, ADPCM stereo, Huffman, zlib,
/// PKWARE, bzip2 (decompression unwinds the reverse). A stage whose output
/// does not shrink its input is skipped and its bit cleared, which is what
/// keeps every stored stage decompressible under a whole-payload size cap.
///
/// Returns the payload (without the leading mask byte) and the effective
/// mask. An effective mask of zero means the caller must store the input
/// verbatim with no mask byte; the same applies when adding the mask byte
/// would cancel the savings.
pub fn compress(data: &[u8], mask: u8, quality: i32) -> Result<(Vec<u8>, u8)> {
    validate_mask(mask)?;

    if mask == 0 || data.is_empty() {
        return Ok((data.to_vec(), 0));
    }

    let mut current = data.to_vec();
    let mut effective = mask;

    let apply = |bit: u8,
                 current: &mut Vec<u8>,
                 effective: &mut u8,
                 stage: &dyn Fn(&[u8]) -> Result<Vec<u8>>|
     -> Result<()> {
        if mask & bit == 0 {
            return Ok(());
        }
        let output = stage(current)?;
        if output.is_empty() || output.len() >= current.len() {
            // Expansion: store this stage verbatim and drop its bit
            *effective &= !bit;
        } else {
            *current = output;
        }
        Ok(())
    };

    apply(flags::ADPCM_MONO, &mut current, &mut effective, &|d| {
        algorithms::adpcm::compress_mono(d, adpcm_quality(quality))
    })?;
    apply(flags::ADPCM_STEREO, &mut current, &mut effective, &|d| {
        algorithms::adpcm::compress_stereo(d, adpcm_quality(quality))
    })?;
    apply(flags::HUFFMAN, &mut current, &mut effective, &|d| {
        algorithms::huffman::compress(d, 0)
    })?;
    apply(flags::ZLIB, &mut current, &mut effective, &|d| {
        algorithms::zlib::compress(d, quality)
    })?;
    apply(flags::PKWARE, &mut current, &mut effective, &|d| {
        algorithms::pkware::compress(d)
    })?;
    apply(flags::BZIP2, &mut current, &mut effective, &|d| {
        algorithms::bzip2::compress(d, quality)
    })?;

    if effective == 0 || current.len() + 1 >= data.len() {
        return Ok((data.to_vec(), 0));
    }
    Ok((current, effective))
}

/// Compress one sector into its stored form, mask byte included
pub fn compress_sector(data: &[u8], mask: u8, quality: i32) -> Result<Vec<u8>> {
    let (payload, effective) = compress(data, mask, quality)?;
    if effective == 0 {
        return Ok(payload);
    }
    let mut stored = Vec::with_capacity(payload.len() + 1);
    stored.push(effective);
    stored.extend_from_slice(&payload);
    Ok(stored)
}

fn adpcm_quality(quality: i32) -> u8 {
    if (4..=6).contains(&quality) {
        quality as u8
    } else {
        5
    }
}
