//! Codec implementations

pub(super) mod adpcm;
pub(super) mod bzip2;
pub(super) mod huffman;
pub(super) mod pkware;
pub(super) mod zlib;
