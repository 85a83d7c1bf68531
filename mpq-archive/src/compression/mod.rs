//! The compression bridge
//!
//! Six codecs, combinable per sector through a one-byte bitmask.

mod algorithms;
mod compress;
mod decompress;
mod methods;

pub(crate) mod error_helpers {
    use crate::Error;
    use std::fmt::Display;

    pub(crate) fn compression_error(codec: &str, e: impl Display) -> Error {
        Error::invalid_operation(format!("{codec} compression failed: {e}"))
    }

    pub(crate) fn decompression_error(codec: &str, e: impl Display) -> Error {
        Error::decompression(format!("{codec} decompression failed: {e}"))
    }
}

pub use compress::{compress, compress_sector};
pub use decompress::{decompress, decompress_sector};
pub use methods::{flags, is_lossless, validate_mask};
