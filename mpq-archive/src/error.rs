//! Error types for the MPQ archive engine

use std::io;
use thiserror::Error;

/// Result type alias for MPQ operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for MPQ operations
///
/// Every fallible entry point surfaces one of these. [`Error::code`] exposes
/// a stable numeric identifier per variant for callers that persist or
/// compare error values across versions.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The block table has no free entry left
    #[error("block table is full")]
    BlockTableFull,

    /// The hash table has no free slot on the probe chain
    #[error("hash table is full")]
    HashTableFull,

    /// No hash table entry matches the requested path and locale
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// MPQ paths are limited to 259 bytes
    #[error("filename too long: {0} bytes")]
    FilenameTooLong(usize),

    /// MPQ paths must be ASCII
    #[error("filename cannot be represented as ASCII: {0}")]
    FilenameNotAscii(String),

    /// The operation requires a filename that is not known
    #[error("filename required for this operation")]
    FilenameRequired,

    /// The archive still has open file handles
    #[error("archive has {0} open file(s)")]
    FileIsOpen(u32),

    /// A file with the same path and locale already exists
    #[error("file already exists: {0}")]
    FileExists(String),

    /// The delegate vetoed the operation
    #[error("operation cancelled by delegate")]
    DelegateCancelled,

    /// Operation not supported by this archive or format version
    #[error("operation not supported: {0}")]
    OperationNotSupported(&'static str),

    /// The referenced file has been deleted
    #[error("file is deleted: {0}")]
    FileIsDeleted(String),

    /// The file entry cannot be used (bad sector table, undetectable key,
    /// or pending data that is not in the container yet)
    #[error("file is invalid: {0}")]
    FileIsInvalid(String),

    /// COMPRESSED and IMPLODED describe different stored layouts
    #[error("inconsistent compression flags")]
    InconsistentCompressionFlags,

    /// The sector's codec mask contains bits no known codec claims
    #[error("invalid compressor mask: 0x{0:02X}")]
    InvalidCompressor(u8),

    /// Archives cannot grow or shrink outside of a save
    #[error("cannot resize archive")]
    CannotResizeArchive,

    /// The projected archive size exceeds what the version can address
    #[error("archive size overflow: {size} exceeds the version {version} limit")]
    ArchiveSizeOverflow {
        /// Projected size after save
        size: u64,
        /// Archive format version (0 or 1)
        version: u16,
    },

    /// The archive was opened read-only
    #[error("archive is read-only")]
    ReadOnlyArchive,

    /// The save destination is not writable
    #[error("destination is read-only: {0}")]
    ReadOnlyDestination(String),

    /// Bad magic, malformed header, or tables out of range
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// A cached sector-offset table failed revalidation
    #[error("invalid sector table cache")]
    InvalidSectorTableCache,

    /// The archive carries no signature of the requested kind
    #[error("no signature present")]
    NoSignature,

    /// The archive has no backing file yet
    #[error("archive has no backing file")]
    NoArchiveFile,

    /// Unsupported format version field
    #[error("invalid archive version: {0}")]
    InvalidArchiveVersion(u16),

    /// The archive offset is not 512-byte aligned or out of range
    #[error("invalid archive offset: 0x{0:X}")]
    InvalidArchiveOffset(u64),

    /// Unknown seek displacement mode
    #[error("invalid displacement mode")]
    InvalidDisplacementMode,

    /// A codec failed to decompress a sector
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// Read past the end of a file
    #[error("end of file")]
    EndOfFile,

    /// The (attributes) file is malformed
    #[error("invalid attributes file: {0}")]
    InvalidAttributesFile(String),

    /// The requested operation is not valid in the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The payload exceeds what a block entry can describe
    #[error("data too large: {0} bytes")]
    DataTooLarge(u64),

    /// A sector's Adler-32 did not match the stored checksum
    #[error("sector {sector} checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    InvalidSectorChecksum {
        /// Index of the failing sector within the file
        sector: u32,
        /// Checksum stored in the CRC block
        expected: u32,
        /// Checksum computed from the decompressed sector
        computed: u32,
    },

    /// The per-sector CRC block itself is malformed
    #[error("invalid sector checksum data")]
    InvalidSectorChecksumData,

    /// An offset or length fell outside the archive bounds
    #[error("out of bounds: {0}")]
    OutOfBounds(String),
}

impl Error {
    /// Stable numeric code for this error
    ///
    /// The numbering follows the original error table, so codes survive
    /// library upgrades and can be compared across process boundaries.
    pub fn code(&self) -> u32 {
        match self {
            Error::BlockTableFull => 2,
            Error::HashTableFull => 3,
            Error::FileNotFound(_) => 4,
            Error::FilenameTooLong(_) => 6,
            Error::FilenameNotAscii(_) => 7,
            Error::FileIsOpen(_) => 9,
            Error::FileExists(_) => 10,
            Error::DelegateCancelled => 11,
            Error::OperationNotSupported(_) => 12,
            Error::FileIsDeleted(_) => 14,
            Error::FileIsInvalid(_) => 15,
            Error::InconsistentCompressionFlags => 16,
            Error::InvalidCompressor(_) => 17,
            Error::CannotResizeArchive => 18,
            Error::ArchiveSizeOverflow { .. } => 19,
            Error::ReadOnlyArchive => 20,
            Error::ReadOnlyDestination(_) => 22,
            Error::InvalidArchive(_) => 23,
            Error::InvalidSectorTableCache => 24,
            Error::FilenameRequired => 25,
            Error::NoSignature => 26,
            Error::NoArchiveFile => 27,
            Error::InvalidArchiveVersion(_) => 28,
            Error::InvalidArchiveOffset(_) => 29,
            Error::InvalidDisplacementMode => 31,
            Error::DecompressionFailed(_) => 33,
            Error::EndOfFile => 34,
            Error::InvalidAttributesFile(_) => 35,
            Error::InvalidOperation(_) => 36,
            Error::DataTooLarge(_) => 37,
            Error::Io(_) => 38,
            Error::OutOfBounds(_) => 39,
            Error::InvalidSectorChecksum { .. } => 40,
            Error::InvalidSectorChecksumData => 41,
        }
    }

    /// Create a new InvalidArchive error
    pub fn invalid_archive<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArchive(msg.into())
    }

    /// Create a new DecompressionFailed error
    pub fn decompression<S: Into<String>>(msg: S) -> Self {
        Error::DecompressionFailed(msg.into())
    }

    /// Create a new InvalidOperation error
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// Check if this error indicates a corrupted container
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::InvalidArchive(_)
                | Error::InvalidSectorChecksum { .. }
                | Error::InvalidSectorChecksumData
                | Error::InvalidAttributesFile(_)
                | Error::InvalidSectorTableCache
        )
    }

    /// Check if the archive remains usable after this error
    ///
    /// A failing sector read does not invalidate the archive; the same file
    /// stays openable and other sectors stay readable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::FileNotFound(_)
                | Error::FileExists(_)
                | Error::FileIsOpen(_)
                | Error::ReadOnlyArchive
                | Error::DelegateCancelled
                | Error::OperationNotSupported(_)
                | Error::DecompressionFailed(_)
                | Error::InvalidSectorChecksum { .. }
        )
    }
}
