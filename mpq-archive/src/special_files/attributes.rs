//! The (attributes) special file
//!
//! Per-block metadata: a header of magic 100 and a flag word naming which
//! arrays follow, then a CRC32 array, a FILETIME array (Windows 100 ns units
//! since 1601) and an MD5 array, each sized by the block-table length.

use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Read};

/// Flags naming the arrays present in an (attributes) file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeFlags(u32);

impl AttributeFlags {
    /// CRC32 array present
    pub const CRC32: u32 = 0x00000001;
    /// FILETIME array present
    pub const FILETIME: u32 = 0x00000002;
    /// MD5 array present
    pub const MD5: u32 = 0x00000004;

    /// Wrap a raw flag word
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Check for the CRC32 array
    pub fn has_crc32(&self) -> bool {
        self.0 & Self::CRC32 != 0
    }

    /// Check for the FILETIME array
    pub fn has_filetime(&self) -> bool {
        self.0 & Self::FILETIME != 0
    }

    /// Check for the MD5 array
    pub fn has_md5(&self) -> bool {
        self.0 & Self::MD5 != 0
    }

    /// Raw flag word
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

/// Metadata for one block entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileAttributes {
    /// CRC32 of the uncompressed file data
    pub crc32: Option<u32>,
    /// Windows FILETIME of the file
    pub filetime: Option<u64>,
    /// MD5 of the uncompressed file data
    pub md5: Option<[u8; 16]>,
}

/// A parsed (attributes) file
#[derive(Debug, Clone)]
pub struct Attributes {
    /// Format version; always 100
    pub version: u32,
    /// Which arrays are present
    pub flags: AttributeFlags,
    /// One entry per block-table slot
    pub entries: Vec<FileAttributes>,
}

impl Attributes {
    /// The only known version of the attributes format
    pub const EXPECTED_VERSION: u32 = 100;

    /// Fresh attributes covering `block_count` entries
    pub fn new(flags: AttributeFlags, block_count: usize) -> Self {
        Self {
            version: Self::EXPECTED_VERSION,
            flags,
            entries: vec![FileAttributes::default(); block_count],
        }
    }

    /// Parse an (attributes) payload sized against the block table
    pub fn parse(data: &Bytes, block_count: usize) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::InvalidAttributesFile(
                "payload too small for header".into(),
            ));
        }

        let mut cursor = Cursor::new(data.as_ref());
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != Self::EXPECTED_VERSION {
            return Err(Error::InvalidAttributesFile(format!(
                "unsupported version {version}"
            )));
        }
        let flags = AttributeFlags::new(cursor.read_u32::<LittleEndian>()?);

        let mut expected = 8usize;
        if flags.has_crc32() {
            expected += block_count * 4;
        }
        if flags.has_filetime() {
            expected += block_count * 8;
        }
        if flags.has_md5() {
            expected += block_count * 16;
        }
        if data.len() < expected {
            return Err(Error::InvalidAttributesFile(format!(
                "payload is {} bytes, arrays need {}",
                data.len(),
                expected
            )));
        }

        let crc32_values = if flags.has_crc32() {
            let mut values = Vec::with_capacity(block_count);
            for _ in 0..block_count {
                values.push(cursor.read_u32::<LittleEndian>()?);
            }
            Some(values)
        } else {
            None
        };

        let filetime_values = if flags.has_filetime() {
            let mut values = Vec::with_capacity(block_count);
            for _ in 0..block_count {
                values.push(cursor.read_u64::<LittleEndian>()?);
            }
            Some(values)
        } else {
            None
        };

        let md5_values = if flags.has_md5() {
            let mut values = Vec::with_capacity(block_count);
            for _ in 0..block_count {
                let mut hash = [0u8; 16];
                cursor.read_exact(&mut hash)?;
                values.push(hash);
            }
            Some(values)
        } else {
            None
        };

        let mut entries = Vec::with_capacity(block_count);
        for i in 0..block_count {
            entries.push(FileAttributes {
                crc32: crc32_values.as_ref().map(|v| v[i]),
                filetime: filetime_values.as_ref().map(|v| v[i]),
                md5: md5_values.as_ref().map(|v| v[i]),
            });
        }

        Ok(Self {
            version,
            flags,
            entries,
        })
    }

    /// Metadata for one block slot
    pub fn get(&self, block_index: usize) -> Option<&FileAttributes> {
        self.entries.get(block_index)
    }

    /// Grow or shrink to match a rebuilt block table
    pub fn resize(&mut self, block_count: usize) {
        self.entries.resize(block_count, FileAttributes::default());
    }

    /// Serialize into an (attributes) payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(&self.flags.as_u32().to_le_bytes());

        if self.flags.has_crc32() {
            for entry in &self.entries {
                data.extend_from_slice(&entry.crc32.unwrap_or(0).to_le_bytes());
            }
        }
        if self.flags.has_filetime() {
            for entry in &self.entries {
                data.extend_from_slice(&entry.filetime.unwrap_or(0).to_le_bytes());
            }
        }
        if self.flags.has_md5() {
            for entry in &self.entries {
                data.extend_from_slice(&entry.md5.unwrap_or([0; 16]));
            }
        }

        data
    }
}
