//! Archive header, shunt record, and header discovery
//!
//! A container may begin with the header itself, or with a shunt record
//! pointing at it, or may embed the archive at any 512-byte-aligned offset.
//! Discovery probes every 512-byte boundary from a caller-supplied start
//! offset, within a bounded window.

use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};

/// Archive header magic ('MPQ\x1A')
pub const MPQ_MAGIC: u32 = 0x1A51504D;

/// Shunt record magic ('MPQ\x1B')
pub const SHUNT_MAGIC: u32 = 0x1B51504D;

/// Required alignment of the archive offset within its container
pub const ARCHIVE_ALIGNMENT: u64 = 0x200;

/// Default cap on the header scan window (spec'd as "large" in the source;
/// bounded here and overridable through [`crate::OpenOptions`])
pub const DEFAULT_HEADER_SEARCH_LIMIT: u64 = 16 * 1024 * 1024;

/// Smallest valid hash or block table length
pub const MIN_TABLE_LENGTH: u32 = 0x10;

/// Archive format version
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FormatVersion {
    /// The original format (32-byte header, 32-bit offsets)
    V0 = 0,
    /// The extended format (44-byte header, 48-bit file offsets)
    V1 = 1,
}

impl FormatVersion {
    /// Header size on disk for this version
    pub fn header_size(&self) -> u32 {
        match self {
            FormatVersion::V0 => 0x20,
            FormatVersion::V1 => 0x2C,
        }
    }

    /// Largest valid hash table length for this version
    pub fn max_table_length(&self) -> u32 {
        match self {
            FormatVersion::V0 => 0x10000,
            FormatVersion::V1 => 0x100000,
        }
    }

    /// Largest archive size this version can describe
    pub fn max_archive_size(&self) -> u64 {
        match self {
            FormatVersion::V0 => u32::MAX as u64,
            FormatVersion::V1 => u64::MAX,
        }
    }

    /// Create from the raw header field
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(FormatVersion::V0),
            1 => Some(FormatVersion::V1),
            _ => None,
        }
    }
}

/// The archive header
#[derive(Debug, Clone)]
pub struct MpqHeader {
    /// Size of the header structure
    pub header_size: u32,
    /// Size of the archive in bytes (low 32 bits for v1)
    pub archive_size: u32,
    /// Format version
    pub format_version: FormatVersion,
    /// Full sector size is `512 << sector_size_shift`
    pub sector_size_shift: u16,
    /// Hash table offset, low 32 bits, relative to the archive start
    pub hash_table_pos: u32,
    /// Block table offset, low 32 bits, relative to the archive start
    pub block_table_pos: u32,
    /// Number of hash table entries (a power of two)
    pub hash_table_size: u32,
    /// Number of block table entries
    pub block_table_size: u32,

    // Version 1 fields
    /// Offset of the extended block offset table, relative to the archive
    pub ext_block_table_pos: Option<u64>,
    /// High 16 bits of the hash table offset
    pub hash_table_pos_hi: Option<u16>,
    /// High 16 bits of the block table offset
    pub block_table_pos_hi: Option<u16>,
}

impl MpqHeader {
    /// Read a header positioned at the reader's current offset
    pub fn read<R: Read + Seek>(reader: &mut R, ignore_header_size: bool) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != MPQ_MAGIC {
            return Err(Error::invalid_archive("bad header magic"));
        }

        let header_size = reader.read_u32::<LittleEndian>()?;
        let archive_size = reader.read_u32::<LittleEndian>()?;
        let format_version_raw = reader.read_u16::<LittleEndian>()?;
        let sector_size_shift = reader.read_u16::<LittleEndian>()?;
        let hash_table_pos = reader.read_u32::<LittleEndian>()?;
        let block_table_pos = reader.read_u32::<LittleEndian>()?;
        let hash_table_size = reader.read_u32::<LittleEndian>()?;
        let block_table_size = reader.read_u32::<LittleEndian>()?;

        let format_version = FormatVersion::from_raw(format_version_raw)
            .ok_or(Error::InvalidArchiveVersion(format_version_raw))?;

        // Copy-protected archives lie about their header size; the check can
        // be bypassed but the fields past it are still read per version.
        if !ignore_header_size && header_size != format_version.header_size() {
            return Err(Error::invalid_archive(format!(
                "header size {} does not match version {:?}",
                header_size, format_version
            )));
        }

        let mut header = MpqHeader {
            header_size,
            archive_size,
            format_version,
            sector_size_shift,
            hash_table_pos,
            block_table_pos,
            hash_table_size,
            block_table_size,
            ext_block_table_pos: None,
            hash_table_pos_hi: None,
            block_table_pos_hi: None,
        };

        if format_version >= FormatVersion::V1 {
            header.ext_block_table_pos = Some(reader.read_u64::<LittleEndian>()?);
            header.hash_table_pos_hi = Some(reader.read_u16::<LittleEndian>()?);
            header.block_table_pos_hi = Some(reader.read_u16::<LittleEndian>()?);
        }

        header.validate()?;
        Ok(header)
    }

    /// Write the header at the writer's current offset
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(MPQ_MAGIC)?;
        writer.write_u32::<LittleEndian>(self.format_version.header_size())?;
        writer.write_u32::<LittleEndian>(self.archive_size)?;
        writer.write_u16::<LittleEndian>(self.format_version as u16)?;
        writer.write_u16::<LittleEndian>(self.sector_size_shift)?;
        writer.write_u32::<LittleEndian>(self.hash_table_pos)?;
        writer.write_u32::<LittleEndian>(self.block_table_pos)?;
        writer.write_u32::<LittleEndian>(self.hash_table_size)?;
        writer.write_u32::<LittleEndian>(self.block_table_size)?;

        if self.format_version >= FormatVersion::V1 {
            writer.write_u64::<LittleEndian>(self.ext_block_table_pos.unwrap_or(0))?;
            writer.write_u16::<LittleEndian>(self.hash_table_pos_hi.unwrap_or(0))?;
            writer.write_u16::<LittleEndian>(self.block_table_pos_hi.unwrap_or(0))?;
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let max = self.format_version.max_table_length();
        if !self.hash_table_size.is_power_of_two()
            || self.hash_table_size < MIN_TABLE_LENGTH
            || self.hash_table_size > max
        {
            return Err(Error::invalid_archive(format!(
                "hash table length {} out of range",
                self.hash_table_size
            )));
        }
        if self.block_table_size > max {
            return Err(Error::invalid_archive(format!(
                "block table length {} out of range",
                self.block_table_size
            )));
        }

        // Tables cannot overlap the header
        let header_end = self.format_version.header_size() as u64;
        if self.hash_table_pos64() < header_end || self.block_table_pos64() < header_end {
            return Err(Error::invalid_archive("tables overlap the header"));
        }
        Ok(())
    }

    /// Full 64-bit hash table offset
    pub fn hash_table_pos64(&self) -> u64 {
        ((self.hash_table_pos_hi.unwrap_or(0) as u64) << 32) | self.hash_table_pos as u64
    }

    /// Full 64-bit block table offset
    pub fn block_table_pos64(&self) -> u64 {
        ((self.block_table_pos_hi.unwrap_or(0) as u64) << 32) | self.block_table_pos as u64
    }

    /// Full sector size in bytes
    pub fn sector_size(&self) -> usize {
        512usize << self.sector_size_shift
    }
}

/// Locate the archive header inside a container
///
/// Probes every 512-byte boundary starting at `start_offset`. A shunt record
/// redirects to the real header; the redirected offset must itself be
/// aligned. Returns the archive offset and the parsed header.
pub fn find_header<R: Read + Seek>(
    reader: &mut R,
    start_offset: u64,
    search_limit: u64,
    ignore_header_size: bool,
) -> Result<(u64, MpqHeader)> {
    if start_offset % ARCHIVE_ALIGNMENT != 0 {
        return Err(Error::InvalidArchiveOffset(start_offset));
    }

    let file_size = reader.seek(SeekFrom::End(0))?;
    let scan_end = start_offset.saturating_add(search_limit).min(file_size);

    let mut offset = start_offset;
    while offset < scan_end {
        reader.seek(SeekFrom::Start(offset))?;
        let magic = match reader.read_u32::<LittleEndian>() {
            Ok(magic) => magic,
            Err(_) => break,
        };

        match magic {
            MPQ_MAGIC => {
                reader.seek(SeekFrom::Start(offset))?;
                let header = MpqHeader::read(reader, ignore_header_size)?;
                return Ok((offset, header));
            }
            SHUNT_MAGIC => {
                let _unused = reader.read_u32::<LittleEndian>()?;
                let header_offset = reader.read_u32::<LittleEndian>()? as u64;
                let target = offset + header_offset;
                if target % ARCHIVE_ALIGNMENT != 0 {
                    return Err(Error::InvalidArchiveOffset(target));
                }
                if target < file_size {
                    reader.seek(SeekFrom::Start(target))?;
                    if reader.read_u32::<LittleEndian>()? == MPQ_MAGIC {
                        reader.seek(SeekFrom::Start(target))?;
                        let header = MpqHeader::read(reader, ignore_header_size)?;
                        return Ok((target, header));
                    }
                }
            }
            _ => {}
        }

        offset += ARCHIVE_ALIGNMENT;
    }

    Err(Error::invalid_archive("no archive header found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_header(version: FormatVersion) -> MpqHeader {
        MpqHeader {
            header_size: version.header_size(),
            archive_size: 0x1000,
            format_version: version,
            sector_size_shift: 3,
            hash_table_pos: 0x800,
            block_table_pos: 0x900,
            hash_table_size: 16,
            block_table_size: 16,
            ext_block_table_pos: (version >= FormatVersion::V1).then_some(0),
            hash_table_pos_hi: (version >= FormatVersion::V1).then_some(0),
            block_table_pos_hi: (version >= FormatVersion::V1).then_some(0),
        }
    }

    #[test]
    fn test_header_round_trip_v0() {
        let header = sample_header(FormatVersion::V0);
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 0x20);

        let parsed = MpqHeader::read(&mut Cursor::new(&buf), false).unwrap();
        assert_eq!(parsed.archive_size, header.archive_size);
        assert_eq!(parsed.hash_table_size, 16);
        assert_eq!(parsed.format_version, FormatVersion::V0);
    }

    #[test]
    fn test_header_round_trip_v1() {
        let mut header = sample_header(FormatVersion::V1);
        header.hash_table_pos_hi = Some(0x0001);
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 0x2C);

        let parsed = MpqHeader::read(&mut Cursor::new(&buf), false).unwrap();
        assert_eq!(parsed.hash_table_pos64(), 0x1_0000_0800);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let buf = vec![0u8; 0x20];
        assert!(MpqHeader::read(&mut Cursor::new(&buf), false).is_err());
    }

    #[test]
    fn test_non_power_of_two_hash_length_rejected() {
        let mut header = sample_header(FormatVersion::V0);
        header.hash_table_size = 17;
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert!(MpqHeader::read(&mut Cursor::new(&buf), false).is_err());
    }

    #[test]
    fn test_find_header_at_aligned_offset() {
        let mut container = vec![0u8; 0x400];
        let header = sample_header(FormatVersion::V0);
        let mut header_bytes = Vec::new();
        header.write(&mut header_bytes).unwrap();
        container.extend_from_slice(&header_bytes);
        container.resize(0x2000, 0);

        let (offset, found) = find_header(
            &mut Cursor::new(&container),
            0,
            DEFAULT_HEADER_SEARCH_LIMIT,
            false,
        )
        .unwrap();
        assert_eq!(offset, 0x400);
        assert_eq!(found.hash_table_size, 16);
    }

    #[test]
    fn test_find_header_through_shunt() {
        // Shunt at 0 pointing at the header 0x600 bytes in
        let mut container = vec![0u8; 0x2000];
        let mut cursor = Cursor::new(&mut container[..]);
        cursor.write_u32::<LittleEndian>(SHUNT_MAGIC).unwrap();
        cursor.write_u32::<LittleEndian>(0).unwrap();
        cursor.write_u32::<LittleEndian>(0x600).unwrap();

        let header = sample_header(FormatVersion::V0);
        let mut header_bytes = Vec::new();
        header.write(&mut header_bytes).unwrap();
        container[0x600..0x600 + header_bytes.len()].copy_from_slice(&header_bytes);

        let (offset, _) = find_header(
            &mut Cursor::new(&container),
            0,
            DEFAULT_HEADER_SEARCH_LIMIT,
            false,
        )
        .unwrap();
        assert_eq!(offset, 0x600);
    }

    #[test]
    fn test_unaligned_start_offset_rejected() {
        let container = vec![0u8; 0x1000];
        assert!(matches!(
            find_header(&mut Cursor::new(&container), 0x1FF, 0x1000, false),
            Err(Error::InvalidArchiveOffset(0x1FF))
        ));
    }

    #[test]
    fn test_search_window_is_bounded() {
        // No header anywhere; the scan must terminate at the cap
        let container = vec![0u8; 0x4000];
        let err = find_header(&mut Cursor::new(&container), 0, 0x1000, false).unwrap_err();
        assert!(matches!(err, Error::InvalidArchive(_)));
    }
}
