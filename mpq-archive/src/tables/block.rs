//! The block table
//!
//! Parallel directory of storage records. Slot order is meaningful only
//! through hash entries; a block entry with no flags is free for reuse.

use crate::crypto::{self, decrypt_bytes, encrypt_bytes};
use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom};

/// Block table entry (16 bytes on disk)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockEntry {
    /// File offset within the archive, low 32 bits
    pub file_pos: u32,
    /// Size the file occupies in the archive
    pub archived_size: u32,
    /// Uncompressed size
    pub file_size: u32,
    /// Flags
    pub flags: u32,
}

impl BlockEntry {
    /// Entry describes a live file
    pub const FLAG_VALID: u32 = 0x80000000;
    /// Per-sector Adler-32 checksums are stored after the sectors
    pub const FLAG_SECTOR_CRC: u32 = 0x04000000;
    /// Deletion marker that also stops directory searches
    pub const FLAG_STOP_SEARCH: u32 = 0x02000000;
    /// The file is stored as one blob with no sector table
    pub const FLAG_ONE_SECTOR: u32 = 0x01000000;
    /// The encryption key folds in the block offset and file size
    pub const FLAG_ADJUSTED_KEY: u32 = 0x00020000;
    /// Sectors are encrypted
    pub const FLAG_ENCRYPTED: u32 = 0x00010000;
    /// Sectors are compressed with a leading codec mask byte
    pub const FLAG_COMPRESSED: u32 = 0x00000200;
    /// Sectors are PKWARE-imploded with no codec mask byte
    pub const FLAG_IMPLODED: u32 = 0x00000100;

    /// Every flag a caller may supply when adding a file
    pub const FLAGS_MASK: u32 = 0x87030300;

    /// Check if the entry describes a live file
    pub fn is_valid(&self) -> bool {
        self.flags & Self::FLAG_VALID != 0
    }

    /// Check if the stored sectors are compressed or imploded
    pub fn is_compressed(&self) -> bool {
        self.flags & (Self::FLAG_COMPRESSED | Self::FLAG_IMPLODED) != 0
    }

    /// Check if the stored sectors are encrypted
    pub fn is_encrypted(&self) -> bool {
        self.flags & Self::FLAG_ENCRYPTED != 0
    }

    /// Check if the encryption key is offset-adjusted
    pub fn has_adjusted_key(&self) -> bool {
        self.flags & Self::FLAG_ADJUSTED_KEY != 0
    }

    /// Check if the file is stored as a single blob
    pub fn is_one_sector(&self) -> bool {
        self.flags & Self::FLAG_ONE_SECTOR != 0
    }

    /// Check if per-sector checksums are present
    pub fn has_sector_crcs(&self) -> bool {
        self.flags & Self::FLAG_SECTOR_CRC != 0
    }

    /// Check if the entry is PKWARE-imploded (mask-byte-less) storage
    pub fn is_imploded(&self) -> bool {
        self.flags & Self::FLAG_IMPLODED != 0
    }

    /// Check if the entry is free for reuse
    pub fn is_free(&self) -> bool {
        self.flags == 0
    }
}

/// The block table
#[derive(Debug, Clone)]
pub struct BlockTable {
    entries: Vec<BlockEntry>,
}

impl BlockTable {
    /// Bytes per entry on disk
    pub const ENTRY_SIZE: usize = 16;

    /// Create a table of `length` free entries
    pub fn new(length: u32) -> Self {
        Self {
            entries: vec![BlockEntry::default(); length as usize],
        }
    }

    /// Read and decrypt the table from its on-disk position
    pub fn read<R: Read + Seek>(reader: &mut R, offset: u64, length: u32) -> Result<Self> {
        reader.seek(SeekFrom::Start(offset))?;
        let mut raw = vec![0u8; length as usize * Self::ENTRY_SIZE];
        reader.read_exact(&mut raw)?;
        decrypt_bytes(&mut raw, crypto::block_table_key());

        let mut cursor = std::io::Cursor::new(&raw);
        let mut entries = Vec::with_capacity(length as usize);
        for _ in 0..length {
            entries.push(BlockEntry {
                file_pos: cursor.read_u32::<LittleEndian>()?,
                archived_size: cursor.read_u32::<LittleEndian>()?,
                file_size: cursor.read_u32::<LittleEndian>()?,
                flags: cursor.read_u32::<LittleEndian>()?,
            });
        }

        Ok(Self { entries })
    }

    /// Serialize and encrypt the table for writing
    pub fn to_encrypted_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.entries.len() * Self::ENTRY_SIZE);
        for entry in &self.entries {
            raw.write_u32::<LittleEndian>(entry.file_pos).unwrap();
            raw.write_u32::<LittleEndian>(entry.archived_size).unwrap();
            raw.write_u32::<LittleEndian>(entry.file_size).unwrap();
            raw.write_u32::<LittleEndian>(entry.flags).unwrap();
        }
        encrypt_bytes(&mut raw, crypto::block_table_key());
        raw
    }

    /// Number of entries
    pub fn length(&self) -> u32 {
        self.entries.len() as u32
    }

    /// All entries in slot order
    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    /// One entry
    pub fn get(&self, index: u32) -> Option<&BlockEntry> {
        self.entries.get(index as usize)
    }

    /// One entry, mutable
    pub fn get_mut(&mut self, index: u32) -> Option<&mut BlockEntry> {
        self.entries.get_mut(index as usize)
    }

    /// Replace an entry wholesale
    pub fn set(&mut self, index: u32, entry: BlockEntry) {
        self.entries[index as usize] = entry;
    }

    /// First free entry, or `BlockTableFull`
    pub fn find_free_entry(&self) -> Result<u32> {
        self.entries
            .iter()
            .position(|e| e.is_free())
            .map(|i| i as u32)
            .ok_or(Error::BlockTableFull)
    }

    /// Number of entries describing live files
    pub fn valid_count(&self) -> u32 {
        self.entries.iter().filter(|e| e.is_valid()).count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_flag_predicates() {
        let entry = BlockEntry {
            file_pos: 0x1000,
            archived_size: 100,
            file_size: 200,
            flags: BlockEntry::FLAG_VALID | BlockEntry::FLAG_COMPRESSED,
        };
        assert!(entry.is_valid());
        assert!(entry.is_compressed());
        assert!(!entry.is_encrypted());
        assert!(!entry.is_free());

        let encrypted = BlockEntry {
            flags: BlockEntry::FLAG_VALID
                | BlockEntry::FLAG_ENCRYPTED
                | BlockEntry::FLAG_ADJUSTED_KEY,
            ..Default::default()
        };
        assert!(encrypted.is_encrypted());
        assert!(encrypted.has_adjusted_key());
        assert!(!encrypted.is_compressed());
    }

    #[test]
    fn test_free_entry_allocation() {
        let mut table = BlockTable::new(4);
        table.get_mut(0).unwrap().flags = BlockEntry::FLAG_VALID;
        table.get_mut(1).unwrap().flags = BlockEntry::FLAG_VALID;
        assert_eq!(table.find_free_entry().unwrap(), 2);

        for i in 0..4 {
            table.get_mut(i).unwrap().flags = BlockEntry::FLAG_VALID;
        }
        assert!(matches!(table.find_free_entry(), Err(Error::BlockTableFull)));
    }

    #[test]
    fn test_encrypted_round_trip() {
        let mut table = BlockTable::new(8);
        table.set(
            0,
            BlockEntry {
                file_pos: 0x2C,
                archived_size: 512,
                file_size: 1024,
                flags: BlockEntry::FLAG_VALID | BlockEntry::FLAG_COMPRESSED,
            },
        );

        let bytes = table.to_encrypted_bytes();
        let parsed = BlockTable::read(&mut Cursor::new(&bytes), 0, 8).unwrap();
        assert_eq!(parsed.entries(), table.entries());
        assert_eq!(parsed.valid_count(), 1);
    }
}
