//! The extended block offset table (version 1)
//!
//! One u16 per block entry carrying bits 32..48 of that block's file offset.
//! Stored unencrypted after the block table; omitted entirely when every
//! high half is zero.

use crate::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom};

/// High halves of 48-bit block offsets
#[derive(Debug, Clone)]
pub struct ExtBlockOffsetTable {
    entries: Vec<u16>,
}

impl ExtBlockOffsetTable {
    /// A table of zero high halves
    pub fn new(length: u32) -> Self {
        Self {
            entries: vec![0; length as usize],
        }
    }

    /// Read the table from its on-disk position
    pub fn read<R: Read + Seek>(reader: &mut R, offset: u64, length: u32) -> Result<Self> {
        reader.seek(SeekFrom::Start(offset))?;
        let mut entries = Vec::with_capacity(length as usize);
        for _ in 0..length {
            entries.push(reader.read_u16::<LittleEndian>()?);
        }
        Ok(Self { entries })
    }

    /// Serialize the table for writing
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.entries.len() * 2);
        for &entry in &self.entries {
            raw.write_u16::<LittleEndian>(entry).unwrap();
        }
        raw
    }

    /// High 16 bits for one block
    pub fn get(&self, index: u32) -> u16 {
        self.entries.get(index as usize).copied().unwrap_or(0)
    }

    /// Store the high 16 bits for one block
    pub fn set(&mut self, index: u32, value: u16) {
        if let Some(entry) = self.entries.get_mut(index as usize) {
            *entry = value;
        }
    }

    /// Merge with a low 32-bit offset into the absolute offset
    pub fn merge(&self, index: u32, low: u32) -> u64 {
        ((self.get(index) as u64) << 32) | low as u64
    }

    /// Check whether any high half is nonzero
    pub fn is_needed(&self) -> bool {
        self.entries.iter().any(|&v| v != 0)
    }

    /// Number of entries
    pub fn length(&self) -> u32 {
        self.entries.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_merge() {
        let mut table = ExtBlockOffsetTable::new(4);
        table.set(2, 0x0001);
        assert_eq!(table.merge(2, 0x8000_0000), 0x1_8000_0000);
        assert_eq!(table.merge(0, 0x1234), 0x1234);
    }

    #[test]
    fn test_needed_only_when_nonzero() {
        let mut table = ExtBlockOffsetTable::new(4);
        assert!(!table.is_needed());
        table.set(0, 1);
        assert!(table.is_needed());
    }

    #[test]
    fn test_round_trip() {
        let mut table = ExtBlockOffsetTable::new(3);
        table.set(0, 0xAAAA);
        table.set(2, 0x0102);

        let bytes = table.to_bytes();
        let parsed = ExtBlockOffsetTable::read(&mut Cursor::new(&bytes), 0, 3).unwrap();
        assert_eq!(parsed.get(0), 0xAAAA);
        assert_eq!(parsed.get(1), 0);
        assert_eq!(parsed.get(2), 0x0102);
    }
}
