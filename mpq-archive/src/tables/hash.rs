//! The hash table directory
//!
//! A power-of-two array of 16-byte entries, probed by open addressing.
//! Deleted slots keep probe chains alive; never-used slots terminate them.

use crate::crypto::{self, decrypt_bytes, encrypt_bytes, hash_type};
use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom};

/// Hash table entry (16 bytes on disk)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashEntry {
    /// First verification hash of the path
    pub hash_a: u32,
    /// Second verification hash of the path
    pub hash_b: u32,
    /// Windows LANGID of the file (0 = neutral)
    pub locale: u16,
    /// Platform the file is used for; unused, preserved on round-trip
    pub platform: u16,
    /// Block table index or a sentinel
    pub block_index: u32,
}

impl HashEntry {
    /// Slot has never held a file; terminates probe chains
    pub const EMPTY: u32 = 0xFFFFFFFF;
    /// Slot held a file that was deleted; probe chains continue through it
    pub const DELETED: u32 = 0xFFFFFFFE;

    /// An entry that has never been used
    pub fn empty() -> Self {
        Self {
            hash_a: 0xFFFFFFFF,
            hash_b: 0xFFFFFFFF,
            locale: 0xFFFF,
            platform: 0xFFFF,
            block_index: Self::EMPTY,
        }
    }

    /// Check if this slot has never been used
    pub fn is_empty(&self) -> bool {
        self.block_index == Self::EMPTY
    }

    /// Check if this slot was deleted
    pub fn is_deleted(&self) -> bool {
        self.block_index == Self::DELETED
    }

    /// Check if this slot references a block
    pub fn is_occupied(&self) -> bool {
        self.block_index < Self::DELETED
    }
}

/// The hash table
#[derive(Debug, Clone)]
pub struct HashTable {
    entries: Vec<HashEntry>,
    mask: u32,
}

impl HashTable {
    /// Bytes per entry on disk
    pub const ENTRY_SIZE: usize = 16;

    /// Create an empty table; `length` must be a power of two
    pub fn new(length: u32) -> Result<Self> {
        if !length.is_power_of_two() {
            return Err(Error::invalid_archive(
                "hash table length must be a power of two",
            ));
        }
        Ok(Self {
            entries: vec![HashEntry::empty(); length as usize],
            mask: length - 1,
        })
    }

    /// Read and decrypt the table from its on-disk position
    pub fn read<R: Read + Seek>(reader: &mut R, offset: u64, length: u32) -> Result<Self> {
        if !length.is_power_of_two() {
            return Err(Error::invalid_archive(
                "hash table length must be a power of two",
            ));
        }

        reader.seek(SeekFrom::Start(offset))?;
        let mut raw = vec![0u8; length as usize * Self::ENTRY_SIZE];
        reader.read_exact(&mut raw)?;
        decrypt_bytes(&mut raw, crypto::hash_table_key());

        let mut cursor = std::io::Cursor::new(&raw);
        let mut entries = Vec::with_capacity(length as usize);
        for _ in 0..length {
            entries.push(HashEntry {
                hash_a: cursor.read_u32::<LittleEndian>()?,
                hash_b: cursor.read_u32::<LittleEndian>()?,
                locale: cursor.read_u16::<LittleEndian>()?,
                platform: cursor.read_u16::<LittleEndian>()?,
                block_index: cursor.read_u32::<LittleEndian>()?,
            });
        }

        Ok(Self {
            entries,
            mask: length - 1,
        })
    }

    /// Serialize and encrypt the table for writing
    pub fn to_encrypted_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.entries.len() * Self::ENTRY_SIZE);
        for entry in &self.entries {
            raw.write_u32::<LittleEndian>(entry.hash_a).unwrap();
            raw.write_u32::<LittleEndian>(entry.hash_b).unwrap();
            raw.write_u16::<LittleEndian>(entry.locale).unwrap();
            raw.write_u16::<LittleEndian>(entry.platform).unwrap();
            raw.write_u32::<LittleEndian>(entry.block_index).unwrap();
        }
        encrypt_bytes(&mut raw, crypto::hash_table_key());
        raw
    }

    /// Number of slots
    pub fn length(&self) -> u32 {
        self.entries.len() as u32
    }

    /// All slots in table order
    pub fn entries(&self) -> &[HashEntry] {
        &self.entries
    }

    /// One slot
    pub fn get(&self, index: u32) -> Option<&HashEntry> {
        self.entries.get(index as usize)
    }

    /// One slot, mutable
    pub fn get_mut(&mut self, index: u32) -> Option<&mut HashEntry> {
        self.entries.get_mut(index as usize)
    }

    /// Replace a slot wholesale (undo restores saved entries through this)
    pub fn set(&mut self, index: u32, entry: HashEntry) {
        self.entries[index as usize] = entry;
    }

    /// Find the slot holding `path` under `locale`
    ///
    /// A slot matches when both verification hashes and the locale match
    /// exactly. Deleted slots are skipped; an empty slot ends the search.
    pub fn find(&self, path: &str, locale: u16) -> Option<(u32, &HashEntry)> {
        let hash_a = crypto::hash_path(path, hash_type::NAME_A);
        let hash_b = crypto::hash_path(path, hash_type::NAME_B);
        let start = crypto::hash_path(path, hash_type::TABLE_OFFSET) & self.mask;

        let mut index = start;
        loop {
            let entry = &self.entries[index as usize];
            if entry.is_empty() {
                return None;
            }
            if entry.is_occupied()
                && entry.hash_a == hash_a
                && entry.hash_b == hash_b
                && entry.locale == locale
            {
                return Some((index, entry));
            }

            index = (index + 1) & self.mask;
            if index == start {
                return None;
            }
        }
    }

    /// Every locale under which `path` exists, in probe-chain order
    pub fn locales_for(&self, path: &str) -> Vec<u16> {
        let hash_a = crypto::hash_path(path, hash_type::NAME_A);
        let hash_b = crypto::hash_path(path, hash_type::NAME_B);
        let start = crypto::hash_path(path, hash_type::TABLE_OFFSET) & self.mask;

        let mut locales = Vec::new();
        let mut index = start;
        loop {
            let entry = &self.entries[index as usize];
            if entry.is_empty() {
                break;
            }
            if entry.is_occupied() && entry.hash_a == hash_a && entry.hash_b == hash_b {
                locales.push(entry.locale);
            }

            index = (index + 1) & self.mask;
            if index == start {
                break;
            }
        }
        locales
    }

    /// Find the slot an insertion of `path` would use
    ///
    /// The first empty or deleted slot on the probe chain wins. Fails with
    /// `HashTableFull` when the chain wraps without finding one.
    pub fn find_free_slot(&self, path: &str) -> Result<u32> {
        let start = crypto::hash_path(path, hash_type::TABLE_OFFSET) & self.mask;

        let mut index = start;
        loop {
            let entry = &self.entries[index as usize];
            if entry.is_empty() || entry.is_deleted() {
                return Ok(index);
            }

            index = (index + 1) & self.mask;
            if index == start {
                return Err(Error::HashTableFull);
            }
        }
    }

    /// Number of occupied slots
    pub fn occupied_count(&self) -> u32 {
        self.entries.iter().filter(|e| e.is_occupied()).count() as u32
    }

    /// Number of occupied or deleted slots
    pub fn used_count(&self) -> u32 {
        self.entries.iter().filter(|e| !e.is_empty()).count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn insert(table: &mut HashTable, path: &str, locale: u16, block_index: u32) -> u32 {
        let slot = table.find_free_slot(path).unwrap();
        table.set(
            slot,
            HashEntry {
                hash_a: crypto::hash_path(path, hash_type::NAME_A),
                hash_b: crypto::hash_path(path, hash_type::NAME_B),
                locale,
                platform: 0,
                block_index,
            },
        );
        slot
    }

    #[test]
    fn test_entry_states() {
        let empty = HashEntry::empty();
        assert!(empty.is_empty());
        assert!(!empty.is_deleted());
        assert!(!empty.is_occupied());

        let mut deleted = HashEntry::empty();
        deleted.block_index = HashEntry::DELETED;
        assert!(deleted.is_deleted());
        assert!(!deleted.is_occupied());
    }

    #[test]
    fn test_find_exact_locale_match() {
        let mut table = HashTable::new(16).unwrap();
        insert(&mut table, "war3map.j", 0, 0);
        insert(&mut table, "war3map.j", 0x409, 1);

        assert_eq!(table.find("war3map.j", 0).unwrap().1.block_index, 0);
        assert_eq!(table.find("war3map.j", 0x409).unwrap().1.block_index, 1);
        assert!(table.find("war3map.j", 0x407).is_none());
        assert_eq!(table.locales_for("war3map.j"), vec![0, 0x409]);
    }

    #[test]
    fn test_deleted_slot_keeps_chain_alive() {
        let mut table = HashTable::new(16).unwrap();
        // Two entries colliding on the same chain: same path, two locales
        let first = insert(&mut table, "colliding.txt", 0, 0);
        let second = insert(&mut table, "colliding.txt", 0x409, 1);
        assert_eq!(second, (first + 1) & 15);

        // Deleting the first must not hide the second
        table.get_mut(first).unwrap().block_index = HashEntry::DELETED;
        assert!(table.find("colliding.txt", 0).is_none());
        assert_eq!(table.find("colliding.txt", 0x409).unwrap().0, second);
        assert_eq!(table.locales_for("colliding.txt"), vec![0x409]);

        // And the deleted slot is the first candidate for reinsertion
        assert_eq!(table.find_free_slot("colliding.txt").unwrap(), first);
    }

    #[test]
    fn test_full_table_rejects_insert() {
        let mut table = HashTable::new(16).unwrap();
        for i in 0..16 {
            insert(&mut table, &format!("file{i:02}.dat"), 0, i);
        }
        assert!(matches!(
            table.find_free_slot("one-more.dat"),
            Err(Error::HashTableFull)
        ));
    }

    #[test]
    fn test_encrypted_round_trip() {
        let mut table = HashTable::new(16).unwrap();
        insert(&mut table, "a\\b\\c.txt", 0, 3);
        insert(&mut table, "(listfile)", 0, 4);

        let bytes = table.to_encrypted_bytes();
        assert_eq!(bytes.len(), 16 * HashTable::ENTRY_SIZE);

        let parsed = HashTable::read(&mut Cursor::new(&bytes), 0, 16).unwrap();
        assert_eq!(parsed.entries(), table.entries());
        assert_eq!(parsed.find("A\\B\\C.TXT", 0).unwrap().1.block_index, 3);
    }
}
