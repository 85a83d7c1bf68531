//! File reader handles
//!
//! A [`File`] is a cursor over one directory slot. Opening resolves the
//! directory entries, derives (or detects) the encryption key, loads and
//! validates the sector-offset table, and pins the slot: the archive refuses
//! to save while any handle is open, and a deleted slot's storage survives
//! until its handles close.
//!
//! The handle snapshots its block entry, key and sector table at open time.
//! A later delete turns the slot into a tombstone, but this handle keeps
//! reading the pinned storage until it is dropped.
//!
//! Reads are sector-aligned internally. Handles share the archive's backing
//! descriptor, so reads are not reentrant across handles.

use crate::archive::ArchiveState;
use crate::compression;
use crate::crypto;
use crate::error::{Error, Result};
use crate::tables::BlockEntry;
use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

/// Seek origin for [`File::seek`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// From the beginning of the file, toward the end
    Start,
    /// From the current cursor, clamped at the end of file
    Current,
    /// Backwards from the end of file, clamped at the beginning
    End,
}

/// An open file within an archive
///
/// The cursor advances with every read; short reads happen only at end of
/// file. Dropping the handle releases its pin on the slot.
#[derive(Debug)]
pub struct File {
    state: Rc<RefCell<ArchiveState>>,
    hash_position: u32,
    filename: Option<String>,
    /// Block entry as of open time
    block: BlockEntry,
    /// Absolute offset of the block within the archive, as of open time
    block_offset: u64,
    /// Resolved base encryption key (0 for plain files)
    key: u32,
    /// Decrypted sector-offset table; absent for single-sector files
    sector_table: Option<Rc<Vec<u32>>>,
    /// Adler-32 block, loaded on first checksummed read
    sector_crcs: Option<Vec<u32>>,
    position: u32,
    at_eof: bool,
    /// Decoded payload of a single-sector file, filled on first read
    one_sector_data: Option<Vec<u8>>,
}

impl File {
    pub(crate) fn open(state: Rc<RefCell<ArchiveState>>, hash_position: u32) -> Result<Self> {
        let (block, block_offset, key, sector_table, filename) = {
            let mut guard = state.borrow_mut();

            let entry = *guard
                .hash_table
                .get(hash_position)
                .ok_or_else(|| Error::OutOfBounds("hash position out of range".into()))?;
            if entry.is_empty() {
                return Err(Error::FileNotFound(format!(
                    "hash position {hash_position}"
                )));
            }
            if entry.is_deleted() {
                return Err(Error::FileIsDeleted(format!(
                    "hash position {hash_position}"
                )));
            }

            // A pending add has no bytes in the container yet
            if guard
                .operations
                .latest_for_slot(hash_position)
                .map(|op| op.is_add())
                .unwrap_or(false)
            {
                return Err(Error::FileIsInvalid(
                    "file data is pending and not saved yet".into(),
                ));
            }

            let block = *guard
                .block_table
                .get(entry.block_index)
                .ok_or_else(|| Error::invalid_archive("hash entry references no block"))?;
            if !block.is_valid() {
                return Err(Error::FileIsInvalid("block entry is not valid".into()));
            }

            // Resolve the key now so an undetectable key fails the open,
            // and validate the sector table up front
            let key = guard.resolve_key(hash_position)?;
            let sector_table = if block.is_one_sector() {
                None
            } else {
                Some(guard.sector_table(hash_position)?)
            };

            let block_offset = guard.block_offset(entry.block_index);
            let filename = guard.filenames[hash_position as usize].clone();

            guard.open_file_count += 1;
            guard.slot_open_counts[hash_position as usize] += 1;

            (block, block_offset, key, sector_table, filename)
        };

        Ok(File {
            state,
            hash_position,
            filename,
            block,
            block_offset,
            key,
            sector_table,
            sector_crcs: None,
            position: 0,
            at_eof: false,
            one_sector_data: None,
        })
    }

    /// Archive path of the file, when known
    pub fn name(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Uncompressed length in bytes
    pub fn length(&self) -> u32 {
        self.block.file_size
    }

    /// Current cursor position
    pub fn offset_in_file(&self) -> u32 {
        self.position
    }

    /// Check whether a read has reached or passed the end of file
    pub fn eof(&self) -> bool {
        self.at_eof
    }

    /// Hash slot this handle pins
    pub fn hash_position(&self) -> u32 {
        self.hash_position
    }

    /// Move the cursor
    ///
    /// `Current` clamps at the end of file, `End` seeks backwards and clamps
    /// at the beginning. Returns the new position.
    pub fn seek(&mut self, offset: u32, mode: SeekMode) -> Result<u32> {
        let size = self.block.file_size;
        let target = match mode {
            SeekMode::Start => {
                if offset > size {
                    return Err(Error::OutOfBounds(format!(
                        "seek to {offset} past end of file {size}"
                    )));
                }
                offset
            }
            SeekMode::Current => self.position.saturating_add(offset).min(size),
            SeekMode::End => size.saturating_sub(offset),
        };

        self.position = target;
        self.at_eof = target >= size;
        Ok(target)
    }

    /// Read into `buffer` from the cursor, advancing it
    ///
    /// Returns the number of bytes copied; less than requested only at the
    /// end of file.
    pub fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let size = self.block.file_size;
        if self.position >= size || buffer.is_empty() {
            self.at_eof = true;
            return Ok(0);
        }

        let want = buffer.len().min((size - self.position) as usize);
        let start = self.position as usize;

        let copied = if self.block.is_one_sector() {
            self.read_one_sector(start, &mut buffer[..want])?
        } else {
            self.read_sectors(start, &mut buffer[..want])?
        };

        self.position += copied as u32;
        if self.position >= size {
            self.at_eof = true;
        }
        Ok(copied)
    }

    /// Read from the cursor to the end of file
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let size = self.block.file_size;
        let remaining = (size - self.position.min(size)) as usize;
        let mut data = vec![0u8; remaining];
        let copied = self.read(&mut data)?;
        data.truncate(copied);
        Ok(data)
    }

    /// Read a whole absolute range of the stored block
    fn read_stored(&self, relative: u64, length: usize) -> Result<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        let absolute = state.archive_offset + self.block_offset + relative;
        let file = state.backing_file()?;
        file.seek(SeekFrom::Start(absolute))?;
        let mut raw = vec![0u8; length];
        file.read_exact(&mut raw)?;
        Ok(raw)
    }

    fn read_one_sector(&mut self, start: usize, buffer: &mut [u8]) -> Result<usize> {
        if self.one_sector_data.is_none() {
            let mut raw = self.read_stored(0, self.block.archived_size as usize)?;
            if self.block.is_encrypted() {
                crypto::decrypt_bytes(&mut raw, self.key);
            }

            let expected = self.block.file_size as usize;
            let decoded = decode_stored_sector(&raw, &self.block, expected)?;
            if decoded.len() < expected {
                return Err(Error::decompression(format!(
                    "single-sector payload decoded to {} of {expected} bytes",
                    decoded.len()
                )));
            }
            self.one_sector_data = Some(decoded);
        }

        let data = self.one_sector_data.as_ref().unwrap();
        let count = buffer.len().min(data.len().saturating_sub(start));
        buffer[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    fn read_sectors(&mut self, start: usize, buffer: &mut [u8]) -> Result<usize> {
        let sector_size = self.state.borrow().full_sector_size();
        let table = Rc::clone(self.sector_table.as_ref().ok_or(Error::InvalidSectorTableCache)?);

        let file_size = self.block.file_size as usize;
        let sector_count = file_size.div_ceil(sector_size);

        if self.block.has_sector_crcs() && self.sector_crcs.is_none() {
            self.sector_crcs = Some(self.load_sector_crcs(&table, sector_count)?);
        }

        let first_sector = start / sector_size;
        let last_sector = (start + buffer.len() - 1) / sector_size;

        let mut copied = 0usize;
        for sector_index in first_sector..=last_sector.min(sector_count - 1) {
            let sector_begin = table[sector_index] as u64;
            let stored_len = (table[sector_index + 1] - table[sector_index]) as usize;
            let expected = sector_size.min(file_size - sector_index * sector_size);

            let mut raw = self.read_stored(sector_begin, stored_len)?;
            if self.block.is_encrypted() {
                crypto::decrypt_bytes(&mut raw, self.key.wrapping_add(sector_index as u32));
            }

            let decoded = decode_stored_sector(&raw, &self.block, expected)?;
            if decoded.len() != expected {
                return Err(Error::decompression(format!(
                    "sector {sector_index} decoded to {} of {expected} bytes",
                    decoded.len()
                )));
            }

            if let Some(crcs) = &self.sector_crcs {
                let computed = adler2::adler32_slice(&decoded);
                let expected_crc = crcs[sector_index];
                // An all-zero stored checksum means the producer skipped it
                if expected_crc != 0 && computed != expected_crc {
                    return Err(Error::InvalidSectorChecksum {
                        sector: sector_index as u32,
                        expected: expected_crc,
                        computed,
                    });
                }
            }

            // Copy the window of this sector that the caller asked for
            let sector_file_start = sector_index * sector_size;
            let from = start.max(sector_file_start) - sector_file_start;
            let to = (start + buffer.len()).min(sector_file_start + expected) - sector_file_start;
            let out_from = start.max(sector_file_start) - start;
            buffer[out_from..out_from + (to - from)].copy_from_slice(&decoded[from..to]);
            copied += to - from;
        }

        Ok(copied)
    }

    /// Load the Adler-32 block referenced by the extra offset entry
    ///
    /// The checksum block is stored like a sector at index `sector_count`:
    /// encrypted under `key + sector_count`, never compressed.
    fn load_sector_crcs(&self, table: &[u32], sector_count: usize) -> Result<Vec<u32>> {
        if table.len() != sector_count + 2 {
            return Err(Error::InvalidSectorChecksumData);
        }
        let crc_begin = table[sector_count] as u64;
        let crc_end = table[sector_count + 1] as u64;
        if crc_end - crc_begin != sector_count as u64 * 4 {
            return Err(Error::InvalidSectorChecksumData);
        }

        let mut raw = self.read_stored(crc_begin, (crc_end - crc_begin) as usize)?;
        if self.block.is_encrypted() {
            crypto::decrypt_bytes(&mut raw, self.key.wrapping_add(sector_count as u32));
        }

        Ok(raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Decode one stored sector according to the block's storage flags
fn decode_stored_sector(raw: &[u8], block: &BlockEntry, expected: usize) -> Result<Vec<u8>> {
    if block.is_imploded() {
        // Imploded storage carries no codec mask byte
        if raw.len() >= expected {
            return Ok(raw.to_vec());
        }
        return compression::decompress(raw, compression::flags::PKWARE, expected);
    }
    if block.flags & BlockEntry::FLAG_COMPRESSED != 0 {
        return compression::decompress_sector(raw, expected);
    }
    Ok(raw.to_vec())
}

impl Drop for File {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.open_file_count = state.open_file_count.saturating_sub(1);
        let slot = &mut state.slot_open_counts[self.hash_position as usize];
        *slot = slot.saturating_sub(1);
    }
}
