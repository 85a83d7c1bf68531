//! Archive state and directory operations
//!
//! [`Archive`] is the single-writer handle over one container. It owns the
//! in-memory tables, the filename table, the deferred operation log and the
//! per-slot caches; [`crate::File`] handles index into those tables and pin
//! their hash slot through a refcount until dropped.
//!
//! Mutations are deferred: adds and deletes update the in-memory directory
//! immediately but touch the container only when [`Archive::save`] runs.

use crate::compression;
use crate::crypto::{self, hash_type, signature};
use crate::datasource::DataSourceProxy;
use crate::delegate::ArchiveDelegate;
use crate::error::{Error, Result};
use crate::file::File;
use crate::header::{
    self, FormatVersion, MpqHeader, ARCHIVE_ALIGNMENT, DEFAULT_HEADER_SEARCH_LIMIT,
    MIN_TABLE_LENGTH,
};
use crate::ops::{FileContext, OperationKind, OperationLog};
use crate::path::{mpq_basename, validate_mpq_path};
use crate::special_files::{self, Attributes};
use crate::tables::{BlockEntry, BlockTable, ExtBlockOffsetTable, HashEntry, HashTable};
use bytes::Bytes;
use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Options for opening or creating archives
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Starting offset hint for the header scan
    pub offset: u64,
    /// Format version for new archives
    pub version: FormatVersion,
    /// Capacity for new archives; rounded up to a power of two and clamped
    pub maximum_file_count: u32,
    /// Disable the header-size sanity check (copy-protected archives)
    pub ignore_header_size: bool,
    /// Cap on the header scan window
    pub header_search_limit: u64,
    /// Open without write access
    pub read_only: bool,
}

impl OpenOptions {
    /// Default options: version 0, capacity 1024, scan from offset 0
    pub fn new() -> Self {
        Self {
            offset: 0,
            version: FormatVersion::V0,
            maximum_file_count: 1024,
            ignore_header_size: false,
            header_search_limit: DEFAULT_HEADER_SEARCH_LIMIT,
            read_only: false,
        }
    }

    /// Set the header scan start offset
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Set the format version for new archives
    pub fn version(mut self, version: FormatVersion) -> Self {
        self.version = version;
        self
    }

    /// Set the capacity for new archives
    pub fn maximum_file_count(mut self, count: u32) -> Self {
        self.maximum_file_count = count;
        self
    }

    /// Skip the header-size sanity check
    pub fn ignore_header_size(mut self, ignore: bool) -> Self {
        self.ignore_header_size = ignore;
        self
    }

    /// Bound the header scan window
    pub fn header_search_limit(mut self, limit: u64) -> Self {
        self.header_search_limit = limit;
        self
    }

    /// Open read-only
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Open an existing archive with these options
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Archive> {
        Archive::open_with(path, self)
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-file add parameters
#[derive(Debug, Clone)]
pub struct AddFileOptions {
    /// Starting flag bitmask; `VALID` is forced on
    pub flags: u32,
    /// Codec mask; `None` uses the archive's default compressor
    pub compressor: Option<u8>,
    /// Codec-specific quality level; negative selects the codec default
    pub quality: i32,
    /// Locale attached to the hash entry
    pub locale: u16,
    /// Allow replacing an existing (path, locale) entry
    pub overwrite: bool,
}

impl AddFileOptions {
    /// Plain compressed add under the neutral locale
    pub fn new() -> Self {
        Self {
            flags: BlockEntry::FLAG_COMPRESSED,
            compressor: None,
            quality: -1,
            locale: 0,
            overwrite: false,
        }
    }

    /// Set the starting flags
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Set the codec mask
    pub fn compressor(mut self, mask: u8) -> Self {
        self.compressor = Some(mask);
        self
    }

    /// Set the codec quality
    pub fn quality(mut self, quality: i32) -> Self {
        self.quality = quality;
        self
    }

    /// Set the locale
    pub fn locale(mut self, locale: u16) -> Self {
        self.locale = locale;
        self
    }

    /// Allow replacing an existing entry
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

impl Default for AddFileOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of one directory entry
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Archive path, when known
    pub filename: Option<String>,
    /// Hash slot
    pub hash_position: u32,
    /// Block slot
    pub block_index: u32,
    /// Locale of the hash entry
    pub locale: u16,
    /// Platform field, preserved but uninterpreted
    pub platform: u16,
    /// First verification hash
    pub hash_a: u32,
    /// Second verification hash
    pub hash_b: u32,
    /// Block flags
    pub flags: u32,
    /// Uncompressed size
    pub file_size: u32,
    /// Size occupied in the archive
    pub archived_size: u32,
    /// Absolute offset within the archive
    pub file_pos: u64,
    /// Whether the file can be opened without knowing its path
    ///
    /// False only for encrypted files whose key cannot be recovered from
    /// the sector table structure.
    pub can_open_without_filename: bool,
}

/// Summary counters for the whole archive
#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    /// Size of the archive region in bytes
    pub archive_size: u64,
    /// Offset of the archive within its container
    pub archive_offset: u64,
    /// Format version
    pub version: FormatVersion,
    /// Full sector size in bytes
    pub sector_size: usize,
    /// Occupied plus deleted directory slots
    pub file_count: u32,
    /// Occupied slots referencing valid blocks
    pub valid_file_count: u32,
    /// Directory capacity
    pub maximum_file_count: u32,
}

pub(crate) struct ArchiveState {
    pub(crate) file: Option<std::fs::File>,
    pub(crate) path: Option<PathBuf>,
    pub(crate) read_only: bool,
    pub(crate) modified: bool,
    pub(crate) stores_listfile: bool,
    pub(crate) default_compressor: u8,
    pub(crate) archive_offset: u64,
    pub(crate) archive_size: u64,
    pub(crate) header: MpqHeader,
    pub(crate) hash_table: HashTable,
    pub(crate) block_table: BlockTable,
    pub(crate) ext_table: ExtBlockOffsetTable,
    /// Absolute per-block offsets, extended highs merged in
    pub(crate) block_offsets: Vec<u64>,
    /// Known filename per hash slot
    pub(crate) filenames: Vec<Option<String>>,
    /// Memoized info per hash slot
    pub(crate) file_info_cache: Vec<Option<FileInfo>>,
    pub(crate) attributes: Option<Attributes>,
    pub(crate) had_attributes: bool,
    pub(crate) open_file_count: u32,
    /// Open-handle count per hash slot
    pub(crate) slot_open_counts: Vec<u32>,
    pub(crate) operations: OperationLog,
    /// Decrypted sector-offset table per hash slot
    pub(crate) sector_table_cache: Vec<Option<Rc<Vec<u32>>>>,
    /// Resolved encryption key per hash slot
    pub(crate) key_cache: Vec<Option<u32>>,
    pub(crate) delegate: Option<Rc<dyn ArchiveDelegate>>,
    pub(crate) ignore_header_size: bool,
    pub(crate) header_search_limit: u64,
}

impl std::fmt::Debug for ArchiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveState")
            .field("path", &self.path)
            .field("archive_offset", &self.archive_offset)
            .field("archive_size", &self.archive_size)
            .field("version", &self.header.format_version)
            .field("modified", &self.modified)
            .field("open_file_count", &self.open_file_count)
            .field("pending_operations", &self.operations.len())
            .finish()
    }
}

impl ArchiveState {
    /// Absolute offset of a block within the archive
    pub(crate) fn block_offset(&self, block_index: u32) -> u64 {
        self.block_offsets
            .get(block_index as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Full sector size in bytes
    pub(crate) fn full_sector_size(&self) -> usize {
        self.header.sector_size()
    }

    /// Backing file, or `NoArchiveFile` for a never-saved archive
    pub(crate) fn backing_file(&mut self) -> Result<&mut std::fs::File> {
        self.file.as_mut().ok_or(Error::NoArchiveFile)
    }

    /// Resolve a slot's base encryption key, detecting it if necessary
    ///
    /// Returns the key for the file's sectors; the sector-offset table uses
    /// `key - 1`. Fails with `FileIsInvalid` when the file is encrypted,
    /// nameless, and detection finds nothing.
    pub(crate) fn resolve_key(&mut self, hash_position: u32) -> Result<u32> {
        if let Some(key) = self.key_cache[hash_position as usize] {
            return Ok(key);
        }

        let hash_entry = *self
            .hash_table
            .get(hash_position)
            .ok_or(Error::InvalidSectorTableCache)?;
        let block = *self
            .block_table
            .get(hash_entry.block_index)
            .ok_or_else(|| Error::invalid_archive("hash entry references no block"))?;

        if !block.is_encrypted() {
            self.key_cache[hash_position as usize] = Some(0);
            return Ok(0);
        }

        let filename = self.filenames[hash_position as usize].clone();
        let key = match filename {
            Some(name) => {
                let base = crypto::hash_path(mpq_basename(&name), hash_type::FILE_KEY);
                if block.has_adjusted_key() {
                    let offset = self.block_offset(hash_entry.block_index);
                    base.wrapping_add(offset as u32) ^ block.file_size
                } else {
                    base
                }
            }
            None => self.detect_key(hash_entry.block_index, &block)?,
        };

        self.key_cache[hash_position as usize] = Some(key);
        Ok(key)
    }

    /// Brute-force a nameless file's key from its sector-offset table
    ///
    /// The first table word is known plaintext: it equals the byte size of
    /// the offset table itself. Solving the first cipher word for each
    /// possible table byte yields at most 256 candidates; the second word
    /// weeds out false positives.
    fn detect_key(&mut self, block_index: u32, block: &BlockEntry) -> Result<u32> {
        if block.is_one_sector() {
            return Err(Error::FileIsInvalid(
                "encrypted single-sector file with unknown name".into(),
            ));
        }

        let sector_size = self.full_sector_size();
        let sector_count = (block.file_size as usize).div_ceil(sector_size);
        let table_entries = sector_count + 1 + if block.has_sector_crcs() { 1 } else { 0 };
        let expected_first = (table_entries * 4) as u32;

        let offset = self.block_offset(block_index);
        let absolute = self.archive_offset + offset;
        let file = self.backing_file()?;
        file.seek(SeekFrom::Start(absolute))?;
        let mut first_words = [0u8; 8];
        file.read_exact(&mut first_words)?;
        let encrypted0 = u32::from_le_bytes(first_words[0..4].try_into().unwrap());
        let encrypted1 = u32::from_le_bytes(first_words[4..8].try_into().unwrap());

        // encrypted0 = expected_first ^ (k + 0xEEEEEEEE + table[0x400 + (k & 0xFF)])
        let key_plus_seed = encrypted0 ^ expected_first;
        for low_byte in 0..=0xFFu32 {
            let candidate = key_plus_seed
                .wrapping_sub(0xEEEE_EEEE)
                .wrapping_sub(crypto::CRYPT_TABLE[0x400 + low_byte as usize]);
            if candidate & 0xFF != low_byte {
                continue;
            }

            let mut words = [encrypted0, encrypted1];
            crypto::decrypt_block(&mut words, candidate);
            if words[0] == expected_first
                && words[1] >= expected_first
                && words[1] <= expected_first + sector_size as u32
            {
                // candidate is the table key; sectors use key + 1
                return Ok(candidate.wrapping_add(1));
            }
        }

        Err(Error::FileIsInvalid(
            "encryption key could not be detected".into(),
        ))
    }

    /// Load (and cache) a slot's decrypted sector-offset table
    pub(crate) fn sector_table(&mut self, hash_position: u32) -> Result<Rc<Vec<u32>>> {
        if let Some(table) = &self.sector_table_cache[hash_position as usize] {
            return Ok(Rc::clone(table));
        }

        let hash_entry = *self
            .hash_table
            .get(hash_position)
            .ok_or(Error::InvalidSectorTableCache)?;
        let block = *self
            .block_table
            .get(hash_entry.block_index)
            .ok_or_else(|| Error::invalid_archive("hash entry references no block"))?;
        if block.is_one_sector() {
            return Err(Error::invalid_operation(
                "single-sector files have no sector table",
            ));
        }

        let sector_size = self.full_sector_size();
        let sector_count = (block.file_size as usize).div_ceil(sector_size);
        let entry_count = sector_count + 1 + if block.has_sector_crcs() { 1 } else { 0 };

        let key = self.resolve_key(hash_position)?;
        let offset = self.archive_offset + self.block_offset(hash_entry.block_index);

        let file = self.backing_file()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut raw = vec![0u8; entry_count * 4];
        file.read_exact(&mut raw)?;

        if block.is_encrypted() {
            crypto::decrypt_bytes(&mut raw, key.wrapping_sub(1));
        }

        let table: Vec<u32> = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        // Offsets must be non-decreasing and the final entry must equal the
        // archived size. With sector checksums the table carries one extra
        // entry: the second-to-last points at the checksum block.
        for window in table.windows(2) {
            if window[1] < window[0] {
                return Err(Error::FileIsInvalid("sector offsets not monotonic".into()));
            }
        }
        let sentinel = *table.last().unwrap();
        if sentinel != block.archived_size {
            return Err(Error::FileIsInvalid(format!(
                "sector table sentinel {} does not match archived size {}",
                sentinel, block.archived_size
            )));
        }

        let table = Rc::new(table);
        self.sector_table_cache[hash_position as usize] = Some(Rc::clone(&table));
        Ok(table)
    }

    /// Drop every cache derived from a slot's current entries
    pub(crate) fn invalidate_slot(&mut self, hash_position: u32) {
        self.file_info_cache[hash_position as usize] = None;
        self.sector_table_cache[hash_position as usize] = None;
        self.key_cache[hash_position as usize] = None;
    }

    pub(crate) fn build_file_info(&mut self, hash_position: u32) -> Result<FileInfo> {
        let entry = *self
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
        let block = *self
            .block_table
            .get(entry.block_index)
            .ok_or_else(|| Error::invalid_archive("hash entry references no block"))?;

        let filename = self.filenames[hash_position as usize].clone();
        let can_open_without_filename = if !block.is_encrypted() {
            true
        } else if block.is_one_sector() {
            filename.is_some()
        } else {
            // A sector table gives the detector known plaintext
            true
        };

        Ok(FileInfo {
            filename,
            hash_position,
            block_index: entry.block_index,
            locale: entry.locale,
            platform: entry.platform,
            hash_a: entry.hash_a,
            hash_b: entry.hash_b,
            flags: block.flags,
            file_size: block.file_size,
            archived_size: block.archived_size,
            file_pos: self.block_offset(entry.block_index),
            can_open_without_filename,
        })
    }

    /// Record a known filename for a slot, if it matches the slot's hashes
    pub(crate) fn learn_filename(&mut self, path: &str) {
        let hash_a = crypto::hash_path(path, hash_type::NAME_A);
        let hash_b = crypto::hash_path(path, hash_type::NAME_B);
        let mask = self.hash_table.length() - 1;
        let start = crypto::hash_path(path, hash_type::TABLE_OFFSET) & mask;

        let mut index = start;
        loop {
            let entry = *self.hash_table.get(index).unwrap();
            if entry.is_empty() {
                break;
            }
            if entry.is_occupied() && entry.hash_a == hash_a && entry.hash_b == hash_b {
                let slot = index as usize;
                if self.filenames[slot].is_none() {
                    self.filenames[slot] = Some(path.to_string());
                    self.file_info_cache[slot] = None;
                }
            }
            index = (index + 1) & mask;
            if index == start {
                break;
            }
        }
    }

    pub(crate) fn notify_delegate<F: Fn(&dyn ArchiveDelegate)>(&self, notify: F) {
        if let Some(delegate) = &self.delegate {
            notify(delegate.as_ref());
        }
    }

    pub(crate) fn delegate_allows<F: Fn(&dyn ArchiveDelegate) -> bool>(&self, ask: F) -> bool {
        match &self.delegate {
            Some(delegate) => ask(delegate.as_ref()),
            None => true,
        }
    }
}

/// An MPQ archive
///
/// Not thread-safe; all access to one archive must come from a single
/// thread, and handles are deliberately neither `Send` nor `Sync`.
#[derive(Debug)]
pub struct Archive {
    pub(crate) state: Rc<RefCell<ArchiveState>>,
}

impl Archive {
    /// Create a new, empty archive with no backing file yet
    ///
    /// The container is written on the first [`Archive::write_to_file`].
    /// `maximum_file_count` is rounded up to a power of two and clamped to
    /// the version's limits.
    pub fn create(options: &OpenOptions) -> Result<Self> {
        let capacity = options
            .maximum_file_count
            .max(MIN_TABLE_LENGTH)
            .next_power_of_two()
            .min(options.version.max_table_length());

        let header = MpqHeader {
            header_size: options.version.header_size(),
            archive_size: 0,
            format_version: options.version,
            // 8 KiB full sectors
            sector_size_shift: 4,
            hash_table_pos: 0,
            block_table_pos: 0,
            hash_table_size: capacity,
            block_table_size: capacity,
            ext_block_table_pos: (options.version >= FormatVersion::V1).then_some(0),
            hash_table_pos_hi: (options.version >= FormatVersion::V1).then_some(0),
            block_table_pos_hi: (options.version >= FormatVersion::V1).then_some(0),
        };

        let state = ArchiveState {
            file: None,
            path: None,
            read_only: false,
            modified: false,
            stores_listfile: true,
            default_compressor: compression::flags::ZLIB,
            archive_offset: options.offset,
            archive_size: 0,
            header,
            hash_table: HashTable::new(capacity)?,
            block_table: BlockTable::new(capacity),
            ext_table: ExtBlockOffsetTable::new(capacity),
            block_offsets: vec![0; capacity as usize],
            filenames: vec![None; capacity as usize],
            file_info_cache: vec![None; capacity as usize],
            attributes: None,
            had_attributes: false,
            open_file_count: 0,
            slot_open_counts: vec![0; capacity as usize],
            operations: OperationLog::new(),
            sector_table_cache: vec![None; capacity as usize],
            key_cache: vec![None; capacity as usize],
            delegate: None,
            ignore_header_size: false,
            header_search_limit: options.header_search_limit,
        };

        Ok(Archive {
            state: Rc::new(RefCell::new(state)),
        })
    }

    /// Open an existing archive
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, OpenOptions::new())
    }

    /// Open an existing archive with explicit options
    pub fn open_with<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = if options.read_only {
            std::fs::File::open(&path)?
        } else {
            match std::fs::OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => file,
                // Fall back to read-only when the container is not writable
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    std::fs::File::open(&path)?
                }
                Err(e) => return Err(e.into()),
            }
        };
        let writable = !options.read_only
            && file.metadata().map(|m| !m.permissions().readonly()).unwrap_or(false);

        let (archive_offset, header) = header::find_header(
            &mut file,
            options.offset,
            options.header_search_limit,
            options.ignore_header_size,
        )?;
        if archive_offset % ARCHIVE_ALIGNMENT != 0 {
            return Err(Error::InvalidArchiveOffset(archive_offset));
        }

        let file_size = file.metadata()?.len();

        let hash_table = HashTable::read(
            &mut file,
            archive_offset + header.hash_table_pos64(),
            header.hash_table_size,
        )?;
        let block_table = BlockTable::read(
            &mut file,
            archive_offset + header.block_table_pos64(),
            header.block_table_size,
        )?;

        let ext_table = match header.ext_block_table_pos {
            Some(pos) if pos != 0 => ExtBlockOffsetTable::read(
                &mut file,
                archive_offset + pos,
                header.block_table_size,
            )?,
            _ => ExtBlockOffsetTable::new(header.block_table_size),
        };

        // Merge the absolute per-block offsets and compute the archive size
        let mut block_offsets = Vec::with_capacity(block_table.length() as usize);
        let mut data_end = header.format_version.header_size() as u64;
        for (index, entry) in block_table.entries().iter().enumerate() {
            let offset = ext_table.merge(index as u32, entry.file_pos);
            block_offsets.push(offset);
            if entry.is_valid() {
                data_end = data_end.max(offset + entry.archived_size as u64);
            }
        }
        let tables_end = (archive_offset + header.hash_table_pos64()
            + header.hash_table_size as u64 * HashTable::ENTRY_SIZE as u64)
            .max(
                archive_offset
                    + header.block_table_pos64()
                    + header.block_table_size as u64 * BlockTable::ENTRY_SIZE as u64,
            );
        let archive_size = (data_end + archive_offset).max(tables_end) - archive_offset;

        // Directory invariants: every occupied hash entry references a
        // valid block that lies inside the archive
        for entry in hash_table.entries() {
            if !entry.is_occupied() {
                continue;
            }
            let block = block_table.get(entry.block_index).ok_or_else(|| {
                Error::invalid_archive(format!(
                    "hash entry references block {} of {}",
                    entry.block_index,
                    block_table.length()
                ))
            })?;
            if !block.is_valid() {
                return Err(Error::invalid_archive(
                    "hash entry references an invalid block",
                ));
            }
            let offset = block_offsets[entry.block_index as usize];
            if offset + block.archived_size as u64 > archive_size
                || archive_offset + offset + block.archived_size as u64 > file_size
            {
                return Err(Error::invalid_archive("block extends past the archive"));
            }
        }

        let capacity = hash_table.length() as usize;

        let mut state = ArchiveState {
            file: Some(file),
            path: Some(path),
            read_only: !writable,
            modified: false,
            stores_listfile: true,
            default_compressor: compression::flags::ZLIB,
            archive_offset,
            archive_size,
            header,
            hash_table,
            block_table,
            ext_table,
            block_offsets,
            filenames: vec![None; capacity],
            file_info_cache: vec![None; capacity],
            attributes: None,
            had_attributes: false,
            open_file_count: 0,
            slot_open_counts: vec![0; capacity],
            operations: OperationLog::new(),
            sector_table_cache: vec![None; capacity],
            key_cache: vec![None; capacity],
            delegate: None,
            ignore_header_size: options.ignore_header_size,
            header_search_limit: options.header_search_limit,
        };

        // Special files have well-known names
        for name in [
            special_files::LISTFILE_NAME,
            special_files::ATTRIBUTES_NAME,
            special_files::SIGNATURE_NAME,
        ] {
            state.learn_filename(name);
        }
        state.had_attributes = state.hash_table.find(special_files::ATTRIBUTES_NAME, 0).is_some();

        log::debug!(
            "opened archive at offset 0x{:X}, {} hash slots, {} blocks, {} bytes",
            state.archive_offset,
            state.hash_table.length(),
            state.block_table.length(),
            state.archive_size
        );

        let archive = Archive {
            state: Rc::new(RefCell::new(state)),
        };
        archive.load_internal_listfile().ok();
        Ok(archive)
    }

    /// Set or clear the delegate
    pub fn set_delegate(&mut self, delegate: Option<Rc<dyn ArchiveDelegate>>) {
        self.state.borrow_mut().delegate = delegate;
    }

    /// Path of the backing container, if the archive has one
    pub fn path(&self) -> Option<PathBuf> {
        self.state.borrow().path.clone()
    }

    /// Offset of the archive within its container
    pub fn archive_offset(&self) -> u64 {
        self.state.borrow().archive_offset
    }

    /// Format version
    pub fn version(&self) -> FormatVersion {
        self.state.borrow().header.format_version
    }

    /// Full sector size in bytes
    pub fn sector_size(&self) -> usize {
        self.state.borrow().full_sector_size()
    }

    /// Check whether unsaved mutations exist
    pub fn modified(&self) -> bool {
        self.state.borrow().modified
    }

    /// Check whether the archive refuses mutation
    pub fn read_only(&self) -> bool {
        self.state.borrow().read_only
    }

    /// Number of open file handles
    pub fn open_file_count(&self) -> u32 {
        self.state.borrow().open_file_count
    }

    /// Number of open handles pinning one hash slot
    pub fn open_file_count_at(&self, hash_position: u32) -> u32 {
        self.state
            .borrow()
            .slot_open_counts
            .get(hash_position as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Occupied plus deleted directory slots
    pub fn file_count(&self) -> u32 {
        self.state.borrow().hash_table.used_count()
    }

    /// Occupied slots referencing valid blocks
    pub fn valid_file_count(&self) -> u32 {
        self.state.borrow().hash_table.occupied_count()
    }

    /// Directory capacity
    pub fn maximum_file_count(&self) -> u32 {
        self.state.borrow().hash_table.length()
    }

    /// Number of pending deferred operations
    pub fn operation_count(&self) -> u32 {
        self.state.borrow().operations.len() as u32
    }

    /// Summary counters
    pub fn archive_info(&self) -> ArchiveInfo {
        let state = self.state.borrow();
        ArchiveInfo {
            archive_size: state.archive_size,
            archive_offset: state.archive_offset,
            version: state.header.format_version,
            sector_size: state.full_sector_size(),
            file_count: state.hash_table.used_count(),
            valid_file_count: state.hash_table.occupied_count(),
            maximum_file_count: state.hash_table.length(),
        }
    }

    /// Check whether the listfile is regenerated at save time
    pub fn stores_listfile(&self) -> bool {
        self.state.borrow().stores_listfile
    }

    /// Control listfile regeneration at save time
    pub fn set_stores_listfile(&mut self, store: bool) {
        self.state.borrow_mut().stores_listfile = store;
    }

    /// Default codec mask for adds that do not specify one
    pub fn default_compressor(&self) -> u8 {
        self.state.borrow().default_compressor
    }

    /// Set the default codec mask
    ///
    /// Lossy codecs cannot be the default; they destroy non-audio data.
    pub fn set_default_compressor(&mut self, mask: u8) -> Result<()> {
        compression::validate_mask(mask)?;
        if !compression::is_lossless(mask) {
            return Err(Error::invalid_operation(
                "a lossy codec cannot be the default compressor",
            ));
        }
        self.state.borrow_mut().default_compressor = mask;
        Ok(())
    }

    /// Check for a `(path, locale)` entry
    pub fn file_exists(&self, path: &str, locale: u16) -> Result<bool> {
        let path = validate_mpq_path(path)?;
        Ok(self.state.borrow().hash_table.find(&path, locale).is_some())
    }

    /// Every locale under which `path` exists
    pub fn locales_for_file(&self, path: &str) -> Result<Vec<u16>> {
        let path = validate_mpq_path(path)?;
        Ok(self.state.borrow().hash_table.locales_for(&path))
    }

    /// Directory snapshot for `(path, locale)`
    pub fn file_info(&self, path: &str, locale: u16) -> Result<FileInfo> {
        let path = validate_mpq_path(path)?;
        let mut state = self.state.borrow_mut();
        let (position, _) = state
            .hash_table
            .find(&path, locale)
            .ok_or_else(|| Error::FileNotFound(path.clone()))?;
        state.learn_filename(&path);
        drop(state);
        self.file_info_at(position)
    }

    /// Directory snapshot for a hash slot
    pub fn file_info_at(&self, hash_position: u32) -> Result<FileInfo> {
        let mut state = self.state.borrow_mut();
        if let Some(Some(info)) = state.file_info_cache.get(hash_position as usize) {
            return Ok(info.clone());
        }
        let info = state.build_file_info(hash_position)?;
        state.file_info_cache[hash_position as usize] = Some(info.clone());
        Ok(info)
    }

    /// Snapshots of every occupied directory slot, in slot order
    pub fn file_infos(&self) -> Vec<FileInfo> {
        let length = self.state.borrow().hash_table.length();
        let mut infos = Vec::new();
        for position in 0..length {
            let occupied = self
                .state
                .borrow()
                .hash_table
                .get(position)
                .map(|e| e.is_occupied())
                .unwrap_or(false);
            if occupied {
                if let Ok(info) = self.file_info_at(position) {
                    infos.push(info);
                }
            }
        }
        infos
    }

    /// Known filenames, sorted
    pub fn file_list(&self) -> Vec<String> {
        let state = self.state.borrow();
        let mut names: Vec<String> = state
            .hash_table
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_occupied())
            .filter_map(|(i, _)| state.filenames[i].clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Merge the archive's stored `(listfile)` into the filename table
    pub fn load_internal_listfile(&self) -> Result<()> {
        let has_listfile = self
            .state
            .borrow()
            .hash_table
            .find(special_files::LISTFILE_NAME, 0)
            .is_some();
        if !has_listfile {
            return Ok(());
        }

        let data = self.read_file(special_files::LISTFILE_NAME, 0)?;
        let paths = special_files::parse_listfile(&data)?;
        let mut state = self.state.borrow_mut();
        for path in &paths {
            state.learn_filename(path);
        }
        log::debug!("merged {} listfile entries", paths.len());
        Ok(())
    }

    /// Teach the archive one filename
    pub fn add_to_file_list(&self, path: &str) -> Result<()> {
        let path = validate_mpq_path(path)?;
        self.state.borrow_mut().learn_filename(&path);
        Ok(())
    }

    /// Teach the archive a batch of filenames
    pub fn add_paths_to_file_list<'a>(&self, paths: impl Iterator<Item = &'a str>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        for path in paths {
            if let Ok(path) = validate_mpq_path(path) {
                state.learn_filename(&path);
            }
        }
        Ok(())
    }

    /// Load and parse the `(attributes)` file, if present
    pub fn attributes(&self) -> Result<Option<Attributes>> {
        if let Some(attributes) = &self.state.borrow().attributes {
            return Ok(Some(attributes.clone()));
        }
        let present = self
            .state
            .borrow()
            .hash_table
            .find(special_files::ATTRIBUTES_NAME, 0)
            .is_some();
        if !present {
            return Ok(None);
        }

        let data = self.read_file(special_files::ATTRIBUTES_NAME, 0)?;
        let block_count = self.state.borrow().block_table.length() as usize;
        let attributes = Attributes::parse(&Bytes::from(data), block_count)?;
        self.state.borrow_mut().attributes = Some(attributes.clone());
        Ok(Some(attributes))
    }

    /// Opt the archive into `(attributes)` maintenance
    ///
    /// Archives that already carry an `(attributes)` entry keep it
    /// automatically; this seeds one for archives that do not. The save
    /// pipeline fills CRC32, MD5 and FILETIME entries for realized files.
    pub fn enable_attributes(&mut self) {
        let mut state = self.state.borrow_mut();
        if state.attributes.is_none() {
            let block_count = state.block_table.length() as usize;
            state.attributes = Some(Attributes::new(
                crate::special_files::AttributeFlags::new(
                    crate::special_files::AttributeFlags::CRC32
                        | crate::special_files::AttributeFlags::FILETIME
                        | crate::special_files::AttributeFlags::MD5,
                ),
                block_count,
            ));
        }
    }

    /// Enqueue an add of an in-memory payload
    pub fn add_file_with_data(
        &mut self,
        data: impl Into<Bytes>,
        path: &str,
        options: &AddFileOptions,
    ) -> Result<()> {
        self.add_file_with_proxy(DataSourceProxy::from_data(data.into()), path, options)
    }

    /// Enqueue an add of a file on disk
    pub fn add_file_from_path<P: AsRef<Path>>(
        &mut self,
        source: P,
        path: &str,
        options: &AddFileOptions,
    ) -> Result<()> {
        self.add_file_with_proxy(DataSourceProxy::from_path(source)?, path, options)
    }

    /// Enqueue an add from an explicit payload source
    pub fn add_file_with_proxy(
        &mut self,
        source: DataSourceProxy,
        path: &str,
        options: &AddFileOptions,
    ) -> Result<()> {
        let path = validate_mpq_path(path)?;

        {
            let state = self.state.borrow();
            if state.read_only {
                return Err(Error::ReadOnlyArchive);
            }
            if !state.delegate_allows(|d| d.should_add_file(&path)) {
                return Err(Error::DelegateCancelled);
            }
        }

        // Sanitize the starting flags; VALID is forced, exotic bits dropped
        let mut flags = (options.flags & BlockEntry::FLAGS_MASK) | BlockEntry::FLAG_VALID;
        if flags & BlockEntry::FLAG_COMPRESSED != 0 && flags & BlockEntry::FLAG_IMPLODED != 0 {
            flags &= !BlockEntry::FLAG_IMPLODED;
        }
        if flags & BlockEntry::FLAG_ONE_SECTOR != 0 && flags & BlockEntry::FLAG_SECTOR_CRC != 0 {
            return Err(Error::invalid_operation(
                "single-sector files cannot carry sector checksums",
            ));
        }

        let compressor = if flags & BlockEntry::FLAG_IMPLODED != 0 {
            compression::flags::PKWARE
        } else {
            options
                .compressor
                .unwrap_or(self.state.borrow().default_compressor)
        };
        compression::validate_mask(compressor)?;
        if flags & BlockEntry::FLAG_COMPRESSED == 0
            && flags & BlockEntry::FLAG_IMPLODED == 0
            && options.compressor.is_some()
        {
            return Err(Error::InconsistentCompressionFlags);
        }

        // Probe the payload so broken sources fail at add time, and to size
        // the block entry for directory queries before save
        let payload_len = source.realize()?.len();
        if payload_len > u32::MAX as u64 {
            return Err(Error::DataTooLarge(payload_len));
        }

        self.state.borrow().notify_delegate(|d| d.will_add_file(&path));

        let mut state = self.state.borrow_mut();

        // An existing (path, locale) entry is replaced only on request
        if let Some((existing, _)) = state.hash_table.find(&path, options.locale) {
            if !options.overwrite {
                return Err(Error::FileExists(path));
            }
            Self::enqueue_delete(&mut state, existing, &path)?;
        }

        let hash_position = state.hash_table.find_free_slot(&path)?;
        let block_index = state.block_table.find_free_entry()?;

        let saved_hash_entry = *state.hash_table.get(hash_position).unwrap();
        let saved_block_entry = *state.block_table.get(block_index).unwrap();
        let saved_filename = state.filenames[hash_position as usize].clone();

        state.hash_table.set(
            hash_position,
            HashEntry {
                hash_a: crypto::hash_path(&path, hash_type::NAME_A),
                hash_b: crypto::hash_path(&path, hash_type::NAME_B),
                locale: options.locale,
                platform: 0,
                block_index,
            },
        );
        state.block_table.set(
            block_index,
            BlockEntry {
                file_pos: 0,
                archived_size: 0,
                file_size: payload_len as u32,
                flags,
            },
        );
        state.block_offsets[block_index as usize] = 0;
        state.filenames[hash_position as usize] = Some(path.clone());

        let encryption_key = crypto::hash_path(mpq_basename(&path), hash_type::FILE_KEY);
        state.operations.push(
            OperationKind::Add {
                source,
                compressor,
                quality: options.quality,
            },
            FileContext {
                hash_position,
                saved_hash_entry,
                saved_block_entry,
                block_index,
                encryption_key,
                filename: path.clone(),
                saved_filename,
            },
        );

        state.invalidate_slot(hash_position);
        state.modified = true;
        state.notify_delegate(|d| d.did_add_file(&path));

        log::debug!(
            "queued add of '{}' (locale 0x{:04X}) at slot {}, block {}",
            path,
            options.locale,
            hash_position,
            block_index
        );
        Ok(())
    }

    /// Enqueue a delete of `(path, locale)`
    ///
    /// The slot becomes a deleted sentinel immediately; block storage is
    /// reclaimed by the next save. Open handles on the slot stay readable
    /// until they close.
    pub fn delete_file(&mut self, path: &str, locale: u16) -> Result<()> {
        let path = validate_mpq_path(path)?;

        {
            let state = self.state.borrow();
            if state.read_only {
                return Err(Error::ReadOnlyArchive);
            }
            if !state.delegate_allows(|d| d.should_delete_file(&path)) {
                return Err(Error::DelegateCancelled);
            }
        }
        self.state
            .borrow()
            .notify_delegate(|d| d.will_delete_file(&path));

        let mut state = self.state.borrow_mut();
        let (hash_position, _) = state
            .hash_table
            .find(&path, locale)
            .ok_or_else(|| Error::FileNotFound(path.clone()))?;

        Self::enqueue_delete(&mut state, hash_position, &path)?;
        state.modified = true;
        state.notify_delegate(|d| d.did_delete_file(&path));
        Ok(())
    }

    fn enqueue_delete(state: &mut ArchiveState, hash_position: u32, path: &str) -> Result<()> {
        let saved_hash_entry = *state.hash_table.get(hash_position).unwrap();
        let block_index = saved_hash_entry.block_index;
        let saved_block_entry = *state
            .block_table
            .get(block_index)
            .ok_or_else(|| Error::invalid_archive("hash entry references no block"))?;
        let saved_filename = state.filenames[hash_position as usize].clone();

        let mut tombstone = saved_hash_entry;
        tombstone.block_index = HashEntry::DELETED;
        state.hash_table.set(hash_position, tombstone);

        let mut freed = saved_block_entry;
        freed.flags = 0;
        state.block_table.set(block_index, freed);

        state.operations.push(
            OperationKind::Delete,
            FileContext {
                hash_position,
                saved_hash_entry,
                saved_block_entry,
                block_index,
                encryption_key: 0,
                filename: path.to_string(),
                saved_filename,
            },
        );
        state.invalidate_slot(hash_position);

        log::debug!("queued delete of '{path}' at slot {hash_position}");
        Ok(())
    }

    /// Undo the most recent pending operation
    ///
    /// Restores the targeted hash and block entries byte-for-byte and frees
    /// any pending payload.
    pub fn undo_last_operation(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let op = state
            .operations
            .pop()
            .ok_or_else(|| Error::invalid_operation("nothing to undo"))?;

        let context = op.context;
        state
            .hash_table
            .set(context.hash_position, context.saved_hash_entry);
        state
            .block_table
            .set(context.block_index, context.saved_block_entry);
        state.filenames[context.hash_position as usize] = context.saved_filename;
        state.invalidate_slot(context.hash_position);

        log::debug!(
            "undid {} of '{}' at slot {}",
            if matches!(op.kind, OperationKind::Add { .. }) {
                "add"
            } else {
                "delete"
            },
            context.filename,
            context.hash_position
        );
        Ok(())
    }

    /// Open a file for reading
    pub fn open_file(&self, path: &str, locale: u16) -> Result<File> {
        let path = validate_mpq_path(path)?;
        let hash_position = {
            let mut state = self.state.borrow_mut();
            let (position, _) = state
                .hash_table
                .find(&path, locale)
                .ok_or_else(|| Error::FileNotFound(path.clone()))?;
            state.learn_filename(&path);
            position
        };
        self.open_file_at(hash_position)
    }

    /// Open the file at a hash slot
    pub fn open_file_at(&self, hash_position: u32) -> Result<File> {
        File::open(Rc::clone(&self.state), hash_position)
    }

    /// Read a whole file in one call
    pub fn read_file(&self, path: &str, locale: u16) -> Result<Vec<u8>> {
        let mut file = self.open_file(path, locale)?;
        file.read_to_end()
    }

    /// Check for a `(signature)` entry
    pub fn has_weak_signature(&self) -> bool {
        self.state
            .borrow()
            .hash_table
            .find(special_files::SIGNATURE_NAME, 0)
            .is_some()
    }

    /// MD5 of the container with the signature bytes zeroed
    pub fn compute_weak_signature_digest(&self) -> Result<[u8; 16]> {
        let info = self.file_info(special_files::SIGNATURE_NAME, 0)?;
        let mut state = self.state.borrow_mut();
        let archive_offset = state.archive_offset;
        let archive_end = archive_offset + state.archive_size;
        let sig_begin = archive_offset + info.file_pos;
        let sig_end = sig_begin + info.archived_size as u64;

        let file = state.backing_file()?;
        signature::weak_signature_digest(
            file,
            archive_offset,
            archive_end,
            Some((sig_begin, sig_end)),
        )
    }

    /// Verify the weak signature against Blizzard's published key
    ///
    /// `Ok(false)` means a signature exists but does not match;
    /// `Err(NoSignature)` means none exists.
    pub fn verify_weak_signature(&self) -> Result<bool> {
        if !self.has_weak_signature() {
            return Err(Error::NoSignature);
        }
        let payload = self.read_file(special_files::SIGNATURE_NAME, 0)?;
        let sig = signature::parse_weak_signature(&payload)?;
        let digest = self.compute_weak_signature_digest()?;
        let key = signature::public_keys::weak_public_key()?;
        signature::verify_weak_signature(&key, &sig, &digest)
    }

    /// Check for a strong signature trailer after the archive body
    pub fn has_strong_signature(&self) -> bool {
        self.read_strong_signature().map(|s| s.is_some()).unwrap_or(false)
    }

    fn read_strong_signature(&self) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.borrow_mut();
        let trailer_offset = state.archive_offset + state.archive_size;
        let file = state.backing_file()?;
        let file_size = file.metadata()?.len();
        if trailer_offset + signature::STRONG_SIGNATURE_TRAILER_SIZE as u64 > file_size {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(trailer_offset))?;
        let mut trailer = vec![0u8; signature::STRONG_SIGNATURE_TRAILER_SIZE];
        file.read_exact(&mut trailer)?;
        if trailer[0..4] != signature::STRONG_SIGNATURE_MAGIC {
            return Ok(None);
        }
        Ok(Some(signature::parse_strong_signature(&trailer)?))
    }

    /// Verify the strong signature against Blizzard's published key
    pub fn verify_strong_signature(&self) -> Result<bool> {
        self.verify_strong_signature_with_tail(b"")
    }

    /// Verify the strong signature with a digest tail
    ///
    /// Some producers sign more than the archive extent: Warcraft 3 maps
    /// append the lowercased map name, the WoW Mac patch a magic word.
    pub fn verify_strong_signature_with_tail(&self, tail: &[u8]) -> Result<bool> {
        let sig = self.read_strong_signature()?.ok_or(Error::NoSignature)?;

        let digest = {
            let mut state = self.state.borrow_mut();
            let start = state.archive_offset;
            let size = state.archive_size;
            let file = state.backing_file()?;
            signature::strong_signature_digest(file, start, size, tail)?
        };

        let key = signature::public_keys::strong_public_key()?;
        signature::verify_strong_signature(&key, &sig, &digest)
    }

    /// Save in place over the current backing file, atomically
    pub fn save(&mut self) -> Result<()> {
        let path = self
            .state
            .borrow()
            .path
            .clone()
            .ok_or(Error::NoArchiveFile)?;
        self.write_to_file(path, true)
    }

    /// Save to `path`, realizing every pending operation
    ///
    /// The archive is compacted: live blocks are copied, pending adds are
    /// sectorized, compressed and encrypted, the listfile and attributes
    /// entries are regenerated, and the rebuilt tables and header land
    /// last. With `atomically` and a target equal to the current path, the
    /// rewrite goes through a sibling temporary file that replaces the
    /// original only on success; on failure the original is left intact.
    pub fn write_to_file<P: AsRef<Path>>(&mut self, path: P, atomically: bool) -> Result<()> {
        crate::save::save_archive(self, path.as_ref(), atomically)
    }
}
