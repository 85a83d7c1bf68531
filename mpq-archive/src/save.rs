//! The save pipeline
//!
//! Saving compacts the archive: live blocks are copied to the output at a
//! rolling write cursor, deferred adds are realized (sectorize, compress,
//! encrypt), the listfile and attributes entries are regenerated, the
//! directory tables are rebuilt and encrypted, and the header lands last.
//! An atomic same-path save goes through a sibling temporary file seeded
//! from the current container and replaces the original only on success.

use crate::archive::{Archive, ArchiveState};
use crate::compression;
use crate::crypto::{self, hash_type};
use crate::error::{Error, Result};
use crate::header::FormatVersion;
use crate::ops::OperationKind;
use crate::special_files::{self, AttributeFlags, Attributes};
use crate::tables::{BlockEntry, HashEntry};
use md5::{Digest, Md5};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// How the output relates to the current backing file
enum SaveTarget {
    /// Sibling temp file that replaces the original on success
    AtomicReplace { temp: NamedTempFile, path: PathBuf },
    /// Direct rewrite of the current backing file
    InPlace,
    /// Fresh output at a different path; the original stays untouched
    NewFile { temp: NamedTempFile, path: PathBuf },
}

pub(crate) fn save_archive(archive: &mut Archive, target: &Path, atomically: bool) -> Result<()> {
    // Pre-flight gates
    {
        let state = archive.state.borrow();
        if state.open_file_count > 0 {
            return Err(Error::FileIsOpen(state.open_file_count));
        }
        if state.read_only {
            return Err(Error::ReadOnlyArchive);
        }
        if !state.delegate_allows(|d| d.should_save()) {
            return Err(Error::DelegateCancelled);
        }
        for op in state.operations.iter() {
            if op.is_add() {
                let block = state.block_table.get(op.context.block_index);
                if let Some(block) = block {
                    if block.is_one_sector() && block.has_sector_crcs() {
                        return Err(Error::OperationNotSupported(
                            "single-sector files with sector checksums",
                        ));
                    }
                }
            }
        }
        state.notify_delegate(|d| d.will_save());
    }

    let mut guard = archive.state.borrow_mut();
    let state = &mut *guard;

    let same_path = state
        .path
        .as_ref()
        .map(|p| paths_equal(p, target))
        .unwrap_or(false);

    let mut save_target = if same_path && !atomically {
        SaveTarget::InPlace
    } else {
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(parent)?;
        // Seed the output with the existing container so bytes outside the
        // archive region (embedding prefix) survive the rewrite
        if let Some(file) = state.file.as_mut() {
            file.seek(SeekFrom::Start(0))?;
            std::io::copy(file, temp.as_file_mut())?;
        } else if state.archive_offset > 0 {
            temp.as_file_mut()
                .set_len(state.archive_offset)
                .map_err(Error::Io)?;
        }
        if same_path {
            SaveTarget::AtomicReplace {
                temp,
                path: target.to_path_buf(),
            }
        } else {
            SaveTarget::NewFile {
                temp,
                path: target.to_path_buf(),
            }
        }
    };

    // The rewrite mutates tables and offsets as blocks land; snapshot them
    // so a failed save leaves the in-memory state matching the untouched
    // original container
    let snapshot = StateSnapshot::capture(state);

    let result = match &mut save_target {
        SaveTarget::InPlace => rewrite_in_place(state),
        SaveTarget::AtomicReplace { temp, .. } | SaveTarget::NewFile { temp, .. } => {
            rewrite_into(state, temp.as_file_mut())
        }
    };

    let outcome = match result {
        Ok(()) => finish(state, save_target),
        Err(e) => Err(e),
    };
    match outcome {
        Ok(()) => {
            state.operations.clear();
            state.modified = false;
            for slot in 0..state.hash_table.length() {
                state.invalidate_slot(slot);
            }
            state.notify_delegate(|d| d.did_save());
            Ok(())
        }
        Err(e) => {
            snapshot.restore(state);
            Err(e)
        }
    }
}

/// In-memory directory state saved across a rewrite attempt
struct StateSnapshot {
    header: crate::header::MpqHeader,
    hash_table: crate::tables::HashTable,
    block_table: crate::tables::BlockTable,
    ext_table: crate::tables::ExtBlockOffsetTable,
    block_offsets: Vec<u64>,
    filenames: Vec<Option<String>>,
    attributes: Option<Attributes>,
    archive_size: u64,
}

impl StateSnapshot {
    fn capture(state: &ArchiveState) -> Self {
        Self {
            header: state.header.clone(),
            hash_table: state.hash_table.clone(),
            block_table: state.block_table.clone(),
            ext_table: state.ext_table.clone(),
            block_offsets: state.block_offsets.clone(),
            filenames: state.filenames.clone(),
            attributes: state.attributes.clone(),
            archive_size: state.archive_size,
        }
    }

    fn restore(self, state: &mut ArchiveState) {
        state.header = self.header;
        state.hash_table = self.hash_table;
        state.block_table = self.block_table;
        state.ext_table = self.ext_table;
        state.block_offsets = self.block_offsets;
        state.filenames = self.filenames;
        state.attributes = self.attributes;
        state.archive_size = self.archive_size;
        for slot in 0..state.hash_table.length() {
            state.invalidate_slot(slot);
        }
    }
}

fn paths_equal(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn finish(state: &mut ArchiveState, save_target: SaveTarget) -> Result<()> {
    match save_target {
        SaveTarget::InPlace => {
            let end = state.archive_offset + state.archive_size;
            let file = state.backing_file()?;
            file.set_len(end)?;
            file.sync_all()?;
            Ok(())
        }
        SaveTarget::AtomicReplace { temp, path } | SaveTarget::NewFile { temp, path } => {
            // The temp was seeded with the whole original container; drop
            // whatever the compacted archive no longer covers
            temp.as_file()
                .set_len(state.archive_offset + state.archive_size)?;

            // Release the old descriptor before the rename replaces it
            state.file = None;
            temp.as_file().sync_all()?;
            temp.persist(&path).map_err(|e| Error::Io(e.error))?;

            let file = fs::OpenOptions::new().read(true).write(true).open(&path)?;
            state.file = Some(file);
            state.path = Some(path);
            state.read_only = false;
            Ok(())
        }
    }
}

/// Rewrite through a scratch buffer holding the new archive region
///
/// In-place saves cannot stream block copies: compaction may move a block
/// upward over bytes that are still unread. Building the new region in
/// memory first keeps the on-disk original intact until one final write.
fn rewrite_in_place(state: &mut ArchiveState) -> Result<()> {
    let mut region = std::io::Cursor::new(Vec::new());
    rewrite_into(state, &mut region)?;

    let archive_offset = state.archive_offset;
    let bytes = region.into_inner();
    let file = state.backing_file()?;
    file.seek(SeekFrom::Start(archive_offset))?;
    file.write_all(&bytes[archive_offset as usize..])?;
    Ok(())
}

/// Write the complete new archive region into `out`
///
/// `out` must already contain (or be positioned to accept) the container
/// prefix below `archive_offset`. All offsets written are relative to the
/// archive; `state` tables are updated in place as blocks land.
fn rewrite_into<W: Write + Seek>(state: &mut ArchiveState, out: &mut W) -> Result<()> {
    let archive_offset = state.archive_offset;
    let version = state.header.format_version;
    let sector_size = state.full_sector_size();

    // The write cursor, relative to the archive start
    let mut cursor = state.header.format_version.header_size() as u64;

    // Copy live blocks first, in hash-slot order. Slots whose latest
    // pending operation is an add have no stored bytes yet, and the
    // listfile/attributes entries regenerated below would only leave dead
    // bytes in the output.
    let wants_attributes = state.attributes.is_some() || state.had_attributes;
    let mut copied = std::collections::HashSet::new();
    for slot in 0..state.hash_table.length() {
        let entry = *state.hash_table.get(slot).unwrap();
        if !entry.is_occupied() {
            continue;
        }
        if state
            .operations
            .latest_for_slot(slot)
            .map(|op| op.is_add())
            .unwrap_or(false)
        {
            continue;
        }
        match state.filenames[slot as usize].as_deref() {
            Some(special_files::LISTFILE_NAME) if state.stores_listfile => continue,
            Some(special_files::ATTRIBUTES_NAME) if wants_attributes => continue,
            _ => {}
        }
        if !copied.insert(entry.block_index) {
            continue;
        }

        cursor = copy_block(state, out, slot, entry.block_index, cursor)?;
    }

    // Realize pending adds in submission order. An add is stale when a
    // later delete or overwrite re-targeted its slot.
    let live_add_indices: Vec<usize> = (0..state.operations.len())
        .filter(|&index| {
            let op = state.operations.get(index).unwrap();
            if !op.is_add() {
                return false;
            }
            let slot = op.context.hash_position;
            if state.operations.latest_index_for_slot(slot) != Some(index) {
                return false;
            }
            let entry = state.hash_table.get(slot).unwrap();
            entry.is_occupied() && entry.block_index == op.context.block_index
        })
        .collect();

    let mut realized_blocks = Vec::new();
    for index in live_add_indices {
        let (payload, compressor, quality, base_key, block_index) = {
            let op = state.operations.get(index).unwrap();
            let OperationKind::Add {
                source,
                compressor,
                quality,
            } = &op.kind
            else {
                unreachable!()
            };
            let payload = source.realize()?.read_all()?;
            (
                payload,
                *compressor,
                *quality,
                op.context.encryption_key,
                op.context.block_index,
            )
        };
        if payload.len() as u64 > u32::MAX as u64 {
            return Err(Error::DataTooLarge(payload.len() as u64));
        }

        let mut block = *state.block_table.get(block_index).unwrap();
        block.file_size = payload.len() as u32;

        let key = if block.is_encrypted() {
            if block.has_adjusted_key() {
                base_key.wrapping_add(cursor as u32) ^ block.file_size
            } else {
                base_key
            }
        } else {
            0
        };

        let stored = encode_stored_file(&payload, &block, compressor, quality, key, sector_size)?;
        out.seek(SeekFrom::Start(archive_offset + cursor))?;
        out.write_all(&stored)?;

        block.archived_size = stored.len() as u32;
        set_block_position(state, block_index, cursor, &mut block, version)?;
        state.block_table.set(block_index, block);
        realized_blocks.push((block_index, payload));
        cursor += stored.len() as u64;
    }

    // Regenerate the listfile from the filename table, then the attributes
    // entry for archives that carry one
    if state.stores_listfile {
        let payload = build_listfile_payload(state, wants_attributes);
        cursor = write_special_file(
            state,
            out,
            special_files::LISTFILE_NAME,
            &payload,
            state.default_compressor,
            cursor,
        )?;
    }

    if wants_attributes {
        let payload = build_attributes_payload(state, &realized_blocks)?;
        cursor = write_special_file(
            state,
            out,
            special_files::ATTRIBUTES_NAME,
            &payload,
            0,
            cursor,
        )?;
    }

    // Directory tables, encrypted with their well-known keys
    let hash_table_pos = cursor;
    let hash_bytes = state.hash_table.to_encrypted_bytes();
    out.seek(SeekFrom::Start(archive_offset + cursor))?;
    out.write_all(&hash_bytes)?;
    cursor += hash_bytes.len() as u64;

    let block_table_pos = cursor;
    let block_bytes = state.block_table.to_encrypted_bytes();
    out.write_all(&block_bytes)?;
    cursor += block_bytes.len() as u64;

    let ext_table_pos = if version >= FormatVersion::V1 && state.ext_table.is_needed() {
        let pos = cursor;
        let ext_bytes = state.ext_table.to_bytes();
        out.write_all(&ext_bytes)?;
        cursor += ext_bytes.len() as u64;
        Some(pos)
    } else {
        None
    };

    // Size gate for the version before the header seals it
    let archive_size = cursor;
    if archive_size > version.max_archive_size() {
        return Err(Error::ArchiveSizeOverflow {
            size: archive_size,
            version: version as u16,
        });
    }
    if version == FormatVersion::V0
        && (hash_table_pos > u32::MAX as u64 || block_table_pos > u32::MAX as u64)
    {
        return Err(Error::ArchiveSizeOverflow {
            size: archive_size,
            version: version as u16,
        });
    }

    state.header.archive_size = archive_size.min(u32::MAX as u64) as u32;
    state.header.hash_table_pos = hash_table_pos as u32;
    state.header.block_table_pos = block_table_pos as u32;
    state.header.block_table_size = state.block_table.length();
    if version >= FormatVersion::V1 {
        state.header.hash_table_pos_hi = Some((hash_table_pos >> 32) as u16);
        state.header.block_table_pos_hi = Some((block_table_pos >> 32) as u16);
        state.header.ext_block_table_pos = Some(ext_table_pos.unwrap_or(0));
    }

    out.seek(SeekFrom::Start(archive_offset))?;
    state.header.write(out)?;

    state.archive_size = archive_size;
    log::debug!(
        "rewrote archive: {} bytes, hash table at 0x{:X}, block table at 0x{:X}",
        archive_size,
        hash_table_pos,
        block_table_pos
    );
    Ok(())
}

/// Copy one stored block to the write cursor, re-encrypting when its key
/// depends on the offset it is moving away from
fn copy_block<W: Write + Seek>(
    state: &mut ArchiveState,
    out: &mut W,
    slot: u32,
    block_index: u32,
    cursor: u64,
) -> Result<u64> {
    let block = *state.block_table.get(block_index).unwrap();
    let old_offset = state.block_offset(block_index);
    let archive_offset = state.archive_offset;
    let version = state.header.format_version;

    let mut stored = vec![0u8; block.archived_size as usize];
    {
        let file = state.backing_file()?;
        file.seek(SeekFrom::Start(archive_offset + old_offset))?;
        file.read_exact(&mut stored)?;
    }

    if block.is_encrypted() && block.has_adjusted_key() && old_offset != cursor {
        // The key folds in the block offset; moving the block means peeling
        // the old adjustment off and folding the new one in. The base key
        // cancels out, so even nameless files relocate.
        let old_key = state.resolve_key(slot)?;
        let new_key = (old_key ^ block.file_size)
            .wrapping_sub(old_offset as u32)
            .wrapping_add(cursor as u32)
            ^ block.file_size;
        recrypt_stored_file(&mut stored, &block, old_key, new_key, state.full_sector_size())?;
        state.key_cache[slot as usize] = None;
    }

    out.seek(SeekFrom::Start(archive_offset + cursor))?;
    out.write_all(&stored)?;

    let mut updated = block;
    set_block_position(state, block_index, cursor, &mut updated, version)?;
    state.block_table.set(block_index, updated);

    Ok(cursor + stored.len() as u64)
}

/// Record a block's new position in the table trio
fn set_block_position(
    state: &mut ArchiveState,
    block_index: u32,
    offset: u64,
    block: &mut BlockEntry,
    version: FormatVersion,
) -> Result<()> {
    if version == FormatVersion::V0 && offset > u32::MAX as u64 {
        return Err(Error::ArchiveSizeOverflow {
            size: offset,
            version: version as u16,
        });
    }
    block.file_pos = offset as u32;
    state.ext_table.set(block_index, (offset >> 32) as u16);
    state.block_offsets[block_index as usize] = offset;
    Ok(())
}

/// Swap a stored file's encryption from one key to another in place
fn recrypt_stored_file(
    stored: &mut [u8],
    block: &BlockEntry,
    old_key: u32,
    new_key: u32,
    sector_size: usize,
) -> Result<()> {
    if block.is_one_sector() {
        crypto::decrypt_bytes(stored, old_key);
        crypto::encrypt_bytes(stored, new_key);
        return Ok(());
    }

    let sector_count = (block.file_size as usize).div_ceil(sector_size);
    let entry_count = sector_count + 1 + if block.has_sector_crcs() { 1 } else { 0 };
    let table_bytes = entry_count * 4;
    if stored.len() < table_bytes {
        return Err(Error::FileIsInvalid("stored file shorter than its sector table".into()));
    }

    let (table_region, _) = stored.split_at_mut(table_bytes);
    crypto::decrypt_bytes(table_region, old_key.wrapping_sub(1));
    let offsets: Vec<u32> = table_region
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    crypto::encrypt_bytes(table_region, new_key.wrapping_sub(1));

    // Every region after the table is a sector (the checksum block counts
    // as sector index `sector_count`)
    for index in 0..entry_count - 1 {
        let begin = offsets[index] as usize;
        let end = offsets[index + 1] as usize;
        if begin < table_bytes || end > stored.len() || end < begin {
            return Err(Error::FileIsInvalid("sector offsets out of range".into()));
        }
        let sector = &mut stored[begin..end];
        crypto::decrypt_bytes(sector, old_key.wrapping_add(index as u32));
        crypto::encrypt_bytes(sector, new_key.wrapping_add(index as u32));
    }

    Ok(())
}

/// Serialize a payload into its stored on-disk form
///
/// Multi-sector layout: offset table, sectors, optional checksum block. The
/// offset table is encrypted under `key - 1`, sector `i` under `key + i`,
/// and the checksum block as sector `sector_count`.
fn encode_stored_file(
    payload: &[u8],
    block: &BlockEntry,
    compressor: u8,
    quality: i32,
    key: u32,
    sector_size: usize,
) -> Result<Vec<u8>> {
    if block.is_one_sector() {
        let mut stored = encode_sector(payload, block, compressor, quality, payload.len())?;
        if block.is_encrypted() {
            crypto::encrypt_bytes(&mut stored, key);
        }
        return Ok(stored);
    }

    let sector_count = payload.len().div_ceil(sector_size);
    let with_crcs = block.has_sector_crcs();
    let entry_count = sector_count + 1 + if with_crcs { 1 } else { 0 };
    let table_bytes = entry_count * 4;

    let mut offsets = Vec::with_capacity(entry_count);
    let mut sectors: Vec<Vec<u8>> = Vec::with_capacity(sector_count);
    let mut crcs: Vec<u32> = Vec::with_capacity(if with_crcs { sector_count } else { 0 });

    let mut data_cursor = table_bytes as u32;
    for index in 0..sector_count {
        let begin = index * sector_size;
        let end = ((index + 1) * sector_size).min(payload.len());
        let sector_data = &payload[begin..end];

        if with_crcs {
            crcs.push(adler2::adler32_slice(sector_data));
        }

        let mut stored = encode_sector(sector_data, block, compressor, quality, sector_data.len())?;
        if block.is_encrypted() {
            crypto::encrypt_bytes(&mut stored, key.wrapping_add(index as u32));
        }

        offsets.push(data_cursor);
        data_cursor += stored.len() as u32;
        sectors.push(stored);
    }
    offsets.push(data_cursor);

    let mut crc_block = Vec::new();
    if with_crcs {
        for crc in &crcs {
            crc_block.extend_from_slice(&crc.to_le_bytes());
        }
        if block.is_encrypted() {
            crypto::encrypt_bytes(&mut crc_block, key.wrapping_add(sector_count as u32));
        }
        data_cursor += crc_block.len() as u32;
        offsets.push(data_cursor);
    }

    let mut table_region = Vec::with_capacity(table_bytes);
    for offset in &offsets {
        table_region.extend_from_slice(&offset.to_le_bytes());
    }
    if block.is_encrypted() {
        crypto::encrypt_bytes(&mut table_region, key.wrapping_sub(1));
    }

    let mut stored = Vec::with_capacity(data_cursor as usize);
    stored.extend_from_slice(&table_region);
    for sector in &sectors {
        stored.extend_from_slice(sector);
    }
    stored.extend_from_slice(&crc_block);
    Ok(stored)
}

/// Encode one sector's payload per the block's storage flags
fn encode_sector(
    data: &[u8],
    block: &BlockEntry,
    compressor: u8,
    quality: i32,
    expected: usize,
) -> Result<Vec<u8>> {
    if block.is_imploded() {
        let (imploded, mask) = compression::compress(data, compression::flags::PKWARE, quality)?;
        // Imploded storage has no mask byte; expansion falls back to raw
        if mask == 0 || imploded.len() >= expected {
            return Ok(data.to_vec());
        }
        return Ok(imploded);
    }
    if block.flags & BlockEntry::FLAG_COMPRESSED != 0 {
        return compression::compress_sector(data, compressor, quality);
    }
    Ok(data.to_vec())
}

fn build_listfile_payload(state: &ArchiveState, wants_attributes: bool) -> Vec<u8> {
    let mut names: Vec<&str> = state
        .hash_table
        .entries()
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_occupied())
        .filter_map(|(i, _)| state.filenames[i].as_deref())
        .filter(|name| {
            *name != special_files::LISTFILE_NAME && *name != special_files::ATTRIBUTES_NAME
        })
        .collect();
    names.sort_unstable();
    names.dedup();
    names.push(special_files::LISTFILE_NAME);
    if wants_attributes {
        names.push(special_files::ATTRIBUTES_NAME);
    }
    special_files::generate_listfile(names.into_iter())
}

fn build_attributes_payload(
    state: &mut ArchiveState,
    realized_blocks: &[(u32, Vec<u8>)],
) -> Result<Vec<u8>> {
    let block_count = state.block_table.length() as usize;
    let mut attributes = match state.attributes.take() {
        Some(mut existing) => {
            existing.resize(block_count);
            existing
        }
        None => Attributes::new(
            AttributeFlags::new(AttributeFlags::CRC32 | AttributeFlags::FILETIME | AttributeFlags::MD5),
            block_count,
        ),
    };

    let filetime = unix_now_as_filetime();
    for (block_index, payload) in realized_blocks {
        let entry = &mut attributes.entries[*block_index as usize];
        if attributes.flags.has_crc32() {
            entry.crc32 = Some(crc32fast::hash(payload));
        }
        if attributes.flags.has_md5() {
            let mut hasher = Md5::new();
            hasher.update(payload);
            entry.md5 = Some(hasher.finalize().into());
        }
        if attributes.flags.has_filetime() {
            entry.filetime = Some(filetime);
        }
    }

    let payload = attributes.to_bytes();
    state.attributes = Some(attributes);
    Ok(payload)
}

/// Windows FILETIME (100 ns ticks since 1601) for the present moment
fn unix_now_as_filetime() -> u64 {
    let unix_seconds = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (unix_seconds + 11_644_473_600) * 10_000_000
}

/// Insert or replace a special file entry and write its payload
fn write_special_file<W: Write + Seek>(
    state: &mut ArchiveState,
    out: &mut W,
    name: &str,
    payload: &[u8],
    compressor: u8,
    cursor: u64,
) -> Result<u64> {
    let version = state.header.format_version;
    let sector_size = state.full_sector_size();
    let archive_offset = state.archive_offset;

    // Any stored copy is superseded
    if let Some((slot, entry)) = state
        .hash_table
        .find(name, 0)
        .map(|(slot, entry)| (slot, *entry))
    {
        let mut tombstone = entry;
        tombstone.block_index = HashEntry::DELETED;
        state.hash_table.set(slot, tombstone);
        let mut freed = *state.block_table.get(entry.block_index).unwrap();
        freed.flags = 0;
        state.block_table.set(entry.block_index, freed);
        state.invalidate_slot(slot);
    }

    let slot = state.hash_table.find_free_slot(name)?;
    let block_index = state.block_table.find_free_entry()?;

    let flags = if compressor != 0 {
        BlockEntry::FLAG_VALID | BlockEntry::FLAG_COMPRESSED
    } else {
        BlockEntry::FLAG_VALID
    };
    let mut block = BlockEntry {
        file_pos: 0,
        archived_size: 0,
        file_size: payload.len() as u32,
        flags,
    };

    let stored = encode_stored_file(payload, &block, compressor, -1, 0, sector_size)?;
    out.seek(SeekFrom::Start(archive_offset + cursor))?;
    out.write_all(&stored)?;

    block.archived_size = stored.len() as u32;
    set_block_position(state, block_index, cursor, &mut block, version)?;
    state.block_table.set(block_index, block);

    state.hash_table.set(
        slot,
        HashEntry {
            hash_a: crypto::hash_path(name, hash_type::NAME_A),
            hash_b: crypto::hash_path(name, hash_type::NAME_B),
            locale: 0,
            platform: 0,
            block_index,
        },
    );
    state.filenames[slot as usize] = Some(name.to_string());
    state.invalidate_slot(slot);

    Ok(cursor + stored.len() as u64)
}
