//! Whole-archive scenarios: build, save, reopen, read back

use mpq_archive::{
    compression, locales, AddFileOptions, Archive, BlockEntry, Error, OpenOptions,
};
use pretty_assertions::assert_eq;
use rand::{RngCore, SeedableRng};
use std::path::PathBuf;
use tempfile::TempDir;

fn temp_archive_path(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

#[test]
fn build_save_reopen_read() {
    let dir = TempDir::new().unwrap();
    let path = temp_archive_path(&dir, "scenario1.mpq");
    let payload = random_bytes(100 * 1024, 0xBEEF);

    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
    archive.set_stores_listfile(false);
    archive
        .add_file_with_data(
            payload.clone(),
            "war3map.j",
            &AddFileOptions::new().compressor(compression::flags::ZLIB),
        )
        .unwrap();
    archive.write_to_file(&path, true).unwrap();
    assert!(!archive.modified());

    let reopened = Archive::open(&path).unwrap();
    assert_eq!(reopened.file_count(), 1);
    assert_eq!(reopened.valid_file_count(), 1);
    assert_eq!(reopened.maximum_file_count(), 16);
    assert_eq!(reopened.read_file("war3map.j", locales::NEUTRAL).unwrap(), payload);
}

#[test]
fn same_path_under_two_locales() {
    let dir = TempDir::new().unwrap();
    let path = temp_archive_path(&dir, "locales.mpq");

    let neutral_payload = b"neutral strings".to_vec();
    let english_payload = b"english strings, longer than the neutral ones".to_vec();

    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
    archive
        .add_file_with_data(
            neutral_payload.clone(),
            "ui\\strings.txt",
            &AddFileOptions::new(),
        )
        .unwrap();
    archive
        .add_file_with_data(
            english_payload.clone(),
            "ui\\strings.txt",
            &AddFileOptions::new().locale(locales::ENGLISH),
        )
        .unwrap();
    archive.write_to_file(&path, true).unwrap();

    let reopened = Archive::open(&path).unwrap();
    assert_eq!(
        reopened.locales_for_file("ui\\strings.txt").unwrap(),
        vec![locales::NEUTRAL, locales::ENGLISH]
    );
    assert_eq!(
        reopened.read_file("ui\\strings.txt", locales::NEUTRAL).unwrap(),
        neutral_payload
    );
    assert_eq!(
        reopened.read_file("ui\\strings.txt", locales::ENGLISH).unwrap(),
        english_payload
    );
}

#[test]
fn adjusted_key_survives_embedding() {
    let dir = TempDir::new().unwrap();
    let path = temp_archive_path(&dir, "keyed.mpq");
    let payload = random_bytes(40 * 1024, 42);

    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
    archive.set_stores_listfile(false);
    archive
        .add_file_with_data(
            payload.clone(),
            "secret.bin",
            &AddFileOptions::new().flags(
                BlockEntry::FLAG_COMPRESSED
                    | BlockEntry::FLAG_ENCRYPTED
                    | BlockEntry::FLAG_ADJUSTED_KEY,
            ),
        )
        .unwrap();
    archive.write_to_file(&path, true).unwrap();

    // Embed the saved archive behind a 4 KiB prefix; the stored block
    // offsets are archive-relative, so the adjusted keys must still resolve
    let embedded_path = temp_archive_path(&dir, "embedded.bin");
    let saved = std::fs::read(&path).unwrap();
    let mut container = vec![0u8; 4096];
    container.extend_from_slice(&saved);
    std::fs::write(&embedded_path, container).unwrap();

    let embedded = Archive::open(&embedded_path).unwrap();
    assert_eq!(embedded.archive_offset(), 4096);
    assert_eq!(embedded.read_file("secret.bin", locales::NEUTRAL).unwrap(), payload);
}

#[test]
fn codec_and_encryption_matrix_round_trips() {
    let dir = TempDir::new().unwrap();
    // Compressible but not trivial: repeated text mixed with a counter
    let mut payload = Vec::new();
    for i in 0u32..3000 {
        payload.extend_from_slice(format!("line {i} of the payload\r\n").as_bytes());
    }

    let masks = [
        compression::flags::ZLIB,
        compression::flags::BZIP2,
        compression::flags::PKWARE,
        compression::flags::HUFFMAN,
        compression::flags::ZLIB | compression::flags::PKWARE,
    ];
    let flag_sets = [
        BlockEntry::FLAG_COMPRESSED,
        BlockEntry::FLAG_COMPRESSED | BlockEntry::FLAG_ENCRYPTED,
        BlockEntry::FLAG_COMPRESSED | BlockEntry::FLAG_ENCRYPTED | BlockEntry::FLAG_ADJUSTED_KEY,
        BlockEntry::FLAG_COMPRESSED | BlockEntry::FLAG_SECTOR_CRC,
    ];

    for (i, mask) in masks.iter().enumerate() {
        for (j, flags) in flag_sets.iter().enumerate() {
            let path = temp_archive_path(&dir, &format!("matrix_{i}_{j}.mpq"));
            let mut archive =
                Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
            archive
                .add_file_with_data(
                    payload.clone(),
                    "data\\payload.txt",
                    &AddFileOptions::new().flags(*flags).compressor(*mask),
                )
                .unwrap();
            archive.write_to_file(&path, true).unwrap();

            let reopened = Archive::open(&path).unwrap();
            assert_eq!(
                reopened.read_file("data\\payload.txt", 0).unwrap(),
                payload,
                "mask 0x{mask:02X}, flags 0x{flags:08X}"
            );
        }
    }
}

#[test]
fn uncompressed_and_one_sector_storage() {
    let dir = TempDir::new().unwrap();
    let path = temp_archive_path(&dir, "storage.mpq");
    let small = b"one sector of data".to_vec();
    let plain = random_bytes(20000, 7);

    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
    archive
        .add_file_with_data(
            small.clone(),
            "single.bin",
            &AddFileOptions::new().flags(BlockEntry::FLAG_ONE_SECTOR | BlockEntry::FLAG_COMPRESSED),
        )
        .unwrap();
    archive
        .add_file_with_data(plain.clone(), "plain.bin", &AddFileOptions::new().flags(0))
        .unwrap();
    archive.write_to_file(&path, true).unwrap();

    let reopened = Archive::open(&path).unwrap();
    assert_eq!(reopened.read_file("single.bin", 0).unwrap(), small);
    assert_eq!(reopened.read_file("plain.bin", 0).unwrap(), plain);

    let info = reopened.file_info("single.bin", 0).unwrap();
    assert!(info.flags & BlockEntry::FLAG_ONE_SECTOR != 0);
}

#[test]
fn exact_sector_multiple_has_no_trailing_sector() {
    let dir = TempDir::new().unwrap();
    let path = temp_archive_path(&dir, "exact.mpq");

    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
    let sector_size = archive.sector_size();
    let payload = random_bytes(sector_size * 3, 99);

    archive
        .add_file_with_data(payload.clone(), "exact.bin", &AddFileOptions::new())
        .unwrap();
    archive.write_to_file(&path, true).unwrap();

    let reopened = Archive::open(&path).unwrap();
    assert_eq!(reopened.read_file("exact.bin", 0).unwrap(), payload);

    // Partial reads across every sector boundary
    let mut file = reopened.open_file("exact.bin", 0).unwrap();
    let mut window = vec![0u8; 100];
    file.seek((sector_size - 50) as u32, mpq_archive::SeekMode::Start)
        .unwrap();
    let read = file.read(&mut window).unwrap();
    assert_eq!(read, 100);
    assert_eq!(window, payload[sector_size - 50..sector_size + 50]);
}

#[test]
fn delete_then_undo_restores_entry() {
    let dir = TempDir::new().unwrap();
    let path = temp_archive_path(&dir, "undo.mpq");
    let payload = b"to be deleted".to_vec();

    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
    archive
        .add_file_with_data(payload.clone(), "doomed.txt", &AddFileOptions::new())
        .unwrap();
    archive.write_to_file(&path, true).unwrap();

    let mut archive = Archive::open(&path).unwrap();
    archive.delete_file("doomed.txt", 0).unwrap();

    assert!(matches!(
        archive.read_file("doomed.txt", 0),
        Err(Error::FileNotFound(_))
    ));
    assert!(archive.locales_for_file("doomed.txt").unwrap().is_empty());

    archive.undo_last_operation().unwrap();
    assert_eq!(archive.locales_for_file("doomed.txt").unwrap(), vec![0]);
    assert_eq!(archive.read_file("doomed.txt", 0).unwrap(), payload);
}

#[test]
fn capacity_exhaustion_rejects_add() {
    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
    archive.set_stores_listfile(false);

    for i in 0..16 {
        archive
            .add_file_with_data(
                format!("payload {i}").into_bytes(),
                &format!("files\\entry{i:02}.dat"),
                &AddFileOptions::new(),
            )
            .unwrap();
    }

    let err = archive
        .add_file_with_data(
            b"no room".to_vec(),
            "files\\overflow.dat",
            &AddFileOptions::new(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::HashTableFull));
}

#[test]
fn open_file_gates_save() {
    let dir = TempDir::new().unwrap();
    let path = temp_archive_path(&dir, "gate.mpq");

    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
    archive
        .add_file_with_data(b"contents".to_vec(), "held.txt", &AddFileOptions::new())
        .unwrap();
    archive.write_to_file(&path, true).unwrap();

    let mut archive = Archive::open(&path).unwrap();
    archive
        .add_file_with_data(b"update".to_vec(), "other.txt", &AddFileOptions::new())
        .unwrap();

    let file = archive.open_file("held.txt", 0).unwrap();
    assert_eq!(archive.open_file_count(), 1);
    assert!(matches!(archive.save(), Err(Error::FileIsOpen(1))));

    drop(file);
    assert_eq!(archive.open_file_count(), 0);
    archive.save().unwrap();
    assert!(!archive.modified());

    let reopened = Archive::open(&path).unwrap();
    assert_eq!(reopened.read_file("other.txt", 0).unwrap(), b"update");
}

#[test]
fn overwrite_requires_opt_in() {
    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
    archive
        .add_file_with_data(b"first".to_vec(), "file.txt", &AddFileOptions::new())
        .unwrap();

    let err = archive
        .add_file_with_data(b"second".to_vec(), "file.txt", &AddFileOptions::new())
        .unwrap_err();
    assert!(matches!(err, Error::FileExists(_)));

    archive
        .add_file_with_data(
            b"second".to_vec(),
            "file.txt",
            &AddFileOptions::new().overwrite(true),
        )
        .unwrap();
}

#[test]
fn overwrite_wins_at_save() {
    let dir = TempDir::new().unwrap();
    let path = temp_archive_path(&dir, "overwrite.mpq");

    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
    archive
        .add_file_with_data(b"first".to_vec(), "file.txt", &AddFileOptions::new())
        .unwrap();
    archive
        .add_file_with_data(
            b"the second payload".to_vec(),
            "file.txt",
            &AddFileOptions::new().overwrite(true),
        )
        .unwrap();
    archive.write_to_file(&path, true).unwrap();

    let reopened = Archive::open(&path).unwrap();
    assert_eq!(
        reopened.read_file("file.txt", 0).unwrap(),
        b"the second payload"
    );
}

#[test]
fn listfile_regenerates_at_save() {
    let dir = TempDir::new().unwrap();
    let path = temp_archive_path(&dir, "listed.mpq");

    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(32)).unwrap();
    archive
        .add_file_with_data(b"a".to_vec(), "dir\\alpha.txt", &AddFileOptions::new())
        .unwrap();
    archive
        .add_file_with_data(b"b".to_vec(), "dir\\beta.txt", &AddFileOptions::new())
        .unwrap();
    archive.write_to_file(&path, true).unwrap();

    let reopened = Archive::open(&path).unwrap();
    let names = reopened.file_list();
    assert!(names.contains(&"dir\\alpha.txt".to_string()));
    assert!(names.contains(&"dir\\beta.txt".to_string()));
    assert!(names.contains(&"(listfile)".to_string()));

    // The listfile names every entry, so reads by name work after reopen
    assert_eq!(reopened.read_file("dir\\alpha.txt", 0).unwrap(), b"a");
}

#[test]
fn save_set_equality_after_reopen() {
    let dir = TempDir::new().unwrap();
    let path = temp_archive_path(&dir, "equality.mpq");

    let entries: Vec<(String, u16, Vec<u8>)> = vec![
        ("maps\\one.w3x".into(), 0, random_bytes(5000, 1)),
        ("maps\\two.w3x".into(), 0, random_bytes(100, 2)),
        ("strings.txt".into(), locales::GERMAN, b"de".to_vec()),
        ("strings.txt".into(), locales::FRENCH, b"fr".to_vec()),
    ];

    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(32)).unwrap();
    for (name, locale, payload) in &entries {
        archive
            .add_file_with_data(
                payload.clone(),
                name,
                &AddFileOptions::new().locale(*locale),
            )
            .unwrap();
    }
    archive.write_to_file(&path, true).unwrap();

    // Mutate and save in place over the original
    let mut archive = Archive::open(&path).unwrap();
    archive.delete_file("maps\\two.w3x", 0).unwrap();
    archive.save().unwrap();
    assert!(!archive.modified());

    let reopened = Archive::open(&path).unwrap();
    assert!(matches!(
        reopened.read_file("maps\\two.w3x", 0),
        Err(Error::FileNotFound(_))
    ));
    for (name, locale, payload) in entries.iter().filter(|(n, _, _)| n != "maps\\two.w3x") {
        assert_eq!(&reopened.read_file(name, *locale).unwrap(), payload);
    }
}

#[test]
fn nonatomic_in_place_save() {
    let dir = TempDir::new().unwrap();
    let path = temp_archive_path(&dir, "inplace.mpq");
    let payload = random_bytes(30000, 3);

    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
    archive
        .add_file_with_data(payload.clone(), "keep.bin", &AddFileOptions::new())
        .unwrap();
    archive
        .add_file_with_data(random_bytes(50000, 4), "drop.bin", &AddFileOptions::new())
        .unwrap();
    archive.write_to_file(&path, true).unwrap();

    let mut archive = Archive::open(&path).unwrap();
    let size_before = std::fs::metadata(&path).unwrap().len();
    archive.delete_file("drop.bin", 0).unwrap();
    archive.write_to_file(&path, false).unwrap();

    // Compaction reclaimed the deleted block's storage
    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after < size_before);

    let reopened = Archive::open(&path).unwrap();
    assert_eq!(reopened.read_file("keep.bin", 0).unwrap(), payload);
}

#[test]
fn deleted_file_remains_readable_through_open_handle() {
    let dir = TempDir::new().unwrap();
    let path = temp_archive_path(&dir, "pinned.mpq");
    let payload = random_bytes(9000, 12);

    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
    archive
        .add_file_with_data(payload.clone(), "pinned.bin", &AddFileOptions::new())
        .unwrap();
    archive.write_to_file(&path, true).unwrap();

    let mut archive = Archive::open(&path).unwrap();
    let mut file = archive.open_file("pinned.bin", 0).unwrap();
    archive.delete_file("pinned.bin", 0).unwrap();

    // The handle pinned its slot; the bytes stay readable until it closes
    assert_eq!(file.read_to_end().unwrap(), payload);
    drop(file);

    assert!(matches!(
        archive.open_file("pinned.bin", 0),
        Err(Error::FileNotFound(_))
    ));
}

#[test]
fn pending_add_cannot_be_opened() {
    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
    archive
        .add_file_with_data(b"pending".to_vec(), "pending.txt", &AddFileOptions::new())
        .unwrap();

    assert!(matches!(
        archive.open_file("pending.txt", 0),
        Err(Error::FileIsInvalid(_))
    ));
}

#[test]
fn attributes_written_and_parsed() {
    let dir = TempDir::new().unwrap();
    let path = temp_archive_path(&dir, "attrs.mpq");
    let payload = b"checksummed payload".to_vec();

    let mut archive = Archive::create(&OpenOptions::new().maximum_file_count(16)).unwrap();
    archive
        .add_file_with_data(payload.clone(), "data.bin", &AddFileOptions::new())
        .unwrap();
    // Opting into attributes before the first save seeds an empty table
    // that the save pipeline fills for realized files
    archive.enable_attributes();
    archive.write_to_file(&path, true).unwrap();

    let reopened = Archive::open(&path).unwrap();
    let attributes = reopened
        .attributes()
        .unwrap()
        .expect("attributes entry should exist after save");
    let info = reopened.file_info("data.bin", 0).unwrap();
    let entry = attributes.get(info.block_index as usize).unwrap();
    assert_eq!(entry.crc32, Some(crc32fast::hash(&payload)));
    assert!(entry.md5.is_some());
}
