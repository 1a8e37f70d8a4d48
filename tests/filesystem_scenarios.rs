//! End-to-end scenarios against archives stored on disk

use packfs_rs::{
    AccessMode, FileStream, FileSystem, FileSystemController, FileStreamFactory, PackError,
    CLUSTER_SIZE,
};
use std::io::Cursor;
use std::path::Path;
use tempfile::TempDir;

fn create_on_disk(path: &Path, max_files: u32, max_blocks: u32) -> FileSystem {
    let stream = FileStream::open(path, AccessMode::ReadWrite, true).unwrap();
    FileSystem::create(path, AccessMode::ReadWrite, Box::new(stream), max_files, max_blocks).unwrap()
}

fn load_from_disk(path: &Path, access: AccessMode) -> FileSystem {
    let stream = FileStream::open(path, access, false).unwrap();
    FileSystem::load(path, access, Box::new(stream)).unwrap()
}

#[test]
fn test_small_file_takes_one_cluster() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.pfs");
    let mut fs = create_on_disk(&path, 4, 8);

    assert!(fs.write_file("a.txt", &[0xAB; 10]).unwrap());
    let info = fs.get_file_info("a.txt").unwrap();
    assert_eq!(info.length, 10);

    let block = fs.blocks()[0];
    assert_eq!(block.cluster_count(), 1);
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        fs.data_region_offset() + CLUSTER_SIZE
    );
}

#[test]
fn test_overwrite_delete_lifecycle_survives_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("life.pfs");

    let mut fs = create_on_disk(&path, 4, 8);
    fs.write_file("a.txt", &[1u8; 10]).unwrap();
    fs.write_file("a.txt", &[2u8; 5000]).unwrap();

    let free = fs.free_extents();
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].1.length, CLUSTER_SIZE);
    assert_eq!(fs.get_file_info("a.txt").unwrap().length, 5000);
    fs.shutdown().unwrap();

    let mut fs = load_from_disk(&path, AccessMode::ReadWrite);
    assert_eq!(fs.read_file("a.txt").unwrap().unwrap(), vec![2u8; 5000]);
    assert_eq!(fs.free_extents().len(), 1);

    assert!(fs.delete_file("a.txt").unwrap());
    assert!(!fs.has_file("a.txt"));
    assert!(fs.get_file_info("a.txt").is_none());
    fs.shutdown().unwrap();

    let mut fs = load_from_disk(&path, AccessMode::Read);
    assert_eq!(fs.file_count(), 0);
    // both extents merged into one free run
    let free = fs.free_extents();
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].1.length, 3 * CLUSTER_SIZE);
    fs.verify().unwrap();
}

#[test]
fn test_fifth_file_refused_in_four_file_archive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("full.pfs");
    let mut fs = create_on_disk(&path, 4, 8);

    let names = ["one", "two", "three", "four", "five"];
    let results: Vec<bool> = names
        .iter()
        .map(|name| fs.write_file(name, name.as_bytes()).unwrap())
        .collect();
    assert_eq!(results, vec![true, true, true, true, false]);

    for name in &names[..4] {
        assert_eq!(fs.read_file(name).unwrap().unwrap(), name.as_bytes());
    }
    assert!(!fs.has_file("five"));
}

#[test]
fn test_create_rejects_more_files_than_blocks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.pfs");
    let stream = FileStream::open(&path, AccessMode::ReadWrite, true).unwrap();

    let err = FileSystem::create(&path, AccessMode::ReadWrite, Box::new(stream), 8, 4).unwrap_err();
    assert!(matches!(err, PackError::InvalidParameter(_)));
}

#[test]
fn test_boundary_reads_never_fail() {
    let dir = TempDir::new().unwrap();
    let mut fs = create_on_disk(&dir.path().join("seg.pfs"), 4, 8);
    let data: Vec<u8> = (0..=255u8).collect();
    fs.write_file("bytes", &data).unwrap();

    assert_eq!(
        fs.read_file_segment("bytes", 250, 100).unwrap().unwrap(),
        &data[250..]
    );
    assert!(fs
        .read_file_segment("bytes", 1000, 10)
        .unwrap()
        .unwrap()
        .is_empty());

    let mut sink = Vec::new();
    assert_eq!(fs.read_file_to("bytes", &mut sink).unwrap(), 256);
    assert_eq!(sink, data);
}

#[test]
fn test_rename_same_name_touches_nothing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rename.pfs");
    let mut fs = create_on_disk(&path, 4, 8);
    fs.write_file("stay", b"put").unwrap();
    fs.flush().unwrap();

    let before = std::fs::read(&path).unwrap();
    assert!(fs.rename_file("stay", "stay").unwrap());
    fs.flush().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn test_streaming_write_and_extract() {
    let dir = TempDir::new().unwrap();
    let mut fs = create_on_disk(&dir.path().join("stream.pfs"), 4, 8);

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let mut reader = Cursor::new(payload.clone());
    assert!(fs.write_file_from_reader("big.bin", &mut reader).unwrap());

    let out = dir.path().join("big.out");
    assert!(fs.save_as_file("big.bin", &out).unwrap());
    assert_eq!(std::fs::read(&out).unwrap(), payload);

    let mut window = vec![0u8; 4096];
    assert_eq!(
        fs.read_file_segment_into("big.bin", 8192, &mut window).unwrap(),
        4096
    );
    assert_eq!(window, &payload[8192..12288]);
}

#[test]
fn test_write_only_archive_can_write_but_not_read() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("wo.pfs");
    create_on_disk(&path, 4, 8).shutdown().unwrap();

    let mut fs = load_from_disk(&path, AccessMode::Write);
    assert!(fs.write_file("log", b"entry").unwrap());
    assert!(matches!(
        fs.read_file("log"),
        Err(PackError::AccessDenied { .. })
    ));
    fs.shutdown().unwrap();

    let mut fs = load_from_disk(&path, AccessMode::Read);
    assert_eq!(fs.read_file("log").unwrap().unwrap(), b"entry");
}

#[test]
fn test_registry_round_trip_on_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("registry.pfs");
    let controller = FileSystemController::with_stream_factory(FileStreamFactory);

    let handle = controller
        .create_file_system(&path, AccessMode::ReadWrite, 16, 32)
        .unwrap();
    for i in 0..10 {
        handle
            .lock()
            .write_file(&format!("file{}", i), &vec![i as u8; 1000 * i])
            .unwrap();
    }
    controller.shutdown().unwrap();
    assert_eq!(controller.count(), 0);

    let handle = controller.load_file_system(&path, AccessMode::Read).unwrap();
    let fs = handle.lock();
    assert_eq!(fs.file_count(), 10);
    let infos = fs.get_all_file_infos();
    assert_eq!(infos[0].name, "file0");
    assert_eq!(infos[9].length, 9000);
}
