//! Free-extent merging and the tiling invariant

use packfs_rs::{AccessMode, BlockRecord, FileSystem, MemoryStream, CLUSTER_SIZE};

fn fresh(max_files: u32, max_blocks: u32) -> FileSystem {
    FileSystem::create(
        "/mem/merge.pfs",
        AccessMode::ReadWrite,
        Box::new(MemoryStream::new()),
        max_files,
        max_blocks,
    )
    .unwrap()
}

/// Write `count` files of `clusters` clusters each, laid out back to back
fn fill(fs: &mut FileSystem, count: usize, clusters: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let name = format!("f{:02}", i);
            let data = vec![i as u8; clusters * CLUSTER_SIZE as usize];
            assert!(fs.write_file(&name, &data).unwrap());
            name
        })
        .collect()
}

#[test]
fn test_adjacent_deletes_in_either_order_merge() {
    for (first, second) in [(1, 2), (2, 1)] {
        let mut fs = fresh(8, 16);
        let names = fill(&mut fs, 4, 1);

        fs.delete_file(&names[first]).unwrap();
        fs.delete_file(&names[second]).unwrap();

        let free = fs.free_extents();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].1, BlockRecord::free(1, 2 * CLUSTER_SIZE));
        fs.verify().unwrap();
    }
}

#[test]
fn test_deleting_everything_leaves_one_extent() {
    let mut fs = fresh(16, 32);
    let names = fill(&mut fs, 10, 2);

    // alternate ends so merges happen from both sides
    for i in [0, 9, 2, 7, 4, 5, 1, 8, 3, 6] {
        fs.delete_file(&names[i]).unwrap();
        fs.verify().unwrap();
    }

    let free = fs.free_extents();
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].1, BlockRecord::free(0, 20 * CLUSTER_SIZE));
    assert_eq!(fs.empty_slot_count(), 9);
    assert_eq!(fs.stats().fragmentation, 0.0);
}

#[test]
fn test_reuse_after_merge_splits_front() {
    let mut fs = fresh(8, 16);
    let names = fill(&mut fs, 4, 1);
    fs.delete_file(&names[1]).unwrap();
    fs.delete_file(&names[2]).unwrap();

    let block_count = fs.block_count();
    fs.write_file("small", &[9u8; 100]).unwrap();

    // the merge freed a slot, so the split needs no new block record
    assert_eq!(fs.block_count(), block_count);
    assert_eq!(
        fs.get_file_info("small").unwrap().offset,
        fs.data_region_offset() + CLUSTER_SIZE
    );
    let free = fs.free_extents();
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].1, BlockRecord::free(2, CLUSTER_SIZE));
    fs.verify().unwrap();
}

#[test]
fn test_exhausted_block_table_still_reuses_exact_fits() {
    let mut fs = fresh(4, 4);
    let names = fill(&mut fs, 4, 1);
    assert_eq!(fs.block_count(), 4);

    fs.delete_file(&names[0]).unwrap();
    assert!(fs.write_file("again", &[1u8; 4000]).unwrap());
    assert_eq!(fs.get_file_info("again").unwrap().offset, fs.data_region_offset());

    // every slot is in use and nothing is free
    assert!(!fs.write_file(&names[1], &[1u8; 10]).unwrap());
    fs.verify().unwrap();
}

#[test]
fn test_merged_slot_is_reused_before_growing_table() {
    let mut fs = fresh(8, 16);
    let names = fill(&mut fs, 3, 1);
    fs.delete_file(&names[0]).unwrap();
    fs.delete_file(&names[1]).unwrap();
    assert_eq!(fs.empty_slot_count(), 1);

    let block_count = fs.block_count();
    fs.write_file("empty", b"").unwrap();
    assert_eq!(fs.block_count(), block_count);
    assert_eq!(fs.empty_slot_count(), 0);
}
