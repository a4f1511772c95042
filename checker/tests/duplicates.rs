// Blocks claimed by more than one inode

mod common;

use common::{assert_clean, options, repair_fully, run, small_image};
use rgfsck_checker::format::BlockState;
use rgfsck_checker::{ImageBuilder, Scripted};
use rgfsck_core::{ExitStatus, RepairMode};

#[test]
fn test_shared_invalid_indirect_block() {
    let mut image = small_image();
    let root = image.root();
    let a = image.create_file(root, "a", 1).unwrap();
    let b = image.create_file(root, "b", 1).unwrap();

    // Both files point their first indirect pointer at a block of garbage
    let garbage = image.allocate(BlockState::Used).unwrap();
    image.write_block(garbage, &vec![0x5A; 1024]).unwrap();
    for inode in [a, b] {
        image.update_inode(inode, |ip| ip.height = 2).unwrap();
        image.set_inode_pointer(inode, 0, garbage).unwrap();
    }

    let scripted = Scripted::new([], true);
    let questions = scripted.questions();
    let report = run(&image, options(RepairMode::Yes), Box::new(scripted));
    assert_eq!(report.status, ExitStatus::ErrorsCorrected);
    assert!(questions.lock().unwrap().contains(&format!("Clear inode {}?", a)));

    // The first claimant is dropped, the survivor loses its bad pointer
    assert!(image.find_entry(root, "a").unwrap().is_none());
    assert!(image.find_entry(root, "b").unwrap().is_some());
    assert_eq!(image.inode_pointers(b).unwrap()[0], 0);
    assert_eq!(image.inode(b).unwrap().blocks, 1);
    assert_eq!(image.bitmap_state(garbage).unwrap(), Some(BlockState::Free));
    assert_eq!(image.bitmap_state(a).unwrap(), Some(BlockState::Free));
    assert_clean(&image);
}

#[test]
fn test_shared_data_block_keeps_chosen_owner() {
    let mut image = small_image();
    let root = image.root();
    let a = image.create_file(root, "a", 1).unwrap();
    let b = image.create_file(root, "b", 1).unwrap();
    let shared = image.data_blocks(a).unwrap()[0];
    let orphaned = image.data_blocks(b).unwrap()[0];
    image.set_inode_pointer(b, 0, shared).unwrap();

    // Keep a, drop b
    let scripted = Scripted::new([false, true], true);
    let questions = scripted.questions();
    let report = run(&image, options(RepairMode::Yes), Box::new(scripted));
    assert_eq!(report.status, ExitStatus::ErrorsUncorrected);

    let asked = questions.lock().unwrap().clone();
    assert_eq!(asked[0], format!("Clear inode {}?", a));
    assert_eq!(asked[1], format!("Clear inode {}?", b));

    assert_eq!(image.data_blocks(a).unwrap(), vec![shared]);
    assert!(image.find_entry(root, "a").unwrap().is_some());
    assert!(image.find_entry(root, "b").unwrap().is_none());
    assert_eq!(image.bitmap_state(shared).unwrap(), Some(BlockState::Used));
    assert_eq!(image.bitmap_state(orphaned).unwrap(), Some(BlockState::Free));
    assert_eq!(image.bitmap_state(b).unwrap(), Some(BlockState::Free));
    assert_clean(&image);
}

#[test]
fn test_inode_referencing_a_block_twice_is_deleted() {
    let mut image = small_image();
    let root = image.root();
    let keep = image.create_file(root, "keep", 1).unwrap();
    let twice = image.create_file(root, "twice", 2).unwrap();
    let blocks = image.data_blocks(twice).unwrap();
    image.set_inode_pointer(twice, 1, blocks[0]).unwrap();

    repair_fully(&image);

    assert!(image.find_entry(root, "twice").unwrap().is_none());
    assert!(image.find_entry(root, "keep").unwrap().is_some());
    for addr in [twice, blocks[0], blocks[1]] {
        assert_eq!(image.bitmap_state(addr).unwrap(), Some(BlockState::Free));
    }
    assert_eq!(image.bitmap_state(keep).unwrap(), Some(BlockState::Dinode));
}

#[test]
fn test_dropped_owner_of_shared_indirect_block_releases_its_data() {
    common::init_logging();
    let mut image = ImageBuilder::new(512, 512).build().unwrap();
    let root = image.root();
    let a = image.create_file(root, "a", 60).unwrap();
    let b = image.create_file(root, "b", 1).unwrap();
    assert_eq!(image.inode(a).unwrap().height, 2);
    let indirect = image.inode_pointers(a).unwrap()[0];
    let a_data = image.data_blocks(a).unwrap();
    let b_data = image.data_blocks(b).unwrap()[0];

    // b reads a's indirect block as one of its data blocks
    image.set_inode_pointer(b, 0, indirect).unwrap();

    let scripted = Scripted::new([], true);
    let questions = scripted.questions();
    let report = run(&image, options(RepairMode::Yes), Box::new(scripted));
    assert_eq!(report.status, ExitStatus::ErrorsCorrected);
    assert_eq!(questions.lock().unwrap()[0], format!("Clear inode {}?", a));

    assert!(image.find_entry(root, "a").unwrap().is_none());
    assert_eq!(image.data_blocks(b).unwrap(), vec![indirect]);
    assert_eq!(image.bitmap_state(indirect).unwrap(), Some(BlockState::Used));
    for addr in a_data.iter().copied().chain([a, b_data]) {
        assert_eq!(image.bitmap_state(addr).unwrap(), Some(BlockState::Free), "block {}", addr);
    }
    assert_clean(&image);
}
