// Indirect, directory leaf and extended attribute blocks

use super::{new_meta_block, MetaType};
use byteorder::{ByteOrder, LittleEndian};

/// Pointers in an indirect block start here
pub const INDIRECT_PTRS_OFFSET: usize = 16;
/// Pointers in an extended attribute indirect block start here
pub const EA_PTRS_OFFSET: usize = 16;

pub fn indirect_pointer_slots(block_size: u32) -> usize {
    (block_size as usize - INDIRECT_PTRS_OFFSET) / 8
}

pub fn new_indirect(block_size: u32) -> Vec<u8> {
    new_meta_block(block_size, MetaType::Indirect)
}

pub fn new_leaf(block_size: u32) -> Vec<u8> {
    new_meta_block(block_size, MetaType::DirLeaf)
}

pub fn leaf_entry_count(block: &[u8]) -> u16 {
    LittleEndian::read_u16(&block[8..10])
}

pub fn set_leaf_entry_count(block: &mut [u8], count: u16) {
    LittleEndian::write_u16(&mut block[8..10], count);
}

/// Number of pointers recorded in an extended attribute indirect block
pub fn ea_pointer_count(block: &[u8]) -> u32 {
    LittleEndian::read_u32(&block[8..12])
}

pub fn set_ea_pointer_count(block: &mut [u8], count: u32) {
    LittleEndian::write_u32(&mut block[8..12], count);
}

pub fn new_eattr_leaf(block_size: u32, entries: u32) -> Vec<u8> {
    let mut block = new_meta_block(block_size, MetaType::EattrLeaf);
    LittleEndian::write_u32(&mut block[8..12], entries);
    block
}
