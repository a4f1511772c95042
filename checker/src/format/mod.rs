// On-disk structures of the checked filesystem
// All multi-byte fields are little-endian.

pub mod dirent;
pub mod inode;
pub mod meta;
pub mod region;
pub mod superblock;

pub use dirent::{DirEntry, DirEntryType};
pub use inode::{FileKind, Inode};
pub use region::{BlockState, RegionBitmap, RegionHeader};
pub use superblock::Superblock;

use byteorder::{ByteOrder, LittleEndian};

/// Magic number opening every metadata block
pub const FS_MAGIC: u32 = 0x0116_1970;
pub const FORMAT_VERSION: u16 = 1;

pub const META_HEADER_LEN: usize = 8;
pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Superblock address
pub const SUPERBLOCK_ADDR: u64 = 0;

/// Metadata block types stored in the common header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MetaType {
    Superblock = 1,
    RegionHeader = 2,
    RegionBitmap = 3,
    Inode = 4,
    Indirect = 5,
    DirLeaf = 6,
    EattrLeaf = 7,
    EattrIndirect = 8,
}

impl MetaType {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => MetaType::Superblock,
            2 => MetaType::RegionHeader,
            3 => MetaType::RegionBitmap,
            4 => MetaType::Inode,
            5 => MetaType::Indirect,
            6 => MetaType::DirLeaf,
            7 => MetaType::EattrLeaf,
            8 => MetaType::EattrIndirect,
            _ => return None,
        })
    }

    pub fn describe(self) -> &'static str {
        match self {
            MetaType::Superblock => "superblock",
            MetaType::RegionHeader => "region header",
            MetaType::RegionBitmap => "region bitmap",
            MetaType::Inode => "inode",
            MetaType::Indirect => "indirect block",
            MetaType::DirLeaf => "directory leaf",
            MetaType::EattrLeaf => "extended attribute leaf",
            MetaType::EattrIndirect => "extended attribute indirect block",
        }
    }
}

/// Metadata type of a block, if it carries a valid header
pub fn meta_type(block: &[u8]) -> Option<MetaType> {
    if block.len() < META_HEADER_LEN || LittleEndian::read_u32(&block[0..4]) != FS_MAGIC {
        return None;
    }
    if LittleEndian::read_u16(&block[6..8]) != FORMAT_VERSION {
        return None;
    }
    MetaType::from_u16(LittleEndian::read_u16(&block[4..6]))
}

/// True when the block carries a valid header of the given type
pub fn is_meta(block: &[u8], expected: MetaType) -> bool {
    meta_type(block) == Some(expected)
}

pub fn write_meta_header(block: &mut [u8], mtype: MetaType) {
    LittleEndian::write_u32(&mut block[0..4], FS_MAGIC);
    LittleEndian::write_u16(&mut block[4..6], mtype as u16);
    LittleEndian::write_u16(&mut block[6..8], FORMAT_VERSION);
}

/// A zeroed block with a metadata header
pub fn new_meta_block(block_size: u32, mtype: MetaType) -> Vec<u8> {
    let mut block = vec![0u8; block_size as usize];
    write_meta_header(&mut block, mtype);
    block
}

/// Read the u64 pointer array starting at `offset`
pub fn read_pointers(block: &[u8], offset: usize) -> Vec<u64> {
    block[offset.min(block.len())..]
        .chunks_exact(8)
        .map(LittleEndian::read_u64)
        .collect()
}

pub fn read_u64_at(block: &[u8], offset: usize) -> u64 {
    LittleEndian::read_u64(&block[offset..offset + 8])
}

pub fn write_u64_at(block: &mut [u8], offset: usize, value: u64) {
    LittleEndian::write_u64(&mut block[offset..offset + 8], value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_detection() {
        let block = new_meta_block(512, MetaType::Indirect);
        assert_eq!(meta_type(&block), Some(MetaType::Indirect));
        assert!(is_meta(&block, MetaType::Indirect));
        assert!(!is_meta(&block, MetaType::DirLeaf));
    }

    #[test]
    fn test_garbage_is_not_metadata() {
        assert_eq!(meta_type(&[0xAB; 512]), None);
        assert_eq!(meta_type(&[0u8; 4]), None);

        let mut block = new_meta_block(512, MetaType::Inode);
        LittleEndian::write_u16(&mut block[4..6], 77);
        assert_eq!(meta_type(&block), None);
    }

    #[test]
    fn test_pointer_array() {
        let mut block = new_meta_block(512, MetaType::Indirect);
        write_u64_at(&mut block, 16, 42);
        write_u64_at(&mut block, 24, 43);
        let ptrs = read_pointers(&block, 16);
        assert_eq!(ptrs.len(), (512 - 16) / 8);
        assert_eq!(&ptrs[..3], &[42, 43, 0]);
    }
}
