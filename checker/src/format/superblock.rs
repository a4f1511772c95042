// Superblock codec

use super::{meta_type, write_meta_header, MetaType, MAX_BLOCK_SIZE, META_HEADER_LEN, MIN_BLOCK_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rgfsck_core::{FsckError, Result};
use std::io::Cursor;

/// Filesystem was cleanly checked and not modified since
pub const SB_FLAG_CLEAN: u32 = 0x1;

pub const LOCK_PROTO_LEN: usize = 64;
pub const SUPERBLOCK_LEN: usize = 72 + LOCK_PROTO_LEN;

/// Lock protocol prefix used while mounted
pub const LOCK_PREFIX: &str = "lock_";
/// Lock protocol prefix written while a check is in progress
pub const FSCK_PREFIX: &str = "fsck_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub block_size: u32,
    pub flags: u32,
    pub total_blocks: u64,
    pub region_count: u32,
    pub root_dir: u64,
    /// Recovery directory, 0 when none exists yet
    pub lost_found: u64,
    /// Journal inode, 0 when the filesystem has none
    pub journal: u64,
    pub total_free: u64,
    pub total_dinodes: u64,
    pub lock_proto: String,
}

impl Superblock {
    pub fn decode(block: &[u8]) -> Result<Self> {
        if meta_type(block) != Some(MetaType::Superblock) {
            return Err(FsckError::Corrupt("superblock has a bad magic number or type".to_string()));
        }
        if block.len() < SUPERBLOCK_LEN {
            return Err(FsckError::Corrupt(format!("superblock truncated to {} bytes", block.len())));
        }

        let mut cursor = Cursor::new(&block[META_HEADER_LEN..]);
        let block_size = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        let total_blocks = cursor.read_u64::<LittleEndian>()?;
        let region_count = cursor.read_u32::<LittleEndian>()?;
        let _reserved = cursor.read_u32::<LittleEndian>()?;
        let root_dir = cursor.read_u64::<LittleEndian>()?;
        let lost_found = cursor.read_u64::<LittleEndian>()?;
        let journal = cursor.read_u64::<LittleEndian>()?;
        let total_free = cursor.read_u64::<LittleEndian>()?;
        let total_dinodes = cursor.read_u64::<LittleEndian>()?;

        let proto_bytes = &block[72..72 + LOCK_PROTO_LEN];
        let proto_len = proto_bytes.iter().position(|&b| b == 0).unwrap_or(LOCK_PROTO_LEN);
        let lock_proto = String::from_utf8_lossy(&proto_bytes[..proto_len]).into_owned();

        let sb = Self {
            block_size,
            flags,
            total_blocks,
            region_count,
            root_dir,
            lost_found,
            journal,
            total_free,
            total_dinodes,
            lock_proto,
        };
        sb.validate_geometry()?;
        Ok(sb)
    }

    fn validate_geometry(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || self.block_size < MIN_BLOCK_SIZE
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(FsckError::Corrupt(format!("invalid block size {}", self.block_size)));
        }
        if self.total_blocks < 2 || self.region_count == 0 {
            return Err(FsckError::Corrupt(format!(
                "invalid geometry: {} blocks in {} regions",
                self.total_blocks, self.region_count
            )));
        }
        if self.root_dir == 0 || self.root_dir >= self.total_blocks {
            return Err(FsckError::Corrupt(format!("root directory address {} is invalid", self.root_dir)));
        }
        Ok(())
    }

    /// Encode into a full block
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut block = vec![0u8; self.block_size as usize];
        write_meta_header(&mut block, MetaType::Superblock);
        {
            let mut cursor = Cursor::new(&mut block[META_HEADER_LEN..]);
            cursor.write_u32::<LittleEndian>(self.block_size)?;
            cursor.write_u32::<LittleEndian>(self.flags)?;
            cursor.write_u64::<LittleEndian>(self.total_blocks)?;
            cursor.write_u32::<LittleEndian>(self.region_count)?;
            cursor.write_u32::<LittleEndian>(0)?;
            cursor.write_u64::<LittleEndian>(self.root_dir)?;
            cursor.write_u64::<LittleEndian>(self.lost_found)?;
            cursor.write_u64::<LittleEndian>(self.journal)?;
            cursor.write_u64::<LittleEndian>(self.total_free)?;
            cursor.write_u64::<LittleEndian>(self.total_dinodes)?;
        }
        let proto = self.lock_proto.as_bytes();
        let len = proto.len().min(LOCK_PROTO_LEN - 1);
        block[72..72 + len].copy_from_slice(&proto[..len]);
        Ok(block)
    }

    pub fn is_clean(&self) -> bool {
        self.flags & SB_FLAG_CLEAN != 0
    }

    /// Whether the lock protocol rules out a concurrent mount elsewhere
    pub fn is_nolock(&self) -> bool {
        self.lock_proto.contains("nolock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            block_size: 512,
            flags: 0,
            total_blocks: 1024,
            region_count: 2,
            root_dir: 5,
            lost_found: 0,
            journal: 7,
            total_free: 900,
            total_dinodes: 3,
            lock_proto: "lock_nolock".to_string(),
        }
    }

    #[test]
    fn test_encode_decode() {
        let sb = sample();
        let block = sb.encode().unwrap();
        assert_eq!(block.len(), 512);
        assert_eq!(Superblock::decode(&block).unwrap(), sb);
    }

    #[test]
    fn test_bad_block_size_is_corrupt() {
        let mut sb = sample();
        sb.block_size = 1000;
        let mut block = sample().encode().unwrap();
        block[8..12].copy_from_slice(&sb.block_size.to_le_bytes());
        assert!(matches!(Superblock::decode(&block), Err(FsckError::Corrupt(_))));
    }

    #[test]
    fn test_lock_proto_checks() {
        let mut sb = sample();
        assert!(sb.is_nolock());
        sb.lock_proto = "lock_dlm".to_string();
        assert!(!sb.is_nolock());
    }
}
