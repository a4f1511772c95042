// Allocation region header and its 2-bit block state bitmap

use super::{meta_type, write_meta_header, MetaType, META_HEADER_LEN};
use byteorder::{ByteOrder, LittleEndian};
use rgfsck_core::{FsckError, Result};

pub const REGION_HEADER_LEN: usize = 48;
/// Bitmap bytes begin after the common header in each bitmap block
pub const BITMAP_HEADER_LEN: usize = META_HEADER_LEN;
pub const STATES_PER_BYTE: u32 = 4;

/// Allocation state of a data block as recorded on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockState {
    Free = 0,
    Used = 1,
    Unlinked = 2,
    Dinode = 3,
}

impl BlockState {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => BlockState::Free,
            1 => BlockState::Used,
            2 => BlockState::Unlinked,
            _ => BlockState::Dinode,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            BlockState::Free => "free",
            BlockState::Used => "data",
            BlockState::Unlinked => "unlinked",
            BlockState::Dinode => "inode",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionHeader {
    /// Address of this header block; the region's span starts here
    pub start: u64,
    /// Blocks in the span, header and bitmap blocks included
    pub length: u32,
    pub bitmap_blocks: u32,
    /// First data block
    pub data0: u64,
    pub data_len: u32,
    pub free: u32,
    pub dinodes: u32,
}

impl RegionHeader {
    /// Lay out a region of `length` blocks at `start`
    pub fn layout(start: u64, length: u32, block_size: u32) -> Self {
        let per_block = bitmap_states_per_block(block_size);
        let bitmap_blocks = (length.saturating_sub(1) + per_block - 1) / per_block;
        let data_len = length.saturating_sub(1 + bitmap_blocks);
        Self {
            start,
            length,
            bitmap_blocks,
            data0: start + 1 + bitmap_blocks as u64,
            data_len,
            free: data_len,
            dinodes: 0,
        }
    }

    pub fn decode(block: &[u8], expected_start: u64) -> Result<Self> {
        if meta_type(block) != Some(MetaType::RegionHeader) {
            return Err(FsckError::Corrupt(format!(
                "block {} is not a region header",
                expected_start
            )));
        }
        let header = Self {
            start: LittleEndian::read_u64(&block[8..16]),
            length: LittleEndian::read_u32(&block[16..20]),
            bitmap_blocks: LittleEndian::read_u32(&block[20..24]),
            data0: LittleEndian::read_u64(&block[24..32]),
            data_len: LittleEndian::read_u32(&block[32..36]),
            free: LittleEndian::read_u32(&block[36..40]),
            dinodes: LittleEndian::read_u32(&block[40..44]),
        };
        if header.start != expected_start {
            return Err(FsckError::Corrupt(format!(
                "region header at block {} claims address {}",
                expected_start, header.start
            )));
        }
        if header.length == 0
            || header.data0 != header.start + 1 + header.bitmap_blocks as u64
            || header.data_len as u64 + 1 + header.bitmap_blocks as u64 != header.length as u64
        {
            return Err(FsckError::Corrupt(format!(
                "region at block {} has inconsistent geometry",
                header.start
            )));
        }
        Ok(header)
    }

    pub fn encode_into(&self, block: &mut [u8]) {
        write_meta_header(block, MetaType::RegionHeader);
        LittleEndian::write_u64(&mut block[8..16], self.start);
        LittleEndian::write_u32(&mut block[16..20], self.length);
        LittleEndian::write_u32(&mut block[20..24], self.bitmap_blocks);
        LittleEndian::write_u64(&mut block[24..32], self.data0);
        LittleEndian::write_u32(&mut block[32..36], self.data_len);
        LittleEndian::write_u32(&mut block[36..40], self.free);
        LittleEndian::write_u32(&mut block[40..44], self.dinodes);
    }

    pub fn end(&self) -> u64 {
        self.start + self.length as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn contains_data(&self, addr: u64) -> bool {
        addr >= self.data0 && addr < self.data0 + self.data_len as u64
    }

    /// Addresses of the bitmap blocks
    pub fn bitmap_addrs(&self) -> impl Iterator<Item = u64> {
        let first = self.start + 1;
        first..first + self.bitmap_blocks as u64
    }
}

pub fn bitmap_states_per_block(block_size: u32) -> u32 {
    (block_size - BITMAP_HEADER_LEN as u32) * STATES_PER_BYTE
}

/// Packed 2-bit states for the data blocks of one region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionBitmap {
    data: Vec<u8>,
    len: u32,
}

impl RegionBitmap {
    /// A bitmap with every block free
    pub fn new(len: u32) -> Self {
        let size_bytes = (len + STATES_PER_BYTE - 1) / STATES_PER_BYTE;
        Self {
            data: vec![0u8; size_bytes as usize],
            len,
        }
    }

    /// Assemble from the region's bitmap blocks, in order
    pub fn from_blocks(blocks: &[Vec<u8>], len: u32) -> Result<Self> {
        let mut bitmap = Self::new(len);
        let mut offset = 0usize;
        for (i, block) in blocks.iter().enumerate() {
            if meta_type(block) != Some(MetaType::RegionBitmap) {
                return Err(FsckError::Corrupt(format!("region bitmap block {} has a bad header", i)));
            }
            let body = &block[BITMAP_HEADER_LEN..];
            let take = body.len().min(bitmap.data.len() - offset);
            bitmap.data[offset..offset + take].copy_from_slice(&body[..take]);
            offset += take;
            if offset == bitmap.data.len() {
                break;
            }
        }
        if offset < bitmap.data.len() {
            return Err(FsckError::Corrupt("region bitmap is shorter than its data span".to_string()));
        }
        Ok(bitmap)
    }

    /// Split into bitmap blocks of `block_size` bytes
    pub fn to_blocks(&self, block_size: u32, count: u32) -> Vec<Vec<u8>> {
        let body_len = block_size as usize - BITMAP_HEADER_LEN;
        (0..count as usize)
            .map(|i| {
                let mut block = vec![0u8; block_size as usize];
                write_meta_header(&mut block, MetaType::RegionBitmap);
                let start = (i * body_len).min(self.data.len());
                let end = ((i + 1) * body_len).min(self.data.len());
                block[BITMAP_HEADER_LEN..BITMAP_HEADER_LEN + (end - start)]
                    .copy_from_slice(&self.data[start..end]);
                block
            })
            .collect()
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: u32) -> BlockState {
        if index >= self.len {
            return BlockState::Free;
        }
        let byte = self.data[(index / STATES_PER_BYTE) as usize];
        let shift = (index % STATES_PER_BYTE) * 2;
        BlockState::from_bits(byte >> shift)
    }

    pub fn set(&mut self, index: u32, state: BlockState) {
        if index >= self.len {
            return;
        }
        let byte = &mut self.data[(index / STATES_PER_BYTE) as usize];
        let shift = (index % STATES_PER_BYTE) * 2;
        *byte = (*byte & !(0x3 << shift)) | ((state as u8) << shift);
    }

    pub fn count(&self, state: BlockState) -> u32 {
        (0..self.len).filter(|&i| self.get(i) == state).count() as u32
    }

    /// Indexes holding `state`, in order
    pub fn iter_state(&self, state: BlockState) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |&i| self.get(i) == state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_layout() {
        let header = RegionHeader::layout(1, 600, 512);
        // 504 body bytes hold 2016 states, so one bitmap block suffices
        assert_eq!(header.bitmap_blocks, 1);
        assert_eq!(header.data0, 3);
        assert_eq!(header.data_len, 598);
        assert!(header.contains(1));
        assert!(!header.contains_data(2));
        assert!(header.contains_data(600));
        assert!(!header.contains(601));
    }

    #[test]
    fn test_header_decode_checks_address() {
        let header = RegionHeader::layout(10, 100, 512);
        let mut block = vec![0u8; 512];
        header.encode_into(&mut block);
        assert_eq!(RegionHeader::decode(&block, 10).unwrap(), header);
        assert!(RegionHeader::decode(&block, 11).is_err());
    }

    #[test]
    fn test_states_do_not_bleed() {
        let mut bitmap = RegionBitmap::new(9);
        bitmap.set(0, BlockState::Dinode);
        bitmap.set(1, BlockState::Used);
        bitmap.set(3, BlockState::Unlinked);
        bitmap.set(8, BlockState::Dinode);
        assert_eq!(bitmap.get(0), BlockState::Dinode);
        assert_eq!(bitmap.get(1), BlockState::Used);
        assert_eq!(bitmap.get(2), BlockState::Free);
        assert_eq!(bitmap.get(3), BlockState::Unlinked);
        assert_eq!(bitmap.get(8), BlockState::Dinode);
        assert_eq!(bitmap.count(BlockState::Free), 5);
        assert_eq!(bitmap.iter_state(BlockState::Dinode).collect::<Vec<_>>(), vec![0, 8]);
    }

    #[test]
    fn test_blocks_reassemble_across_block_boundary() {
        // 512-byte blocks carry 2016 states; force a second bitmap block
        let mut bitmap = RegionBitmap::new(3000);
        bitmap.set(2015, BlockState::Used);
        bitmap.set(2016, BlockState::Dinode);
        bitmap.set(2999, BlockState::Unlinked);
        let blocks = bitmap.to_blocks(512, 2);
        let back = RegionBitmap::from_blocks(&blocks, 3000).unwrap();
        assert_eq!(back, bitmap);
    }

    #[test]
    fn test_bad_bitmap_block_rejected() {
        let blocks = vec![vec![0u8; 512]];
        assert!(RegionBitmap::from_blocks(&blocks, 100).is_err());
    }

    proptest! {
        #[test]
        fn prop_set_touches_only_its_index(
            len in 1u32..200,
            ops in proptest::collection::vec((0u32..200, 0u8..4), 0..64),
        ) {
            let mut bitmap = RegionBitmap::new(len);
            let mut model = vec![BlockState::Free; len as usize];
            for (index, bits) in ops {
                let state = BlockState::from_bits(bits);
                bitmap.set(index, state);
                if index < len {
                    model[index as usize] = state;
                }
            }
            for i in 0..len {
                prop_assert_eq!(bitmap.get(i), model[i as usize]);
            }
        }
    }
}
