// Block classification map
// Dense per-address record of what every block is currently believed to be.

use crate::format::{BlockState, FileKind};
use log::trace;
use rgfsck_core::{FsckError, Result};

/// Classification of a single block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockTag {
    Free,
    Used,
    InodeDir,
    InodeFile,
    InodeLink,
    InodeDevice,
    InodeFifo,
    InodeSocket,
    Indirect,
    DirLeaf,
    EattrIndirect,
    EattrLeaf,
    Journal,
    RegionMeta,
    Invalid,
    /// An inode whose tree holds pointers outside the filesystem
    BadPointerSource,
}

impl BlockTag {
    pub fn for_kind(kind: FileKind) -> Self {
        match kind {
            FileKind::Directory => BlockTag::InodeDir,
            FileKind::Regular => BlockTag::InodeFile,
            FileKind::Symlink => BlockTag::InodeLink,
            FileKind::Device => BlockTag::InodeDevice,
            FileKind::Fifo => BlockTag::InodeFifo,
            FileKind::Socket => BlockTag::InodeSocket,
        }
    }

    /// Object kind for the inode tags
    pub fn inode_kind(self) -> Option<FileKind> {
        Some(match self {
            BlockTag::InodeDir => FileKind::Directory,
            BlockTag::InodeFile => FileKind::Regular,
            BlockTag::InodeLink => FileKind::Symlink,
            BlockTag::InodeDevice => FileKind::Device,
            BlockTag::InodeFifo => FileKind::Fifo,
            BlockTag::InodeSocket => FileKind::Socket,
            _ => return None,
        })
    }

    /// Any block holding a live inode header, including ones with bad pointers
    pub fn is_inode(self) -> bool {
        self.inode_kind().is_some() || self == BlockTag::BadPointerSource
    }

    /// Blocks that belong to some inode's tree
    pub fn is_tree_block(self) -> bool {
        matches!(
            self,
            BlockTag::Used
                | BlockTag::Indirect
                | BlockTag::DirLeaf
                | BlockTag::EattrIndirect
                | BlockTag::EattrLeaf
                | BlockTag::Journal
                | BlockTag::Invalid
        )
    }

    /// Expected on-disk allocation state
    pub fn bitmap_state(self) -> BlockState {
        match self {
            BlockTag::Free | BlockTag::Invalid => BlockState::Free,
            t if t.is_inode() => BlockState::Dinode,
            _ => BlockState::Used,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            BlockTag::Free => "free",
            BlockTag::Used => "data",
            BlockTag::InodeDir => "directory inode",
            BlockTag::InodeFile => "file inode",
            BlockTag::InodeLink => "symlink inode",
            BlockTag::InodeDevice => "device inode",
            BlockTag::InodeFifo => "fifo inode",
            BlockTag::InodeSocket => "socket inode",
            BlockTag::Indirect => "indirect block",
            BlockTag::DirLeaf => "directory leaf",
            BlockTag::EattrIndirect => "extended attribute indirect block",
            BlockTag::EattrLeaf => "extended attribute leaf",
            BlockTag::Journal => "journal block",
            BlockTag::RegionMeta => "region metadata",
            BlockTag::Invalid => "invalid block",
            BlockTag::BadPointerSource => "inode with bad pointers",
        }
    }
}

/// Outcome of a classification attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Set,
    /// The block was already claimed; nothing was overwritten
    Collision(BlockTag),
    OutOfRange,
}

pub struct BlockMap {
    tags: Vec<BlockTag>,
}

impl BlockMap {
    /// A map of `total_blocks` free entries
    pub fn new(total_blocks: u64) -> Result<Self> {
        let len = usize::try_from(total_blocks)
            .map_err(|_| FsckError::Other(format!("{} blocks cannot be tracked", total_blocks)))?;
        let mut tags = Vec::new();
        tags.try_reserve_exact(len).map_err(|e| {
            FsckError::Other(format!("unable to allocate the block map for {} blocks: {}", len, e))
        })?;
        tags.resize(len, BlockTag::Free);
        Ok(Self { tags })
    }

    pub fn len(&self) -> u64 {
        self.tags.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Tag of `addr`; addresses past the end read as invalid
    pub fn get(&self, addr: u64) -> BlockTag {
        self.tags.get(addr as usize).copied().unwrap_or(BlockTag::Invalid)
    }

    /// Whether `addr` may be referenced by an inode's tree
    pub fn check_range(&self, addr: u64) -> bool {
        addr < self.len() && self.tags[addr as usize] != BlockTag::RegionMeta
    }

    /// Classify a block. Only a free block may be classified; re-marking an
    /// invalid block as invalid is a no-op. Anything else is reported as a
    /// collision and left untouched.
    pub fn set(&mut self, addr: u64, tag: BlockTag, reason: &str) -> SetOutcome {
        let Some(slot) = self.tags.get_mut(addr as usize) else {
            return SetOutcome::OutOfRange;
        };
        let current = *slot;
        if current == BlockTag::Free || (current == BlockTag::Invalid && tag == BlockTag::Invalid) {
            trace!("Block {} ({}) marked as {}", addr, reason, tag.describe());
            *slot = tag;
            SetOutcome::Set
        } else {
            SetOutcome::Collision(current)
        }
    }

    /// Overwrite a classification; used when invalidating or resolving
    pub fn reset(&mut self, addr: u64, tag: BlockTag, reason: &str) {
        if let Some(slot) = self.tags.get_mut(addr as usize) {
            trace!("Block {} ({}) changed from {} to {}", addr, reason, slot.describe(), tag.describe());
            *slot = tag;
        }
    }

    /// Addresses whose tag satisfies `pred`, in ascending order
    pub fn find<F: Fn(BlockTag) -> bool>(&self, pred: F) -> Vec<u64> {
        self.tags
            .iter()
            .enumerate()
            .filter(|(_, &t)| pred(t))
            .map(|(i, _)| i as u64)
            .collect()
    }

    pub fn count(&self, tag: BlockTag) -> u64 {
        self.tags.iter().filter(|&&t| t == tag).count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_set_on_free() {
        let mut map = BlockMap::new(16).unwrap();
        assert_eq!(map.set(4, BlockTag::Indirect, "test"), SetOutcome::Set);
        assert_eq!(map.get(4), BlockTag::Indirect);
        assert_eq!(map.count(BlockTag::Free), 15);
    }

    #[test]
    fn test_collision_does_not_overwrite() {
        let mut map = BlockMap::new(16).unwrap();
        map.set(4, BlockTag::Used, "first owner");
        assert_eq!(map.set(4, BlockTag::Indirect, "second owner"), SetOutcome::Collision(BlockTag::Used));
        assert_eq!(map.get(4), BlockTag::Used);
    }

    #[test]
    fn test_claimed_invalid_block_collides() {
        let mut map = BlockMap::new(16).unwrap();
        map.set(9, BlockTag::Invalid, "bad header");
        assert_eq!(map.set(9, BlockTag::Invalid, "bad header again"), SetOutcome::Set);
        assert_eq!(map.set(9, BlockTag::Indirect, "other owner"), SetOutcome::Collision(BlockTag::Invalid));
    }

    #[test]
    fn test_check_range_excludes_region_meta() {
        let mut map = BlockMap::new(16).unwrap();
        map.reset(0, BlockTag::RegionMeta, "superblock");
        assert!(!map.check_range(0));
        assert!(map.check_range(1));
        assert!(!map.check_range(16));
        assert_eq!(map.set(16, BlockTag::Used, "past end"), SetOutcome::OutOfRange);
    }

    #[test]
    fn test_bitmap_states() {
        assert_eq!(BlockTag::Invalid.bitmap_state(), BlockState::Free);
        assert_eq!(BlockTag::BadPointerSource.bitmap_state(), BlockState::Dinode);
        assert_eq!(BlockTag::InodeSocket.bitmap_state(), BlockState::Dinode);
        assert_eq!(BlockTag::Journal.bitmap_state(), BlockState::Used);
        assert_eq!(BlockTag::DirLeaf.bitmap_state(), BlockState::Used);
    }

    fn any_tag() -> impl Strategy<Value = BlockTag> {
        prop_oneof![
            Just(BlockTag::Used),
            Just(BlockTag::InodeFile),
            Just(BlockTag::InodeDir),
            Just(BlockTag::Indirect),
            Just(BlockTag::DirLeaf),
            Just(BlockTag::EattrLeaf),
            Just(BlockTag::Journal),
            Just(BlockTag::Invalid),
        ]
    }

    proptest! {
        #[test]
        fn prop_first_claim_wins(claims in proptest::collection::vec((0u64..32, any_tag()), 1..100)) {
            let mut map = BlockMap::new(32).unwrap();
            let mut first: std::collections::HashMap<u64, BlockTag> = Default::default();
            for (addr, tag) in claims {
                let outcome = map.set(addr, tag, "prop");
                match first.get(&addr) {
                    None => {
                        prop_assert_eq!(outcome, SetOutcome::Set);
                        first.insert(addr, tag);
                    }
                    Some(&owner) => {
                        if !(owner == BlockTag::Invalid && tag == BlockTag::Invalid) {
                            prop_assert_eq!(outcome, SetOutcome::Collision(owner));
                        }
                    }
                }
                prop_assert_eq!(map.get(addr), first[&addr]);
            }
        }
    }
}
