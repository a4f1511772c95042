// Engine context threaded through every pass and visitor

use crate::blockmap::{BlockMap, BlockTag};
use crate::cancel::{CancelState, CancelToken};
use crate::decision::{DecisionPort, RepairDecision, RepairStats};
use crate::device::BlockDevice;
use crate::dirtree::DirTracker;
use crate::dups::DupTracker;
use crate::format::inode::{INODE_EATTR_OFFSET, INODE_FLAG_EA_INDIRECT};
use crate::format::{write_u64_at, BlockState, Inode, RegionBitmap, RegionHeader, Superblock};
use crate::links::LinkTracker;
use crate::passes::PassId;
use crate::progress::{NoOpProgress, PassProgress, ProgressReporter};
use crate::walker::PtrLoc;
use log::{debug, info};
use rgfsck_core::{CheckOptions, FsckError, Result};
use std::collections::{BTreeMap, BTreeSet};

/// An allocation region as held in memory for the run
#[derive(Debug, Clone)]
pub struct Region {
    pub header: RegionHeader,
    pub bitmap: RegionBitmap,
}

/// Single owner of all checker state for one run
pub struct FsckContext {
    dev: Box<dyn BlockDevice>,
    pub sb: Superblock,
    pub regions: Vec<Region>,
    pub blockmap: BlockMap,
    pub dups: DupTracker,
    pub dirs: DirTracker,
    pub links: LinkTracker,
    /// Blocks marked invalid by a pointer walk, with their referrer
    pub invalid_refs: BTreeMap<u64, (u64, PtrLoc)>,
    /// Inodes whose block count is checked after duplicate resolution
    pub deferred_counts: BTreeSet<u64>,
    pub max_formal: u64,
    pub options: CheckOptions,
    decisions: DecisionPort,
    cancel: CancelToken,
    progress: Box<dyn ProgressReporter>,
}

impl FsckContext {
    pub(crate) fn new(
        dev: Box<dyn BlockDevice>,
        sb: Superblock,
        regions: Vec<Region>,
        blockmap: BlockMap,
        options: CheckOptions,
        decisions: Box<dyn RepairDecision>,
    ) -> Self {
        Self {
            dev,
            sb,
            regions,
            blockmap,
            dups: DupTracker::new(),
            dirs: DirTracker::new(),
            links: LinkTracker::new(),
            invalid_refs: BTreeMap::new(),
            deferred_counts: BTreeSet::new(),
            max_formal: 0,
            options,
            decisions: DecisionPort::new(decisions),
            cancel: CancelToken::new(),
            progress: Box::new(NoOpProgress),
        }
    }

    pub fn set_cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    pub fn set_progress(&mut self, progress: Box<dyn ProgressReporter>) {
        self.progress = progress;
    }

    pub fn block_size(&self) -> u32 {
        self.sb.block_size
    }

    pub fn writable(&self) -> bool {
        self.options.writable()
    }

    /// Address lies on the device; says nothing about what it may hold
    pub fn in_bounds(&self, addr: u64) -> bool {
        addr < self.sb.total_blocks
    }

    pub fn read_block(&mut self, addr: u64) -> Result<Vec<u8>> {
        if !self.in_bounds(addr) {
            return Err(FsckError::OutOfRange { addr, total: self.sb.total_blocks });
        }
        self.dev.read_block(addr)
    }

    pub fn write_block(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        if !self.writable() {
            return Err(FsckError::Other(format!("refusing to write block {} in read-only mode", addr)));
        }
        self.dev.write_block(addr, data)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.dev.sync()
    }

    pub fn into_device(self) -> Box<dyn BlockDevice> {
        self.dev
    }

    /// Inode stored at `addr`, or None if the block has no inode header
    pub fn read_inode(&mut self, addr: u64) -> Result<Option<Inode>> {
        if !self.in_bounds(addr) {
            return Ok(None);
        }
        let block = self.read_block(addr)?;
        Ok(Inode::decode(&block))
    }

    /// Rewrite the header of an inode, keeping its payload
    pub fn write_inode(&mut self, inode: &Inode) -> Result<()> {
        let mut block = self.read_block(inode.addr)?;
        inode.encode_into(&mut block);
        self.write_block(inode.addr, &block)
    }

    /// Overwrite the pointer at `loc`
    pub fn write_pointer(&mut self, loc: &PtrLoc, value: u64) -> Result<()> {
        let mut block = self.read_block(loc.parent)?;
        write_u64_at(&mut block, loc.offset, value);
        if value == 0 && loc.offset == INODE_EATTR_OFFSET {
            if let Some(mut inode) = Inode::decode(&block) {
                if inode.addr == loc.parent {
                    inode.flags &= !INODE_FLAG_EA_INDIRECT;
                    inode.encode_into(&mut block);
                }
            }
        }
        self.write_block(loc.parent, &block)
    }

    pub fn write_superblock(&mut self) -> Result<()> {
        let block = self.sb.encode()?;
        self.write_block(crate::format::SUPERBLOCK_ADDR, &block)
    }

    /// Write a region's header and bitmap blocks
    pub fn write_region(&mut self, index: usize) -> Result<()> {
        let bs = self.block_size();
        let region = &self.regions[index];
        let mut header_block = vec![0u8; bs as usize];
        region.header.encode_into(&mut header_block);
        let bitmap_blocks = region.bitmap.to_blocks(bs, region.header.bitmap_blocks);
        let start = region.header.start;
        let addrs: Vec<u64> = region.header.bitmap_addrs().collect();

        self.write_block(start, &header_block)?;
        for (addr, block) in addrs.into_iter().zip(bitmap_blocks) {
            self.write_block(addr, &block)?;
        }
        debug!("Region at block {} written", start);
        Ok(())
    }

    /// Region whose data area holds `addr`
    pub fn region_index(&self, addr: u64) -> Option<usize> {
        let idx = self.regions.partition_point(|r| r.header.end() <= addr);
        self.regions
            .get(idx)
            .filter(|r| r.header.contains_data(addr))
            .map(|_| idx)
    }

    /// On-disk allocation state of a data block
    pub fn bitmap_state(&self, addr: u64) -> Option<BlockState> {
        let idx = self.region_index(addr)?;
        let region = &self.regions[idx];
        Some(region.bitmap.get((addr - region.header.data0) as u32))
    }

    /// Claim a free block for the checker's own use. The bitmap, region
    /// counters and superblock totals are updated on disk immediately.
    pub fn allocate_block(&mut self, tag: BlockTag, reason: &str) -> Result<Option<u64>> {
        let mut found = None;
        'regions: for (idx, region) in self.regions.iter().enumerate() {
            for i in region.bitmap.iter_state(BlockState::Free) {
                let addr = region.header.data0 + i as u64;
                if self.blockmap.get(addr) == BlockTag::Free {
                    found = Some((idx, addr, i));
                    break 'regions;
                }
            }
        }
        let Some((idx, addr, i)) = found else {
            return Ok(None);
        };

        self.blockmap.set(addr, tag, reason);
        let state = tag.bitmap_state();
        let region = &mut self.regions[idx];
        region.bitmap.set(i, state);
        region.header.free = region.header.free.saturating_sub(1);
        self.sb.total_free = self.sb.total_free.saturating_sub(1);
        if state == BlockState::Dinode {
            region.header.dinodes += 1;
            self.sb.total_dinodes += 1;
        }
        self.write_region(idx)?;
        self.write_superblock()?;
        info!("Allocated block {} for {}", addr, reason);
        Ok(Some(addr))
    }

    pub fn next_formal(&mut self) -> u64 {
        self.max_formal += 1;
        self.max_formal
    }

    /// Report a problem and ask whether to repair it. A read-only run
    /// never asks.
    pub fn fix(&mut self, problem: &str, question: &str) -> bool {
        if !self.writable() {
            return self.decisions.decline(problem, question);
        }
        self.decisions.fix(problem, question)
    }

    pub fn unfixable(&mut self, problem: &str) {
        self.decisions.unfixable(problem)
    }

    pub fn stats(&self) -> RepairStats {
        self.decisions.stats()
    }

    pub fn poll_cancel(&self) -> CancelState {
        self.cancel.poll()
    }

    pub(crate) fn clear_skip(&self) {
        self.cancel.clear_skip();
    }

    pub(crate) fn report_progress(&self, pass: PassId, done: u64, total: u64) {
        self.progress.pass_progress(&PassProgress { pass, done, total });
    }

    pub(crate) fn progress(&self) -> &dyn ProgressReporter {
        self.progress.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{AutoYes, Scripted};
    use crate::image::{FsImage, ImageBuilder};
    use crate::init::open_context;
    use rgfsck_core::RepairMode;

    fn context(image: &FsImage, mode: RepairMode, decisions: Box<dyn RepairDecision>) -> FsckContext {
        let options = CheckOptions { repair_mode: mode, ..Default::default() };
        open_context(Box::new(image.device()), options, decisions).unwrap()
    }

    #[test]
    fn test_allocation_reaches_disk() {
        let image = ImageBuilder::new(1024, 128).build().unwrap();
        let before = image.read_superblock().unwrap();
        let mut ctx = context(&image, RepairMode::Yes, Box::new(AutoYes));

        let addr = ctx.allocate_block(BlockTag::InodeDir, "test").unwrap().unwrap();
        assert_ne!(addr, image.root());
        assert_eq!(ctx.blockmap.get(addr), BlockTag::InodeDir);
        assert_eq!(image.bitmap_state(addr).unwrap(), Some(BlockState::Dinode));

        let after = image.read_superblock().unwrap();
        assert_eq!(after.total_free, before.total_free - 1);
        assert_eq!(after.total_dinodes, before.total_dinodes + 1);
        let (free, dinodes) = image.region_counts(addr).unwrap().unwrap();
        assert_eq!(free as u64, after.total_free);
        assert_eq!(dinodes as u64, after.total_dinodes);
    }

    #[test]
    fn test_read_only_context_never_asks() {
        let image = ImageBuilder::new(1024, 128).build().unwrap();
        let scripted = Scripted::new([], true);
        let questions = scripted.questions();
        let mut ctx = context(&image, RepairMode::No, Box::new(scripted));

        assert!(!ctx.fix("something is wrong", "Fix it?"));
        assert!(questions.lock().unwrap().is_empty());
        assert_eq!(ctx.stats(), RepairStats { errors_found: 1, errors_corrected: 0 });
        assert!(ctx.write_block(5, &vec![0u8; 1024]).is_err());
    }

    #[test]
    fn test_clearing_eattr_pointer_drops_indirect_flag() {
        let mut image = ImageBuilder::new(1024, 128).build().unwrap();
        let root = image.root();
        let file = image.create_file(root, "f", 1).unwrap();
        image.add_eattr(file, 2).unwrap();
        assert!(image.inode(file).unwrap().has_ea_indirect());

        let mut ctx = context(&image, RepairMode::Yes, Box::new(AutoYes));
        let loc = PtrLoc { addr: image.inode(file).unwrap().eattr, parent: file, offset: INODE_EATTR_OFFSET };
        ctx.write_pointer(&loc, 0).unwrap();

        let ip = image.inode(file).unwrap();
        assert_eq!(ip.eattr, 0);
        assert_eq!(ip.flags & INODE_FLAG_EA_INDIRECT, 0);
    }

    #[test]
    fn test_region_index() {
        let image = ImageBuilder::new(1024, 600).regions(3).build().unwrap();
        let ctx = context(&image, RepairMode::No, Box::new(AutoYes));
        let second = &ctx.regions[1].header;
        assert_eq!(ctx.region_index(second.data0), Some(1));
        assert_eq!(ctx.region_index(second.start), None);
        assert_eq!(ctx.region_index(0), None);
        assert_eq!(ctx.region_index(599), Some(2));
    }
}
