// Pass 1: classify every block reachable from an inode

use super::{interrupted, PassId, PassStatus};
use crate::blockmap::{BlockTag, SetOutcome};
use crate::context::FsckContext;
use crate::dups::{DupRef, RefKind};
use crate::format::inode::MAX_TREE_HEIGHT;
use crate::format::{is_meta, BlockState, FileKind, Inode, MetaType};
use crate::walker::{walk, PtrLoc, Visitor, WalkAction, WalkOutcome};
use log::{debug, info, warn};
use rgfsck_core::Result;
use std::collections::HashSet;

/// Claims the blocks of one inode's tree in the block map
struct ClassifyVisitor {
    tolerance: u32,
    journal: bool,
    bad_pointers: u32,
    dup_pointers: u32,
    /// Tree blocks counted toward the inode's block total
    tally: u64,
    claimed: HashSet<u64>,
}

impl ClassifyVisitor {
    fn new(tolerance: u32, journal: bool) -> Self {
        Self {
            tolerance,
            journal,
            bad_pointers: 0,
            dup_pointers: 0,
            tally: 0,
            claimed: HashSet::new(),
        }
    }

    fn over_tolerance(&self) -> bool {
        self.bad_pointers + self.dup_pointers > self.tolerance
    }

    fn stop_or_skip(&self) -> WalkAction {
        if self.over_tolerance() {
            WalkAction::Abort
        } else {
            WalkAction::Invalidate
        }
    }

    fn out_of_range(&mut self, ip: &Inode, loc: &PtrLoc) -> WalkAction {
        self.bad_pointers += 1;
        warn!(
            "Inode {} has a pointer to block {} outside the filesystem (at {}+{})",
            ip.addr, loc.addr, loc.parent, loc.offset
        );
        self.stop_or_skip()
    }

    fn claim(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc, tag: BlockTag, kind: RefKind) -> WalkAction {
        match ctx.blockmap.set(loc.addr, tag, kind.describe()) {
            SetOutcome::Set => {
                self.claimed.insert(loc.addr);
                self.tally += 1;
                WalkAction::Continue
            }
            SetOutcome::Collision(previous) => {
                info!(
                    "Inode {} claims block {} as {}, already marked {}",
                    ip.addr,
                    loc.addr,
                    kind.describe(),
                    previous.describe()
                );
                ctx.dups.add_collision(loc.addr, DupRef { inode: ip.addr, kind, loc: Some(*loc) });
                self.dup_pointers += 1;
                self.tally += 1;
                self.stop_or_skip()
            }
            SetOutcome::OutOfRange => self.out_of_range(ip, loc),
        }
    }

    fn claim_meta(
        &mut self,
        ctx: &mut FsckContext,
        ip: &Inode,
        loc: &PtrLoc,
        block: Option<&[u8]>,
        expected: MetaType,
        tag: BlockTag,
    ) -> WalkAction {
        if !ctx.blockmap.check_range(loc.addr) {
            return self.out_of_range(ip, loc);
        }
        // A second claim on any block is a duplicate, whatever it holds
        if ctx.blockmap.get(loc.addr) != BlockTag::Free {
            return self.claim(ctx, ip, loc, tag, RefKind::Meta(expected));
        }
        if !block.map(|b| is_meta(b, expected)).unwrap_or(false) {
            debug!(
                "Inode {} points to block {}, which is not a valid {}",
                ip.addr,
                loc.addr,
                expected.describe()
            );
            ctx.blockmap.set(loc.addr, BlockTag::Invalid, "bad metadata header");
            ctx.invalid_refs.insert(loc.addr, (ip.addr, *loc));
            self.claimed.insert(loc.addr);
            return WalkAction::Invalidate;
        }
        self.claim(ctx, ip, loc, tag, RefKind::Meta(expected))
    }
}

impl Visitor for ClassifyVisitor {
    fn on_indirect(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc, block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.claim_meta(ctx, ip, loc, block, MetaType::Indirect, BlockTag::Indirect))
    }

    fn on_data(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc) -> Result<WalkAction> {
        if !ctx.blockmap.check_range(loc.addr) {
            return Ok(self.out_of_range(ip, loc));
        }
        let tag = if self.journal { BlockTag::Journal } else { BlockTag::Used };
        Ok(self.claim(ctx, ip, loc, tag, RefKind::Data))
    }

    fn on_dir_leaf(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc, block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.claim_meta(ctx, ip, loc, block, MetaType::DirLeaf, BlockTag::DirLeaf))
    }

    fn on_eattr_indirect(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc, block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.claim_meta(ctx, ip, loc, block, MetaType::EattrIndirect, BlockTag::EattrIndirect))
    }

    fn on_eattr_leaf(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc, block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.claim_meta(ctx, ip, loc, block, MetaType::EattrLeaf, BlockTag::EattrLeaf))
    }
}

/// Rolls back the claims of an aborted classification walk
struct UndoVisitor {
    inode: u64,
    claimed: HashSet<u64>,
}

impl UndoVisitor {
    fn undo(&mut self, ctx: &mut FsckContext, loc: &PtrLoc) -> WalkAction {
        if self.claimed.remove(&loc.addr) {
            let was_meta = ctx.blockmap.get(loc.addr) != BlockTag::Invalid;
            ctx.blockmap.reset(loc.addr, BlockTag::Free, "undo of aborted inode");
            ctx.invalid_refs.remove(&loc.addr);
            if was_meta {
                return WalkAction::Continue;
            }
        } else if ctx.dups.contains(loc.addr) {
            ctx.dups.remove_claimant(loc.addr, self.inode);
        }
        WalkAction::Invalidate
    }
}

impl Visitor for UndoVisitor {
    fn on_indirect(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.undo(ctx, loc))
    }

    fn on_data(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc) -> Result<WalkAction> {
        Ok(self.undo(ctx, loc))
    }

    fn on_dir_leaf(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.undo(ctx, loc))
    }

    fn on_eattr_indirect(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.undo(ctx, loc))
    }

    fn on_eattr_leaf(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.undo(ctx, loc))
    }
}

/// Classify a block that was allocated as an inode but cannot be one
fn reject_inode_block(ctx: &mut FsckContext, addr: u64, problem: &str) -> Result<()> {
    if ctx.blockmap.get(addr) == BlockTag::Free {
        ctx.blockmap.set(addr, BlockTag::Invalid, "rejected inode");
    }
    if ctx.fix(problem, "Free the block?") {
        if let Some(idx) = ctx.region_index(addr) {
            let region = &mut ctx.regions[idx];
            let i = (addr - region.header.data0) as u32;
            region.bitmap.set(i, BlockState::Free);
            ctx.write_region(idx)?;
        }
    }
    Ok(())
}

fn check_inode(ctx: &mut FsckContext, addr: u64) -> Result<()> {
    let block = ctx.read_block(addr)?;
    let Some(mut ip) = Inode::decode(&block) else {
        return reject_inode_block(
            ctx,
            addr,
            &format!("Block {} is allocated as an inode but has no inode header", addr),
        );
    };

    if ip.addr != addr {
        let problem = format!("Inode at block {} records its address as {}", addr, ip.addr);
        ip.addr = addr;
        if ctx.fix(&problem, "Fix the inode address?") {
            ctx.write_inode(&ip)?;
        }
    }
    ctx.max_formal = ctx.max_formal.max(ip.formal);

    let Some(kind) = ip.kind() else {
        return reject_inode_block(ctx, addr, &format!("Inode {} has invalid mode {:o}", addr, ip.mode));
    };
    if ip.height > MAX_TREE_HEIGHT {
        return reject_inode_block(
            ctx,
            addr,
            &format!("Inode {} has impossible tree height {}", addr, ip.height),
        );
    }

    let tag = BlockTag::for_kind(kind);
    let own_block = match ctx.blockmap.set(addr, tag, "inode") {
        SetOutcome::Set => true,
        _ => {
            info!("Inode {} lives in a block that is already claimed", addr);
            ctx.dups.add_collision(addr, DupRef { inode: addr, kind: RefKind::Inode, loc: None });
            ctx.deferred_counts.insert(addr);
            false
        }
    };
    if kind == FileKind::Directory {
        ctx.dirs.insert(addr);
    }
    if !ip.is_system() {
        ctx.links.set_stored(addr, ip.nlink);
    }

    let journal = addr == ctx.sb.journal;
    let tolerance = ctx.options.bad_pointer_tolerance;
    let mut visitor = ClassifyVisitor::new(tolerance, journal);
    let outcome = walk(ctx, &ip, &mut visitor)?;

    if outcome == WalkOutcome::Aborted {
        let problem = format!(
            "Inode {} has more than {} bad or duplicate pointers",
            addr, tolerance
        );
        if ctx.fix(&problem, "Invalidate the inode and free its blocks?") {
            let mut undo = UndoVisitor { inode: addr, claimed: visitor.claimed };
            walk(ctx, &ip, &mut undo)?;
            ctx.deferred_counts.remove(&addr);
            ctx.dirs.remove(addr);
            ctx.links.remove(addr);
            if own_block {
                ctx.blockmap.reset(addr, BlockTag::Free, "invalidated inode");
            } else {
                ctx.dups.remove_claimant(addr, addr);
            }
        } else if own_block {
            ctx.blockmap.reset(addr, BlockTag::BadPointerSource, "too many bad pointers");
        }
        return Ok(());
    }

    if visitor.bad_pointers > 0 {
        warn!(
            "Inode {} has {} pointers outside the filesystem; it will be offered for deletion",
            addr, visitor.bad_pointers
        );
        if own_block {
            ctx.blockmap.reset(addr, BlockTag::BadPointerSource, "bad pointers");
        }
        return Ok(());
    }

    if visitor.dup_pointers > 0 {
        ctx.deferred_counts.insert(addr);
        return Ok(());
    }

    if !ctx.deferred_counts.contains(&addr) {
        let expected = 1 + visitor.tally;
        if ip.blocks != expected {
            let problem = format!("Inode {} block count is {}, should be {}", addr, ip.blocks, expected);
            if ctx.fix(&problem, "Fix the block count?") {
                ip.blocks = expected;
                ctx.write_inode(&ip)?;
            }
        }
    }
    Ok(())
}

/// Offer to clear pointers to blocks that failed their header check and
/// that no other inode claims
fn clear_invalid_refs(ctx: &mut FsckContext) -> Result<()> {
    let pending: Vec<(u64, (u64, PtrLoc))> = ctx.invalid_refs.iter().map(|(b, r)| (*b, *r)).collect();
    for (block, (inode, loc)) in pending {
        if ctx.dups.contains(block) || ctx.blockmap.get(block) != BlockTag::Invalid {
            continue;
        }
        if !ctx.blockmap.get(inode).is_inode() {
            continue;
        }
        let problem = format!("Inode {} points to block {}, which holds no valid metadata", inode, block);
        if ctx.fix(&problem, "Clear the pointer?") {
            ctx.write_pointer(&loc, 0)?;
            ctx.blockmap.reset(block, BlockTag::Free, "cleared bad reference");
            ctx.invalid_refs.remove(&block);
        }
    }
    Ok(())
}

/// Create an empty root directory
fn create_root(ctx: &mut FsckContext) -> Result<bool> {
    let Some(addr) = ctx.allocate_block(BlockTag::InodeDir, "root directory")? else {
        ctx.unfixable("No free block is left for a new root directory");
        return Ok(false);
    };
    let formal = ctx.next_formal();
    let mut ip = Inode::new(addr, formal, FileKind::Directory, 0o755);
    ip.nlink = 2;
    ip.blocks = 1;
    let mut block = crate::format::new_meta_block(ctx.block_size(), MetaType::Inode);
    ip.encode_into(&mut block);
    ctx.write_block(addr, &block)?;
    for name in [&b"."[..], &b".."[..]] {
        crate::dir::add_entry(ctx, addr, name, addr, formal, crate::format::DirEntryType::Dir)?;
    }

    ctx.dirs.insert(addr);
    ctx.links.set_stored(addr, 2);
    ctx.sb.root_dir = addr;
    ctx.write_superblock()?;
    info!("Created a new root directory at block {}", addr);
    Ok(true)
}

/// Root, lost+found and journal must be intact before the tree passes
fn check_system_inodes(ctx: &mut FsckContext) -> Result<()> {
    let root = ctx.sb.root_dir;
    if ctx.blockmap.get(root) != BlockTag::InodeDir {
        let problem = format!("Root directory at block {} is missing or damaged", root);
        if ctx.fix(&problem, "Create a new root directory?") {
            create_root(ctx)?;
        }
    }

    let lost_found = ctx.sb.lost_found;
    if lost_found != 0 && ctx.blockmap.get(lost_found) != BlockTag::InodeDir {
        let problem = format!("lost+found at block {} is not a directory", lost_found);
        if ctx.fix(&problem, "Forget it so a new one can be made?") {
            ctx.sb.lost_found = 0;
            ctx.write_superblock()?;
        }
    }

    let journal = ctx.sb.journal;
    if journal != 0 && ctx.blockmap.get(journal) != BlockTag::InodeFile {
        ctx.unfixable(&format!("Journal inode at block {} is missing or damaged", journal));
    }
    Ok(())
}

pub fn run(ctx: &mut FsckContext) -> Result<PassStatus> {
    let mut inodes = Vec::new();
    for region in &ctx.regions {
        let data0 = region.header.data0;
        inodes.extend(region.bitmap.iter_state(BlockState::Dinode).map(|i| data0 + i as u64));
    }
    let total = inodes.len() as u64;

    for (n, addr) in inodes.into_iter().enumerate() {
        if let Some(status) = interrupted(ctx) {
            return Ok(status);
        }
        ctx.report_progress(PassId::Pass1, n as u64, total);
        check_inode(ctx, addr)?;
    }

    clear_invalid_refs(ctx)?;
    check_system_inodes(ctx)?;
    Ok(PassStatus::Completed)
}

