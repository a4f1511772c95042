// Pass 1b: settle blocks claimed by more than one owner

use super::{interrupted, PassId, PassStatus};
use crate::blockmap::BlockTag;
use crate::context::FsckContext;
use crate::dups::{DupRef, RefKind};
use crate::format::{is_meta, Inode, MetaType};
use crate::invalidate::invalidate_inode;
use crate::walker::{walk, PtrLoc, Visitor, WalkAction};
use log::{error, info, warn};
use rgfsck_core::Result;
use std::collections::BTreeSet;

fn meta_tag(kind: MetaType) -> BlockTag {
    match kind {
        MetaType::Indirect => BlockTag::Indirect,
        MetaType::DirLeaf => BlockTag::DirLeaf,
        MetaType::EattrIndirect => BlockTag::EattrIndirect,
        MetaType::EattrLeaf => BlockTag::EattrLeaf,
        _ => BlockTag::Used,
    }
}

/// Re-walks inodes and records every reference to a disputed block
struct RecountVisitor;

impl RecountVisitor {
    fn note(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc, kind: RefKind) -> WalkAction {
        if !ctx.blockmap.check_range(loc.addr) {
            return WalkAction::Invalidate;
        }
        if ctx.dups.contains(loc.addr) {
            ctx.dups.add_recounted(loc.addr, DupRef { inode: ip.addr, kind, loc: Some(*loc) });
            return WalkAction::Invalidate;
        }
        match kind {
            RefKind::Meta(t) if ctx.blockmap.get(loc.addr) != meta_tag(t) => WalkAction::Invalidate,
            _ => WalkAction::Continue,
        }
    }
}

impl Visitor for RecountVisitor {
    fn on_indirect(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.note(ctx, ip, loc, RefKind::Meta(MetaType::Indirect)))
    }

    fn on_data(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc) -> Result<WalkAction> {
        Ok(self.note(ctx, ip, loc, RefKind::Data))
    }

    fn on_dir_leaf(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.note(ctx, ip, loc, RefKind::Meta(MetaType::DirLeaf)))
    }

    fn on_eattr_indirect(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.note(ctx, ip, loc, RefKind::Meta(MetaType::EattrIndirect)))
    }

    fn on_eattr_leaf(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.note(ctx, ip, loc, RefKind::Meta(MetaType::EattrLeaf)))
    }
}

/// Counts the blocks an inode's tree holds, the inode block included
#[derive(Default)]
pub(crate) struct BlockCounter {
    pub blocks: u64,
}

impl BlockCounter {
    fn count(&mut self, ctx: &FsckContext, loc: &PtrLoc) -> WalkAction {
        if !ctx.blockmap.check_range(loc.addr) {
            return WalkAction::Invalidate;
        }
        match ctx.blockmap.get(loc.addr) {
            BlockTag::Free | BlockTag::Invalid => WalkAction::Invalidate,
            _ => {
                self.blocks += 1;
                if ctx.dups.contains(loc.addr) {
                    WalkAction::Invalidate
                } else {
                    WalkAction::Continue
                }
            }
        }
    }
}

impl Visitor for BlockCounter {
    fn on_indirect(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.count(ctx, loc))
    }

    fn on_data(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc) -> Result<WalkAction> {
        Ok(self.count(ctx, loc))
    }

    fn on_dir_leaf(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.count(ctx, loc))
    }

    fn on_eattr_indirect(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.count(ctx, loc))
    }

    fn on_eattr_leaf(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.count(ctx, loc))
    }
}

/// Give a block to its last remaining claimant. A metadata block whose
/// contents do not match the claim loses the claimant's pointer instead.
fn settle(ctx: &mut FsckContext, block: u64, owner: &DupRef) -> Result<()> {
    match owner.kind {
        RefKind::Inode => {
            let tag = ctx
                .read_inode(block)?
                .and_then(|ip| ip.kind())
                .map(BlockTag::for_kind)
                .unwrap_or(BlockTag::Invalid);
            ctx.blockmap.reset(block, tag, "duplicate settled");
        }
        RefKind::Data => {
            let tag = if owner.inode == ctx.sb.journal { BlockTag::Journal } else { BlockTag::Used };
            ctx.blockmap.reset(block, tag, "duplicate settled");
        }
        RefKind::Meta(kind) => {
            let contents = ctx.read_block(block)?;
            if is_meta(&contents, kind) {
                ctx.blockmap.reset(block, meta_tag(kind), "duplicate settled");
                return Ok(());
            }
            let problem = format!(
                "Inode {} points to block {}, which is not a valid {}",
                owner.inode,
                block,
                kind.describe()
            );
            match owner.loc {
                Some(loc) if ctx.fix(&problem, "Clear the pointer?") => {
                    ctx.write_pointer(&loc, 0)?;
                    ctx.blockmap.reset(block, BlockTag::Free, "cleared bad reference");
                    ctx.deferred_counts.insert(owner.inode);
                }
                _ => ctx.blockmap.reset(block, BlockTag::Invalid, "duplicate settled"),
            }
        }
    }
    Ok(())
}

/// One inode referring to the same block more than once
fn resolve_self_duplicate(ctx: &mut FsckContext, block: u64, refs: Vec<DupRef>) -> Result<()> {
    let inode = refs[0].inode;
    let problem = format!("Inode {} references block {} {} times", inode, block, refs.len());
    if ctx.fix(&problem, &format!("Clear inode {}?", inode)) {
        // Without a record the block and its children are released like
        // any other block of the inode
        ctx.dups.remove(block);
        invalidate_inode(ctx, inode, BlockTag::Invalid, "repeated block references")?;
        let tag = if refs.iter().any(|r| r.kind == RefKind::Inode) {
            BlockTag::Invalid
        } else {
            BlockTag::Free
        };
        ctx.blockmap.reset(block, tag, "unclaimed duplicate");
        return Ok(());
    }
    let keep = refs.iter().find(|r| r.kind == RefKind::Inode).unwrap_or(&refs[0]);
    settle(ctx, block, keep)
}

fn resolve(ctx: &mut FsckContext, block: u64) -> Result<()> {
    let Some(record) = ctx.dups.get(block).cloned() else {
        return Ok(());
    };
    if !record.first_ref_found {
        warn!("The original owner of duplicate block {} was not found again", block);
    }

    let claimants = record.claimants();
    match claimants.len() {
        0 => {
            info!("Duplicate block {} has no remaining claimants", block);
            ctx.blockmap.reset(block, BlockTag::Free, "unclaimed duplicate");
            ctx.dups.remove(block);
            return Ok(());
        }
        1 if record.ref_count() == 1 => {
            info!("Block {} has a single claimant after all; not a duplicate", block);
            settle(ctx, block, &record.refs[0])?;
            ctx.dups.remove(block);
            return Ok(());
        }
        1 => {
            resolve_self_duplicate(ctx, block, record.refs.clone())?;
            ctx.dups.remove(block);
            return Ok(());
        }
        _ => {}
    }

    error!("Block {} is claimed by {} inodes: {:?}", block, claimants.len(), claimants);

    // Claimants holding the block as their own inode are asked last
    let (mut order, inode_owners): (Vec<u64>, Vec<u64>) = claimants
        .iter()
        .copied()
        .partition(|&c| record.refs_of(c).all(|r| r.kind != RefKind::Inode));
    order.extend(inode_owners);

    let mut remaining = claimants.len();
    for inode in order {
        if remaining <= 1 {
            break;
        }
        let kinds: Vec<&str> = record.refs_of(inode).map(|r| r.kind.describe()).collect();
        let problem = format!(
            "Inode {} shares block {} ({}) with {} other inode(s)",
            inode,
            block,
            kinds.join(", "),
            remaining - 1
        );
        if ctx.fix(&problem, &format!("Clear inode {}?", inode)) {
            invalidate_inode(ctx, inode, BlockTag::Invalid, "duplicate block resolution")?;
            ctx.dups.remove_claimant(block, inode);
            remaining -= 1;
        }
    }

    let Some(record) = ctx.dups.get(block).cloned() else {
        return Ok(());
    };
    let survivors = record.claimants();
    if survivors.len() == 1 {
        let refs: Vec<DupRef> = record.refs_of(survivors[0]).copied().collect();
        if refs.len() > 1 {
            resolve_self_duplicate(ctx, block, refs)?;
        } else {
            settle(ctx, block, &refs[0])?;
        }
        ctx.dups.remove(block);
    } else if survivors.is_empty() {
        ctx.blockmap.reset(block, BlockTag::Free, "unclaimed duplicate");
        ctx.dups.remove(block);
    } else {
        warn!("Block {} is still shared by {} inodes", block, survivors.len());
    }
    Ok(())
}

/// Re-check block counts postponed by pass 1
fn recheck_counts(ctx: &mut FsckContext) -> Result<()> {
    let deferred: Vec<u64> = std::mem::take(&mut ctx.deferred_counts).into_iter().collect();
    for addr in deferred {
        let tag = ctx.blockmap.get(addr);
        if !tag.is_inode() || tag == BlockTag::BadPointerSource {
            continue;
        }
        let Some(mut ip) = ctx.read_inode(addr)? else {
            continue;
        };
        let mut counter = BlockCounter::default();
        walk(ctx, &ip, &mut counter)?;
        let expected = 1 + counter.blocks;
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

pub fn run(ctx: &mut FsckContext) -> Result<PassStatus> {
    if ctx.dups.is_empty() {
        recheck_counts(ctx)?;
        return Ok(PassStatus::Completed);
    }
    info!("{} blocks are claimed more than once", ctx.dups.len());

    ctx.dups.begin_recount();
    for block in ctx.dups.blocks() {
        if ctx.blockmap.get(block).is_inode() {
            ctx.dups.add_recounted(block, DupRef { inode: block, kind: RefKind::Inode, loc: None });
        }
    }

    let mut inodes: BTreeSet<u64> = ctx.blockmap.find(|t| t.is_inode()).into_iter().collect();
    inodes.extend(ctx.dups.inode_claimants());
    inodes.extend(ctx.deferred_counts.iter().copied());
    let total = inodes.len() as u64;
    for (n, addr) in inodes.into_iter().enumerate() {
        if let Some(status) = interrupted(ctx) {
            return Ok(status);
        }
        ctx.report_progress(PassId::Pass1b, n as u64, total);
        if let Some(ip) = ctx.read_inode(addr)? {
            walk(ctx, &ip, &mut RecountVisitor)?;
        }
    }

    for block in ctx.dups.blocks() {
        if let Some(status) = interrupted(ctx) {
            return Ok(status);
        }
        resolve(ctx, block)?;
    }

    recheck_counts(ctx)?;
    Ok(PassStatus::Completed)
}
