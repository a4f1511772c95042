// Releasing an inode's claims

use crate::blockmap::BlockTag;
use crate::context::FsckContext;
use crate::dups::RefKind;
use crate::format::{Inode, MetaType};
use crate::walker::{walk, PtrLoc, Visitor, WalkAction};
use log::{debug, info};
use rgfsck_core::Result;

/// Releases every block an inode owns. Blocks shared with another inode
/// only lose this inode's claim.
pub struct InvalidateVisitor {
    inode: u64,
    pub freed: u64,
}

impl InvalidateVisitor {
    pub fn new(inode: u64) -> Self {
        Self { inode, freed: 0 }
    }

    /// Drop the claim on a shared block. The children below it were
    /// classified through this inode, so they are released too unless
    /// another claimant still reads the block as the same metadata.
    fn release_shared(&mut self, ctx: &mut FsckContext, addr: u64, kind: Option<MetaType>) -> WalkAction {
        let walked_below = !ctx.dups.is_collider(addr, self.inode);
        let remaining = ctx.dups.remove_claimant(addr, self.inode);
        debug!(
            "Inode {} dropped its claim on shared block {} ({} references left)",
            self.inode, addr, remaining
        );
        let Some(kind) = kind else {
            return WalkAction::Invalidate;
        };
        let still_meta = ctx
            .dups
            .get(addr)
            .map(|r| r.refs.iter().any(|d| d.kind == RefKind::Meta(kind)))
            .unwrap_or(false);
        if walked_below && !still_meta {
            debug!("Releasing the blocks under shared {} {}", kind.describe(), addr);
            WalkAction::Continue
        } else {
            WalkAction::Invalidate
        }
    }

    fn release(&mut self, ctx: &mut FsckContext, loc: &PtrLoc, kind: Option<MetaType>) -> WalkAction {
        if !ctx.blockmap.check_range(loc.addr) {
            return WalkAction::Invalidate;
        }
        if ctx.dups.contains(loc.addr) {
            return self.release_shared(ctx, loc.addr, kind);
        }
        if ctx.blockmap.get(loc.addr).is_tree_block() {
            ctx.blockmap.reset(loc.addr, BlockTag::Free, "released by invalidated inode");
            ctx.invalid_refs.remove(&loc.addr);
            self.freed += 1;
            return WalkAction::Continue;
        }
        WalkAction::Invalidate
    }
}

impl Visitor for InvalidateVisitor {
    fn on_indirect(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.release(ctx, loc, Some(MetaType::Indirect)))
    }

    fn on_data(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc) -> Result<WalkAction> {
        Ok(self.release(ctx, loc, None))
    }

    fn on_dir_leaf(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.release(ctx, loc, Some(MetaType::DirLeaf)))
    }

    fn on_eattr_indirect(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.release(ctx, loc, Some(MetaType::EattrIndirect)))
    }

    fn on_eattr_leaf(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(self.release(ctx, loc, Some(MetaType::EattrLeaf)))
    }
}

/// Release the tree of `inode` and classify its own block as `final_tag`.
/// The inode stops taking part in link and directory accounting.
pub fn invalidate_inode(ctx: &mut FsckContext, inode: u64, final_tag: BlockTag, reason: &str) -> Result<()> {
    if let Some(ip) = ctx.read_inode(inode)? {
        let mut visitor = InvalidateVisitor::new(inode);
        walk(ctx, &ip, &mut visitor)?;
        debug!("Inode {} released {} blocks", inode, visitor.freed);
    }

    if ctx.dups.contains(inode) {
        ctx.dups.remove_claimant(inode, inode);
    } else if ctx.blockmap.get(inode).is_inode() || ctx.blockmap.get(inode) == BlockTag::Invalid {
        ctx.blockmap.reset(inode, final_tag, reason);
    }
    ctx.dirs.remove(inode);
    ctx.links.remove(inode);
    ctx.deferred_counts.remove(&inode);
    info!("Inode {} invalidated: {}", inode, reason);
    Ok(())
}
