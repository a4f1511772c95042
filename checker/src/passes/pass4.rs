// Pass 4: reconcile link counts

use super::{interrupted, PassId, PassStatus};
use crate::blockmap::BlockTag;
use crate::context::FsckContext;
use crate::invalidate::invalidate_inode;
use crate::lost_found;
use log::debug;
use rgfsck_core::Result;

/// Returns false when the inode is gone and needs no count check
fn handle_unlinked(ctx: &mut FsckContext, addr: u64, tag: BlockTag) -> Result<bool> {
    if tag == BlockTag::BadPointerSource {
        let problem = format!("Unlinked inode {} has pointers outside the filesystem", addr);
        if ctx.fix(&problem, "Delete the inode?") {
            invalidate_inode(ctx, addr, BlockTag::Free, "unlinked with bad pointers")?;
            return Ok(false);
        }
    }
    let Some(ip) = ctx.read_inode(addr)? else {
        return Ok(false);
    };

    if ip.size == 0 && ip.eattr == 0 && !ip.is_dir() {
        let problem = format!("Unlinked inode {} is empty", addr);
        if ctx.fix(&problem, "Clear it?") {
            invalidate_inode(ctx, addr, BlockTag::Free, "empty unlinked inode")?;
            return Ok(false);
        }
        return Ok(false);
    }

    let problem = format!("Inode {} is not linked from any directory", addr);
    if ctx.fix(&problem, "Move it to lost+found?") {
        return lost_found::attach(ctx, addr);
    }
    Ok(false)
}

fn fix_count(ctx: &mut FsckContext, addr: u64) -> Result<()> {
    let Some(record) = ctx.links.get(addr) else {
        return Ok(());
    };
    if record.counted == record.stored || record.counted == 0 {
        return Ok(());
    }
    let Some(mut ip) = ctx.read_inode(addr)? else {
        return Ok(());
    };
    if ip.is_system() {
        return Ok(());
    }
    let problem = format!(
        "Inode {} has link count {}, but {} links were found",
        addr, record.stored, record.counted
    );
    if ctx.fix(&problem, "Update the link count?") {
        ip.nlink = record.counted;
        ctx.write_inode(&ip)?;
        ctx.links.set_stored(addr, record.counted);
    }
    Ok(())
}

pub fn run(ctx: &mut FsckContext) -> Result<PassStatus> {
    let inodes = ctx.links.addrs();
    let total = inodes.len() as u64;
    for (n, addr) in inodes.into_iter().enumerate() {
        if let Some(status) = interrupted(ctx) {
            return Ok(status);
        }
        ctx.report_progress(PassId::Pass4, n as u64, total);

        let tag = ctx.blockmap.get(addr);
        if !tag.is_inode() {
            debug!("Skipping link record of released block {}", addr);
            ctx.links.remove(addr);
            continue;
        }
        let Some(record) = ctx.links.get(addr) else {
            continue;
        };
        if record.counted == 0 && !handle_unlinked(ctx, addr, tag)? {
            continue;
        }
        fix_count(ctx, addr)?;
    }

    // lost+found may have gained links after its own record was visited
    let lost_found = ctx.sb.lost_found;
    if lost_found != 0 {
        fix_count(ctx, lost_found)?;
    }
    Ok(PassStatus::Completed)
}
