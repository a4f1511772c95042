// Pass 3: every directory must reach the root

use super::{interrupted, PassId, PassStatus};
use crate::blockmap::BlockTag;
use crate::context::FsckContext;
use crate::dir;
use crate::invalidate::invalidate_inode;
use crate::lost_found;
use log::{error, warn};
use rgfsck_core::Result;

/// The directory above `addr`, reconciling ".." with the entry naming it.
/// None means `addr` is not named by any live directory.
fn parent_of(ctx: &mut FsckContext, addr: u64) -> Result<Option<u64>> {
    let Some(info) = ctx.dirs.get(addr).copied() else {
        return Ok(None);
    };
    let parent = info.treewalk_parent;
    if parent == 0 || ctx.blockmap.get(parent) != BlockTag::InodeDir {
        return Ok(None);
    }

    if info.dotdot_parent != parent {
        let problem = format!(
            "Directory {} has '..' pointing to {}, but it is named by directory {}",
            addr, info.dotdot_parent, parent
        );
        if ctx.fix(&problem, "Fix the '..' entry?") {
            dir::set_dotdot(ctx, addr, parent)?;
            if info.dotdot_parent != 0 {
                ctx.links.decrement(info.dotdot_parent);
            }
            ctx.links.increment(parent);
            ctx.dirs.set_dotdot_parent(addr, parent);
        }
    }
    Ok(Some(parent))
}

/// Deal with a directory that cannot reach the root. Returns true when
/// it ended up linked into lost+found.
fn handle_orphan(ctx: &mut FsckContext, addr: u64, in_loop: bool) -> Result<bool> {
    let Some(ip) = ctx.read_inode(addr)? else {
        return Ok(false);
    };

    if in_loop {
        let parent = ctx.dirs.get(addr).map(|d| d.treewalk_parent).unwrap_or(0);
        let problem = format!("Directory {} is part of a loop that does not reach the root", addr);
        if !ctx.fix(&problem, "Move it to lost+found?") {
            return Ok(false);
        }
        if parent != 0 {
            let removed = dir::remove_entries_to(ctx, parent, addr)?;
            for _ in 0..removed {
                ctx.links.decrement(addr);
            }
        }
        if let Some(info) = ctx.dirs.get_mut(addr) {
            info.treewalk_parent = 0;
        }
        return lost_found::attach(ctx, addr);
    }

    if ip.entries <= 2 && ip.eattr == 0 {
        let problem = format!("Directory {} is empty and not linked into the tree", addr);
        if ctx.fix(&problem, "Remove it?") {
            let dotdot = ctx.dirs.get(addr).map(|d| d.dotdot_parent).unwrap_or(0);
            if dotdot != 0 {
                ctx.links.decrement(dotdot);
            }
            invalidate_inode(ctx, addr, BlockTag::Free, "empty orphaned directory")?;
        }
        return Ok(false);
    }

    let problem = format!("Directory {} is not linked into the tree", addr);
    if ctx.fix(&problem, "Move it to lost+found?") {
        return lost_found::attach(ctx, addr);
    }
    Ok(false)
}

fn connect(ctx: &mut FsckContext, start: u64) -> Result<()> {
    let mut chain: Vec<u64> = Vec::new();
    let mut current = start;
    loop {
        if ctx.dirs.is_connected(current) {
            break;
        }
        if chain.contains(&current) {
            warn!("Directory {} closes a loop", current);
            if !handle_orphan(ctx, current, true)? {
                return Ok(());
            }
            break;
        }
        chain.push(current);
        match parent_of(ctx, current)? {
            Some(parent) => current = parent,
            None => {
                if !handle_orphan(ctx, current, false)? {
                    return Ok(());
                }
                break;
            }
        }
    }
    for dir in chain {
        ctx.dirs.mark_connected(dir);
    }
    Ok(())
}

pub fn run(ctx: &mut FsckContext) -> Result<PassStatus> {
    let root = ctx.sb.root_dir;
    if ctx.blockmap.get(root) == BlockTag::InodeDir {
        ctx.dirs.insert(root);
        ctx.dirs.mark_connected(root);
    } else {
        error!("No valid root directory; every directory is unreachable");
    }

    let dirs = ctx.dirs.addrs();
    let total = dirs.len() as u64;
    for (n, addr) in dirs.into_iter().enumerate() {
        if let Some(status) = interrupted(ctx) {
            return Ok(status);
        }
        ctx.report_progress(PassId::Pass3, n as u64, total);
        if ctx.blockmap.get(addr) != BlockTag::InodeDir || ctx.dirs.is_connected(addr) {
            continue;
        }
        connect(ctx, addr)?;
    }
    Ok(PassStatus::Completed)
}
