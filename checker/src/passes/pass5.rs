// Pass 5: bring bitmaps and allocation counters in line with the block map

use super::{interrupted, PassId, PassStatus};
use crate::context::FsckContext;
use crate::format::BlockState;
use log::info;
use rgfsck_core::Result;

fn check_region(ctx: &mut FsckContext, idx: usize) -> Result<()> {
    let header = ctx.regions[idx].header.clone();
    let mut changed = false;
    let mut free = 0u32;
    let mut dinodes = 0u32;

    for i in 0..header.data_len {
        let addr = header.data0 + i as u64;
        let tag = ctx.blockmap.get(addr);
        let expected = tag.bitmap_state();
        match expected {
            BlockState::Free => free += 1,
            BlockState::Dinode => dinodes += 1,
            _ => {}
        }

        let actual = ctx.regions[idx].bitmap.get(i);
        if actual == expected {
            continue;
        }
        let (problem, question) = if actual == BlockState::Unlinked && expected == BlockState::Free {
            (format!("Unlinked inode found at block {}", addr), "Reclaim the block?")
        } else {
            (
                format!(
                    "Block {} is marked {} in the bitmap but is {}",
                    addr,
                    actual.describe(),
                    tag.describe()
                ),
                "Fix the bitmap?",
            )
        };
        if ctx.fix(&problem, question) {
            ctx.regions[idx].bitmap.set(i, expected);
            changed = true;
        }
    }

    if header.free != free || header.dinodes != dinodes {
        let problem = format!(
            "Region at block {} records {} free blocks and {} inodes, found {} and {}",
            header.start, header.free, header.dinodes, free, dinodes
        );
        if ctx.fix(&problem, "Fix the region counters?") {
            let region = &mut ctx.regions[idx];
            region.header.free = free;
            region.header.dinodes = dinodes;
            changed = true;
        }
    }

    if changed {
        ctx.write_region(idx)?;
    }
    Ok(())
}

/// Superblock totals must match the sum over all regions
fn check_statfs(ctx: &mut FsckContext) -> Result<()> {
    let free: u64 = ctx.regions.iter().map(|r| r.header.free as u64).sum();
    let dinodes: u64 = ctx.regions.iter().map(|r| r.header.dinodes as u64).sum();
    if ctx.sb.total_free == free && ctx.sb.total_dinodes == dinodes {
        return Ok(());
    }
    let problem = format!(
        "Superblock records {} free blocks and {} inodes, regions hold {} and {}",
        ctx.sb.total_free, ctx.sb.total_dinodes, free, dinodes
    );
    if ctx.fix(&problem, "Fix the filesystem totals?") {
        ctx.sb.total_free = free;
        ctx.sb.total_dinodes = dinodes;
        ctx.write_superblock()?;
        info!("Filesystem totals updated");
    }
    Ok(())
}

pub fn run(ctx: &mut FsckContext) -> Result<PassStatus> {
    let total = ctx.regions.len() as u64;
    for idx in 0..ctx.regions.len() {
        if let Some(status) = interrupted(ctx) {
            return Ok(status);
        }
        ctx.report_progress(PassId::Pass5, idx as u64, total);
        check_region(ctx, idx)?;
    }
    check_statfs(ctx)?;
    Ok(PassStatus::Completed)
}
