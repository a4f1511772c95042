// Loading filesystem geometry before the passes run

use crate::blockmap::{BlockMap, BlockTag};
use crate::context::{FsckContext, Region};
use crate::decision::RepairDecision;
use crate::device::BlockDevice;
use crate::format::superblock::{FSCK_PREFIX, LOCK_PREFIX};
use crate::format::{RegionBitmap, RegionHeader, Superblock, SUPERBLOCK_ADDR};
use log::{debug, info, warn};
use rgfsck_core::{CheckOptions, FsckError, Result};

/// Read superblock and regions, and seed the block map with the
/// filesystem's own metadata
pub fn open_context(
    mut dev: Box<dyn BlockDevice>,
    options: CheckOptions,
    decisions: Box<dyn RepairDecision>,
) -> Result<FsckContext> {
    let raw = dev.read_block(SUPERBLOCK_ADDR)?;
    let sb = Superblock::decode(&raw)?;
    dev.set_block_size(sb.block_size);
    if dev.total_blocks() < sb.total_blocks {
        return Err(FsckError::Corrupt(format!(
            "device holds {} blocks but the superblock records {}",
            dev.total_blocks(),
            sb.total_blocks
        )));
    }
    info!(
        "Filesystem: {} blocks of {} bytes in {} regions, lock protocol '{}'",
        sb.total_blocks, sb.block_size, sb.region_count, sb.lock_proto
    );

    let regions = read_regions(dev.as_mut(), &sb)?;
    let mut blockmap = BlockMap::new(sb.total_blocks)?;
    blockmap.reset(SUPERBLOCK_ADDR, BlockTag::RegionMeta, "superblock");
    for region in &regions {
        blockmap.reset(region.header.start, BlockTag::RegionMeta, "region header");
        for addr in region.header.bitmap_addrs() {
            blockmap.reset(addr, BlockTag::RegionMeta, "region bitmap");
        }
    }

    Ok(FsckContext::new(dev, sb, regions, blockmap, options, decisions))
}

fn read_regions(dev: &mut dyn BlockDevice, sb: &Superblock) -> Result<Vec<Region>> {
    let mut regions = Vec::with_capacity(sb.region_count as usize);
    let mut addr = SUPERBLOCK_ADDR + 1;
    for n in 0..sb.region_count {
        if addr >= sb.total_blocks {
            return Err(FsckError::Corrupt(format!(
                "region {} would start at block {}, past the end of the filesystem",
                n, addr
            )));
        }
        let header = RegionHeader::decode(&dev.read_block(addr)?, addr)?;
        if header.end() > sb.total_blocks {
            return Err(FsckError::Corrupt(format!(
                "region at block {} extends past the end of the filesystem",
                addr
            )));
        }
        let mut blocks = Vec::with_capacity(header.bitmap_blocks as usize);
        for b in header.bitmap_addrs() {
            blocks.push(dev.read_block(b)?);
        }
        let bitmap = RegionBitmap::from_blocks(&blocks, header.data_len)?;
        debug!("Region at block {}: {} data blocks, {} free", header.start, header.data_len, header.free);
        addr = header.end();
        regions.push(Region { header, bitmap });
    }
    if addr != sb.total_blocks {
        return Err(FsckError::Corrupt(format!(
            "regions cover blocks 1..{} but the filesystem has {} blocks",
            addr, sb.total_blocks
        )));
    }
    Ok(regions)
}

/// Preen only runs unattended on filesystems that cannot be mounted
/// elsewhere at the same time
pub fn preen_is_safe(sb: &Superblock) -> bool {
    sb.is_nolock()
}

/// Swap the lock protocol prefix so nodes cannot mount while the check
/// runs. Returns the protocol to restore afterwards.
pub fn block_mounters(ctx: &mut FsckContext) -> Result<String> {
    let original = ctx.sb.lock_proto.clone();
    let base = if let Some(base) = original.strip_prefix(LOCK_PREFIX) {
        base.to_string()
    } else if let Some(base) = original.strip_prefix(FSCK_PREFIX) {
        warn!("Lock protocol '{}' was left by an earlier interrupted check", original);
        base.to_string()
    } else {
        warn!("Lock protocol '{}' has no known prefix; mounters are not blocked", original);
        return Ok(original);
    };
    ctx.sb.lock_proto = format!("{}{}", FSCK_PREFIX, base);
    ctx.write_superblock()?;
    debug!("Lock protocol set to '{}'", ctx.sb.lock_proto);
    Ok(format!("{}{}", LOCK_PREFIX, base))
}

pub fn restore_mounters(ctx: &mut FsckContext, proto: String) -> Result<()> {
    ctx.sb.lock_proto = proto;
    ctx.write_superblock()?;
    debug!("Lock protocol restored to '{}'", ctx.sb.lock_proto);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::AutoYes;
    use crate::image::{FsImage, ImageBuilder};
    use rgfsck_core::RepairMode;

    fn open(image: &FsImage) -> Result<FsckContext> {
        let options = CheckOptions { repair_mode: RepairMode::Yes, ..Default::default() };
        open_context(Box::new(image.device()), options, Box::new(AutoYes))
    }

    #[test]
    fn test_region_metadata_is_reserved() {
        let image = ImageBuilder::new(1024, 600).regions(3).build().unwrap();
        let ctx = open(&image).unwrap();
        assert_eq!(ctx.regions.len(), 3);
        assert_eq!(ctx.blockmap.get(SUPERBLOCK_ADDR), BlockTag::RegionMeta);
        for region in &ctx.regions {
            assert_eq!(ctx.blockmap.get(region.header.start), BlockTag::RegionMeta);
            assert!(!ctx.blockmap.check_range(region.header.start));
            assert_eq!(ctx.blockmap.get(region.header.data0), BlockTag::Free);
        }
    }

    #[test]
    fn test_region_count_mismatch_is_fatal() {
        let mut image = ImageBuilder::new(1024, 256).build().unwrap();
        image.update_superblock(|sb| sb.region_count = 2).unwrap();
        assert!(matches!(open(&image), Err(FsckError::Corrupt(_))));
        image.update_superblock(|sb| sb.region_count = 0).unwrap();
        assert!(matches!(open(&image), Err(FsckError::Corrupt(_))));
    }

    #[test]
    fn test_short_device_is_fatal() {
        let mut image = ImageBuilder::new(1024, 256).build().unwrap();
        image.update_superblock(|sb| sb.total_blocks = 300).unwrap();
        assert!(matches!(open(&image), Err(FsckError::Corrupt(_))));
    }

    #[test]
    fn test_mounters_blocked_and_restored() {
        let image = ImageBuilder::new(1024, 128).lock_proto("lock_dlm").build().unwrap();
        let mut ctx = open(&image).unwrap();
        assert!(!preen_is_safe(&ctx.sb));

        let proto = block_mounters(&mut ctx).unwrap();
        assert_eq!(proto, "lock_dlm");
        assert_eq!(image.read_superblock().unwrap().lock_proto, "fsck_dlm");

        restore_mounters(&mut ctx, proto).unwrap();
        assert_eq!(image.read_superblock().unwrap().lock_proto, "lock_dlm");
    }

    #[test]
    fn test_unprefixed_protocol_is_left_alone() {
        let image = ImageBuilder::new(1024, 128).lock_proto("nolock").build().unwrap();
        let mut ctx = open(&image).unwrap();

        let proto = block_mounters(&mut ctx).unwrap();
        assert_eq!(proto, "nolock");
        assert_eq!(image.read_superblock().unwrap().lock_proto, "nolock");

        restore_mounters(&mut ctx, proto).unwrap();
        assert_eq!(image.read_superblock().unwrap().lock_proto, "nolock");
    }

    #[test]
    fn test_nolock_is_safe_to_preen() {
        let image = ImageBuilder::new(1024, 128).build().unwrap();
        let ctx = open(&image).unwrap();
        assert!(preen_is_safe(&ctx.sb));
    }
}
