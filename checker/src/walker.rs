// Metadata tree walker
//
// Descends an inode's pointer tree, directory entries and extended
// attribute blocks, handing each reference to a Visitor. The walker
// decides nothing about validity; visitors do.

use crate::context::FsckContext;
use crate::format::dirent::{parse_area, LEAF_ENTRIES_OFFSET};
use crate::format::inode::{INODE_EATTR_OFFSET, INODE_HEADER_LEN};
use crate::format::meta::{ea_pointer_count, indirect_pointer_slots, EA_PTRS_OFFSET, INDIRECT_PTRS_OFFSET};
use crate::format::{is_meta, read_pointers, DirEntry, Inode, MetaType};
use log::warn;
use rgfsck_core::Result;

/// Where a pointer lives: the block holding it and its byte offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtrLoc {
    /// Block the pointer names
    pub addr: u64,
    pub parent: u64,
    pub offset: usize,
}

/// A visitor's verdict on one reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    /// Descend into the block if it has children
    Continue,
    /// Do not descend; keep walking siblings
    Invalidate,
    /// Stop the whole walk
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    Completed,
    Aborted,
}

/// A directory entry and where it sits on disk
#[derive(Debug, Clone)]
pub struct EntryRef {
    pub block: u64,
    pub offset: usize,
    pub entry: DirEntry,
}

/// Callbacks for each kind of reference. `block` holds the contents of
/// the referenced block when its address lies on the device.
#[allow(unused_variables)]
pub trait Visitor {
    fn on_indirect(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc, block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(WalkAction::Continue)
    }

    fn on_data(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc) -> Result<WalkAction> {
        Ok(WalkAction::Continue)
    }

    fn on_dir_leaf(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc, block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(WalkAction::Continue)
    }

    fn on_eattr_indirect(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc, block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(WalkAction::Continue)
    }

    fn on_eattr_leaf(&mut self, ctx: &mut FsckContext, ip: &Inode, loc: &PtrLoc, block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(WalkAction::Continue)
    }

    fn on_dir_entry(&mut self, ctx: &mut FsckContext, dir: &Inode, entry: &EntryRef) -> Result<WalkAction> {
        Ok(WalkAction::Continue)
    }
}

/// Walk everything reachable from `ip`
pub fn walk<V: Visitor + ?Sized>(ctx: &mut FsckContext, ip: &Inode, visitor: &mut V) -> Result<WalkOutcome> {
    let block = ctx.read_block(ip.addr)?;
    let outcome = if ip.height == 0 {
        if ip.is_dir() {
            walk_entries(ctx, ip, ip.addr, &block, INODE_HEADER_LEN, visitor)?
        } else {
            WalkOutcome::Completed
        }
    } else {
        walk_pointers(ctx, ip, ip.addr, &block, INODE_HEADER_LEN, ip.height, visitor)?
    };
    if outcome == WalkOutcome::Aborted {
        return Ok(outcome);
    }
    walk_eattr(ctx, ip, visitor)
}

fn read_child(ctx: &mut FsckContext, addr: u64) -> Result<Option<Vec<u8>>> {
    if ctx.in_bounds(addr) {
        ctx.read_block(addr).map(Some)
    } else {
        Ok(None)
    }
}

fn walk_pointers<V: Visitor + ?Sized>(
    ctx: &mut FsckContext,
    ip: &Inode,
    parent: u64,
    block: &[u8],
    start: usize,
    height: u16,
    visitor: &mut V,
) -> Result<WalkOutcome> {
    let mut pointers = read_pointers(block, start);
    if start == INDIRECT_PTRS_OFFSET {
        pointers.truncate(indirect_pointer_slots(ctx.block_size()));
    }

    for (i, ptr) in pointers.into_iter().enumerate() {
        if ptr == 0 {
            continue;
        }
        let loc = PtrLoc { addr: ptr, parent, offset: start + i * 8 };

        let outcome = if height > 1 {
            let child = read_child(ctx, ptr)?;
            match visitor.on_indirect(ctx, ip, &loc, child.as_deref())? {
                WalkAction::Abort => return Ok(WalkOutcome::Aborted),
                WalkAction::Invalidate => WalkOutcome::Completed,
                WalkAction::Continue => match child {
                    Some(c) if is_meta(&c, MetaType::Indirect) => {
                        walk_pointers(ctx, ip, ptr, &c, INDIRECT_PTRS_OFFSET, height - 1, visitor)?
                    }
                    _ => WalkOutcome::Completed,
                },
            }
        } else if ip.is_dir() {
            let child = read_child(ctx, ptr)?;
            match visitor.on_dir_leaf(ctx, ip, &loc, child.as_deref())? {
                WalkAction::Abort => return Ok(WalkOutcome::Aborted),
                WalkAction::Invalidate => WalkOutcome::Completed,
                WalkAction::Continue => match child {
                    Some(c) if is_meta(&c, MetaType::DirLeaf) => {
                        walk_entries(ctx, ip, ptr, &c, LEAF_ENTRIES_OFFSET, visitor)?
                    }
                    _ => WalkOutcome::Completed,
                },
            }
        } else {
            match visitor.on_data(ctx, ip, &loc)? {
                WalkAction::Abort => WalkOutcome::Aborted,
                _ => WalkOutcome::Completed,
            }
        };

        if outcome == WalkOutcome::Aborted {
            return Ok(outcome);
        }
    }
    Ok(WalkOutcome::Completed)
}

fn walk_entries<V: Visitor + ?Sized>(
    ctx: &mut FsckContext,
    dir: &Inode,
    block_addr: u64,
    block: &[u8],
    start: usize,
    visitor: &mut V,
) -> Result<WalkOutcome> {
    let area = parse_area(block, start);
    if let Some(at) = area.corrupt_at {
        warn!(
            "Directory {} has a damaged entry at offset {} of block {}; ignoring the rest of the block",
            dir.addr, at, block_addr
        );
    }
    for (offset, entry) in area.active() {
        let entry = EntryRef { block: block_addr, offset: *offset, entry: entry.clone() };
        if visitor.on_dir_entry(ctx, dir, &entry)? == WalkAction::Abort {
            return Ok(WalkOutcome::Aborted);
        }
    }
    Ok(WalkOutcome::Completed)
}

fn walk_eattr<V: Visitor + ?Sized>(ctx: &mut FsckContext, ip: &Inode, visitor: &mut V) -> Result<WalkOutcome> {
    if ip.eattr == 0 {
        return Ok(WalkOutcome::Completed);
    }
    let loc = PtrLoc { addr: ip.eattr, parent: ip.addr, offset: INODE_EATTR_OFFSET };
    let block = read_child(ctx, ip.eattr)?;

    if !ip.has_ea_indirect() {
        return Ok(match visitor.on_eattr_leaf(ctx, ip, &loc, block.as_deref())? {
            WalkAction::Abort => WalkOutcome::Aborted,
            _ => WalkOutcome::Completed,
        });
    }

    match visitor.on_eattr_indirect(ctx, ip, &loc, block.as_deref())? {
        WalkAction::Abort => return Ok(WalkOutcome::Aborted),
        WalkAction::Invalidate => return Ok(WalkOutcome::Completed),
        WalkAction::Continue => {}
    }
    let Some(block) = block.filter(|b| is_meta(b, MetaType::EattrIndirect)) else {
        return Ok(WalkOutcome::Completed);
    };

    let slots = indirect_pointer_slots(ctx.block_size());
    let count = (ea_pointer_count(&block) as usize).min(slots);
    let pointers = read_pointers(&block, EA_PTRS_OFFSET);
    for (i, ptr) in pointers.into_iter().take(count).enumerate() {
        if ptr == 0 {
            continue;
        }
        let leaf_loc = PtrLoc { addr: ptr, parent: ip.eattr, offset: EA_PTRS_OFFSET + i * 8 };
        let leaf = read_child(ctx, ptr)?;
        if visitor.on_eattr_leaf(ctx, ip, &leaf_loc, leaf.as_deref())? == WalkAction::Abort {
            return Ok(WalkOutcome::Aborted);
        }
    }
    Ok(WalkOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::AutoNo;
    use crate::image::{FsImage, ImageBuilder};
    use crate::init::open_context;
    use rgfsck_core::{CheckOptions, RepairMode};

    #[derive(Default)]
    struct Tally {
        indirect: usize,
        data: usize,
        ea_indirect: usize,
        ea_leaf: usize,
        names: Vec<String>,
        abort_at_data: Option<usize>,
        skip_indirect: bool,
    }

    impl Visitor for Tally {
        fn on_indirect(&mut self, _ctx: &mut FsckContext, _ip: &Inode, _loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
            self.indirect += 1;
            Ok(if self.skip_indirect { WalkAction::Invalidate } else { WalkAction::Continue })
        }

        fn on_data(&mut self, _ctx: &mut FsckContext, _ip: &Inode, _loc: &PtrLoc) -> Result<WalkAction> {
            self.data += 1;
            Ok(if Some(self.data) == self.abort_at_data { WalkAction::Abort } else { WalkAction::Continue })
        }

        fn on_eattr_indirect(&mut self, _ctx: &mut FsckContext, _ip: &Inode, _loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
            self.ea_indirect += 1;
            Ok(WalkAction::Continue)
        }

        fn on_eattr_leaf(&mut self, _ctx: &mut FsckContext, _ip: &Inode, _loc: &PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
            self.ea_leaf += 1;
            Ok(WalkAction::Continue)
        }

        fn on_dir_entry(&mut self, _ctx: &mut FsckContext, _dir: &Inode, entry: &EntryRef) -> Result<WalkAction> {
            self.names.push(entry.entry.name_lossy().into_owned());
            Ok(WalkAction::Continue)
        }
    }

    fn context(image: &FsImage) -> FsckContext {
        let options = CheckOptions { repair_mode: RepairMode::No, ..Default::default() };
        open_context(Box::new(image.device()), options, Box::new(AutoNo)).unwrap()
    }

    fn large_file() -> (FsImage, u64) {
        let mut image = ImageBuilder::new(512, 512).build().unwrap();
        let root = image.root();
        let file = image.create_file(root, "big", 60).unwrap();
        image.add_eattr(file, 3).unwrap();
        (image, file)
    }

    #[test]
    fn test_walk_visits_whole_tree() {
        let (image, file) = large_file();
        let mut ctx = context(&image);
        let ip = ctx.read_inode(file).unwrap().unwrap();
        let mut tally = Tally::default();

        assert_eq!(walk(&mut ctx, &ip, &mut tally).unwrap(), WalkOutcome::Completed);
        assert_eq!(tally.indirect, 1);
        assert_eq!(tally.data, 60);
        assert_eq!(tally.ea_indirect, 1);
        assert_eq!(tally.ea_leaf, 3);
    }

    #[test]
    fn test_abort_stops_the_walk() {
        let (image, file) = large_file();
        let mut ctx = context(&image);
        let ip = ctx.read_inode(file).unwrap().unwrap();
        let mut tally = Tally { abort_at_data: Some(5), ..Default::default() };

        assert_eq!(walk(&mut ctx, &ip, &mut tally).unwrap(), WalkOutcome::Aborted);
        assert_eq!(tally.data, 5);
        assert_eq!(tally.ea_leaf, 0);
    }

    #[test]
    fn test_invalidate_skips_children() {
        let (image, file) = large_file();
        let mut ctx = context(&image);
        let ip = ctx.read_inode(file).unwrap().unwrap();
        let mut tally = Tally { skip_indirect: true, ..Default::default() };

        assert_eq!(walk(&mut ctx, &ip, &mut tally).unwrap(), WalkOutcome::Completed);
        assert_eq!(tally.indirect, 1);
        assert_eq!(tally.data, 0);
        assert_eq!(tally.ea_leaf, 3);
    }

    #[test]
    fn test_directory_entries_in_order() {
        let mut image = ImageBuilder::new(1024, 128).build().unwrap();
        let root = image.root();
        image.create_file(root, "first", 0).unwrap();
        image.mkdir(root, "second").unwrap();
        let mut ctx = context(&image);
        let ip = ctx.read_inode(root).unwrap().unwrap();
        let mut tally = Tally::default();

        walk(&mut ctx, &ip, &mut tally).unwrap();
        assert_eq!(tally.names, vec![".", "..", "first", "second"]);
    }
}
