// Directory mutation helpers

use crate::blockmap::BlockTag;
use crate::context::FsckContext;
use crate::format::dirent::{clear_entry, insert_entry, parse_area, rewrite_entry, LEAF_ENTRIES_OFFSET};
use crate::format::inode::INODE_HEADER_LEN;
use crate::format::meta::{leaf_entry_count, new_leaf, set_leaf_entry_count, INDIRECT_PTRS_OFFSET};
use crate::format::{is_meta, read_pointers, write_u64_at, DirEntry, DirEntryType, Inode, MetaType};
use crate::walker::{walk, EntryRef, Visitor, WalkAction};
use log::debug;
use rgfsck_core::{FsckError, Result};

/// Block access needed to grow a directory
pub trait DirStore {
    fn block_size(&self) -> u32;
    fn load(&mut self, addr: u64) -> Result<Vec<u8>>;
    fn store(&mut self, addr: u64, data: &[u8]) -> Result<()>;
    /// Whether `addr` may be followed as a directory leaf or indirect block
    fn usable(&self, addr: u64, kind: MetaType) -> bool;
    /// A fresh block for a directory leaf, already accounted as in use
    fn allocate_leaf(&mut self) -> Result<Option<u64>>;
}

impl DirStore for FsckContext {
    fn block_size(&self) -> u32 {
        FsckContext::block_size(self)
    }

    fn load(&mut self, addr: u64) -> Result<Vec<u8>> {
        self.read_block(addr)
    }

    fn store(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.write_block(addr, data)
    }

    fn usable(&self, addr: u64, kind: MetaType) -> bool {
        let expected = match kind {
            MetaType::Indirect => BlockTag::Indirect,
            _ => BlockTag::DirLeaf,
        };
        self.blockmap.get(addr) == expected
    }

    fn allocate_leaf(&mut self) -> Result<Option<u64>> {
        self.allocate_block(BlockTag::DirLeaf, "directory leaf")
    }
}

fn decode_dir(block: &[u8], dir: u64) -> Result<Inode> {
    Inode::decode(block)
        .filter(|ip| ip.is_dir())
        .ok_or_else(|| FsckError::Corrupt(format!("block {} is not a directory inode", dir)))
}

/// Leaf blocks reachable from a directory inode block
pub(crate) fn collect_leaves<S: DirStore + ?Sized>(store: &mut S, block: &[u8], start: usize, height: u16) -> Result<Vec<u64>> {
    let mut leaves = Vec::new();
    for ptr in read_pointers(block, start) {
        if ptr == 0 {
            continue;
        }
        if height <= 1 {
            if store.usable(ptr, MetaType::DirLeaf) {
                leaves.push(ptr);
            }
        } else if store.usable(ptr, MetaType::Indirect) {
            let child = store.load(ptr)?;
            if is_meta(&child, MetaType::Indirect) {
                leaves.extend(collect_leaves(store, &child, INDIRECT_PTRS_OFFSET, height - 1)?);
            }
        }
    }
    Ok(leaves)
}

/// Move the entries of a stuffed directory into a new leaf
fn unstuff<S: DirStore + ?Sized>(store: &mut S, ip: &mut Inode, block: &mut [u8]) -> Result<bool> {
    let Some(leaf_addr) = store.allocate_leaf()? else {
        return Ok(false);
    };
    let mut leaf = new_leaf(store.block_size());
    let area = parse_area(block, INODE_HEADER_LEN);
    let mut count = 0u16;
    for (_, entry) in area.active() {
        if insert_entry(&mut leaf, LEAF_ENTRIES_OFFSET, entry).is_some() {
            count += 1;
        }
    }
    set_leaf_entry_count(&mut leaf, count);
    store.store(leaf_addr, &leaf)?;

    block[INODE_HEADER_LEN..].fill(0);
    write_u64_at(block, INODE_HEADER_LEN, leaf_addr);
    ip.height = 1;
    ip.blocks += 1;
    ip.encode_into(block);
    debug!("Directory {} moved into leaf {}", ip.addr, leaf_addr);
    Ok(true)
}

/// Add `entry` to directory `dir`, growing it when full. Returns false
/// when there is no room and the directory cannot grow.
pub fn insert_dirent<S: DirStore + ?Sized>(store: &mut S, dir: u64, entry: &DirEntry) -> Result<bool> {
    let mut block = store.load(dir)?;
    let mut ip = decode_dir(&block, dir)?;

    if ip.height == 0 {
        if insert_entry(&mut block, INODE_HEADER_LEN, entry).is_some() {
            ip.entries += 1;
            ip.encode_into(&mut block);
            store.store(dir, &block)?;
            return Ok(true);
        }
        if !unstuff(store, &mut ip, &mut block)? {
            return Ok(false);
        }
    }

    for leaf_addr in collect_leaves(store, &block, INODE_HEADER_LEN, ip.height)? {
        let mut leaf = store.load(leaf_addr)?;
        if !is_meta(&leaf, MetaType::DirLeaf) {
            continue;
        }
        if insert_entry(&mut leaf, LEAF_ENTRIES_OFFSET, entry).is_some() {
            let count = leaf_entry_count(&leaf).saturating_add(1);
            set_leaf_entry_count(&mut leaf, count);
            store.store(leaf_addr, &leaf)?;
            ip.entries += 1;
            ip.encode_into(&mut block);
            store.store(dir, &block)?;
            return Ok(true);
        }
    }

    // Only single-level directories gain leaves
    if ip.height == 1 {
        let free_slot = read_pointers(&block, INODE_HEADER_LEN).iter().position(|&p| p == 0);
        if let Some(slot) = free_slot {
            if let Some(leaf_addr) = store.allocate_leaf()? {
                let mut leaf = new_leaf(store.block_size());
                if insert_entry(&mut leaf, LEAF_ENTRIES_OFFSET, entry).is_some() {
                    set_leaf_entry_count(&mut leaf, 1);
                    store.store(leaf_addr, &leaf)?;
                    write_u64_at(&mut block, INODE_HEADER_LEN + slot * 8, leaf_addr);
                    ip.blocks += 1;
                    ip.entries += 1;
                    ip.encode_into(&mut block);
                    store.store(dir, &block)?;
                    return Ok(true);
                }
            }
        }
    }

    // An unstuffed inode whose new leaf could not take the entry
    store.store(dir, &block)?;
    Ok(false)
}

struct CollectEntries {
    entries: Vec<EntryRef>,
}

impl Visitor for CollectEntries {
    fn on_dir_leaf(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &crate::walker::PtrLoc, _block: Option<&[u8]>) -> Result<WalkAction> {
        Ok(if ctx.blockmap.get(loc.addr) == BlockTag::DirLeaf {
            WalkAction::Continue
        } else {
            WalkAction::Invalidate
        })
    }

    fn on_dir_entry(&mut self, _ctx: &mut FsckContext, _dir: &Inode, entry: &EntryRef) -> Result<WalkAction> {
        self.entries.push(entry.clone());
        Ok(WalkAction::Continue)
    }
}

/// Live entries of a directory
pub fn live_entries(ctx: &mut FsckContext, dir: u64) -> Result<Vec<EntryRef>> {
    let Some(ip) = ctx.read_inode(dir)? else {
        return Ok(Vec::new());
    };
    let mut collector = CollectEntries { entries: Vec::new() };
    walk(ctx, &ip, &mut collector)?;
    Ok(collector.entries)
}

pub fn add_entry(
    ctx: &mut FsckContext,
    dir: u64,
    name: &[u8],
    target: u64,
    formal: u64,
    dtype: DirEntryType,
) -> Result<bool> {
    let entry = DirEntry::new(name, target, formal, dtype);
    let added = insert_dirent(ctx, dir, &entry)?;
    if added {
        debug!("Added entry '{}' -> {} to directory {}", entry.name_lossy(), target, dir);
    }
    Ok(added)
}

/// Delete an entry and keep the leaf and directory counts in step
pub fn remove_entry(ctx: &mut FsckContext, dir: u64, entry: &EntryRef) -> Result<()> {
    let mut block = ctx.read_block(entry.block)?;
    clear_entry(&mut block, entry.offset);
    if entry.block == dir {
        if let Some(mut ip) = Inode::decode(&block) {
            ip.entries = ip.entries.saturating_sub(1);
            ip.encode_into(&mut block);
        }
        return ctx.write_block(dir, &block);
    }

    if is_meta(&block, MetaType::DirLeaf) {
        let count = leaf_entry_count(&block).saturating_sub(1);
        set_leaf_entry_count(&mut block, count);
    }
    ctx.write_block(entry.block, &block)?;
    if let Some(mut ip) = ctx.read_inode(dir)? {
        ip.entries = ip.entries.saturating_sub(1);
        ctx.write_inode(&ip)?;
    }
    Ok(())
}

/// Overwrite target, hash and type of an existing record
pub fn rewrite(ctx: &mut FsckContext, at: &EntryRef, entry: &DirEntry) -> Result<()> {
    let mut block = ctx.read_block(at.block)?;
    rewrite_entry(&mut block, at.offset, entry);
    ctx.write_block(at.block, &block)
}

/// Point the ".." entry of `dir` at `parent`, adding one if missing
pub fn set_dotdot(ctx: &mut FsckContext, dir: u64, parent: u64) -> Result<()> {
    let formal = ctx.read_inode(parent)?.map(|ip| ip.formal).unwrap_or(0);
    let entries = live_entries(ctx, dir)?;
    match entries.iter().find(|e| e.entry.is_dotdot()) {
        Some(at) => {
            let updated = DirEntry::new(b"..", parent, formal, DirEntryType::Dir);
            rewrite(ctx, at, &updated)
        }
        None => {
            if !add_entry(ctx, dir, b"..", parent, formal, DirEntryType::Dir)? {
                return Err(FsckError::Other(format!("no room for a '..' entry in directory {}", dir)));
            }
            Ok(())
        }
    }
}

/// Delete every named entry in `dir` pointing at `target`; returns how
/// many went
pub fn remove_entries_to(ctx: &mut FsckContext, dir: u64, target: u64) -> Result<u32> {
    let mut removed = 0;
    for at in live_entries(ctx, dir)? {
        if at.entry.addr == target && !at.entry.is_dot() && !at.entry.is_dotdot() {
            remove_entry(ctx, dir, &at)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::AutoYes;
    use crate::format::BlockState;
    use crate::image::{FsImage, ImageBuilder};
    use crate::init::open_context;
    use crate::passes::pass1;
    use rgfsck_core::{CheckOptions, RepairMode};

    /// Context with every block already classified
    fn classified(image: &FsImage) -> FsckContext {
        let options = CheckOptions { repair_mode: RepairMode::Yes, ..Default::default() };
        let mut ctx = open_context(Box::new(image.device()), options, Box::new(AutoYes)).unwrap();
        pass1::run(&mut ctx).unwrap();
        ctx
    }

    #[test]
    fn test_add_and_remove_entry() {
        let mut image = ImageBuilder::new(1024, 128).build().unwrap();
        let root = image.root();
        let file = image.create_file(root, "a", 1).unwrap();
        let formal = image.inode(file).unwrap().formal;
        let mut ctx = classified(&image);

        assert!(add_entry(&mut ctx, root, b"b", file, formal, DirEntryType::Reg).unwrap());
        assert_eq!(image.inode(root).unwrap().entries, 4);

        let entries = live_entries(&mut ctx, root).unwrap();
        let added = entries.iter().find(|e| e.entry.name == b"b").unwrap();
        remove_entry(&mut ctx, root, added).unwrap();
        assert_eq!(image.inode(root).unwrap().entries, 3);
        assert!(image.find_entry(root, "b").unwrap().is_none());
        assert!(image.find_entry(root, "a").unwrap().is_some());
    }

    #[test]
    fn test_stuffed_directory_grows_into_leaves() {
        let image = ImageBuilder::new(512, 256).build().unwrap();
        let root = image.root();
        let mut ctx = classified(&image);

        for i in 0..30u64 {
            let name = format!("name-{:02}", i);
            assert!(add_entry(&mut ctx, root, name.as_bytes(), root, 2, DirEntryType::Dir).unwrap());
        }
        let ip = image.inode(root).unwrap();
        assert_eq!(ip.height, 1);
        assert_eq!(ip.entries, 32);

        let leaves: Vec<u64> = image.inode_pointers(root).unwrap().into_iter().filter(|&p| p != 0).collect();
        assert!(leaves.len() > 1);
        let mut total = 0;
        for leaf in leaves {
            assert_eq!(ctx.blockmap.get(leaf), BlockTag::DirLeaf);
            assert_eq!(image.bitmap_state(leaf).unwrap(), Some(BlockState::Used));
            total += leaf_entry_count(&image.read_block(leaf).unwrap());
        }
        assert_eq!(total, 32);
        assert_eq!(live_entries(&mut ctx, root).unwrap().len(), 32);
    }

    #[test]
    fn test_remove_from_leaf_updates_leaf_count() {
        let mut image = ImageBuilder::new(1024, 128).build().unwrap();
        let root = image.root();
        let dir = image.mkdir_with_leaf(root, "d").unwrap();
        let file = image.create_file(dir, "inside", 0).unwrap();
        let leaf = image.inode_pointers(dir).unwrap()[0];
        assert_eq!(leaf_entry_count(&image.read_block(leaf).unwrap()), 3);
        let mut ctx = classified(&image);

        assert_eq!(remove_entries_to(&mut ctx, dir, file).unwrap(), 1);
        assert_eq!(leaf_entry_count(&image.read_block(leaf).unwrap()), 2);
        assert_eq!(image.inode(dir).unwrap().entries, 2);
        // "." and ".." are never removed this way
        assert_eq!(remove_entries_to(&mut ctx, dir, dir).unwrap(), 0);
    }

    #[test]
    fn test_set_dotdot() {
        let mut image = ImageBuilder::new(1024, 128).build().unwrap();
        let root = image.root();
        let a = image.mkdir(root, "a").unwrap();
        let b = image.mkdir(root, "b").unwrap();
        let mut ctx = classified(&image);

        set_dotdot(&mut ctx, b, a).unwrap();
        let dotdot = image.find_entry(b, "..").unwrap().unwrap();
        assert_eq!(dotdot.addr, a);
        assert_eq!(dotdot.formal, image.inode(a).unwrap().formal);
        assert_eq!(image.inode(b).unwrap().entries, 2);
    }
}
