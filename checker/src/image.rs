// Filesystem image construction
//
// Builds consistent images on a MemoryDevice and offers raw helpers for
// damaging them. Used by the test suites and for fixtures.

use crate::context::Region;
use crate::device::{BlockDevice, MemoryDevice};
use crate::dir::{collect_leaves, insert_dirent, DirStore};
use crate::format::dirent::{parse_area, rewrite_entry, LEAF_ENTRIES_OFFSET};
use crate::format::inode::{inode_pointer_slots, INODE_FLAG_EA_INDIRECT, INODE_FLAG_SYSTEM, INODE_HEADER_LEN};
use crate::format::meta::{
    indirect_pointer_slots, new_eattr_leaf, new_indirect, new_leaf, set_ea_pointer_count, set_leaf_entry_count,
    EA_PTRS_OFFSET, INDIRECT_PTRS_OFFSET,
};
use crate::format::superblock::SB_FLAG_CLEAN;
use crate::format::{
    is_meta, new_meta_block, read_pointers, write_u64_at, BlockState, DirEntry, DirEntryType, FileKind, Inode,
    MetaType, RegionBitmap, RegionHeader, Superblock, SUPERBLOCK_ADDR,
};
use rgfsck_core::{FsckError, Result};

const DATA_FILL: u8 = 0xA5;

pub struct ImageBuilder {
    block_size: u32,
    total_blocks: u64,
    regions: u32,
    lock_proto: String,
    journal_blocks: usize,
    clean: bool,
}

impl ImageBuilder {
    pub fn new(block_size: u32, total_blocks: u64) -> Self {
        Self {
            block_size,
            total_blocks,
            regions: 1,
            lock_proto: "lock_nolock".to_string(),
            journal_blocks: 0,
            clean: false,
        }
    }

    pub fn regions(mut self, count: u32) -> Self {
        self.regions = count.max(1);
        self
    }

    pub fn lock_proto(mut self, proto: &str) -> Self {
        self.lock_proto = proto.to_string();
        self
    }

    pub fn journal_blocks(mut self, blocks: usize) -> Self {
        self.journal_blocks = blocks;
        self
    }

    pub fn clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    pub fn build(self) -> Result<FsImage> {
        let span = self.total_blocks.saturating_sub(1);
        let per_region = (span + self.regions as u64 - 1) / self.regions as u64;
        let mut regions = Vec::new();
        let mut start = SUPERBLOCK_ADDR + 1;
        while start < self.total_blocks {
            let len = per_region.min(self.total_blocks - start) as u32;
            let header = RegionHeader::layout(start, len, self.block_size);
            if header.data_len == 0 {
                return Err(FsckError::Configuration(format!(
                    "region at block {} has no room for data",
                    start
                )));
            }
            let bitmap = RegionBitmap::new(header.data_len);
            start = header.end();
            regions.push(Region { header, bitmap });
        }

        let sb = Superblock {
            block_size: self.block_size,
            flags: if self.clean { SB_FLAG_CLEAN } else { 0 },
            total_blocks: self.total_blocks,
            region_count: regions.len() as u32,
            root_dir: 0,
            lost_found: 0,
            journal: 0,
            total_free: 0,
            total_dinodes: 0,
            lock_proto: self.lock_proto,
        };
        let mut image = FsImage {
            dev: MemoryDevice::new(self.block_size, self.total_blocks),
            sb,
            regions,
            next_formal: 1,
        };

        let root = image.new_dir_inode(0)?;
        image.sb.root_dir = root;
        if self.journal_blocks > 0 {
            image.sb.journal = image.new_inode(FileKind::Regular, self.journal_blocks, INODE_FLAG_SYSTEM)?;
        }
        image.flush()?;
        Ok(image)
    }
}

/// A filesystem under construction
pub struct FsImage {
    dev: MemoryDevice,
    sb: Superblock,
    regions: Vec<Region>,
    next_formal: u64,
}

impl DirStore for FsImage {
    fn block_size(&self) -> u32 {
        self.sb.block_size
    }

    fn load(&mut self, addr: u64) -> Result<Vec<u8>> {
        self.dev.read_block(addr)
    }

    fn store(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.dev.write_block(addr, data)
    }

    fn usable(&self, addr: u64, _kind: MetaType) -> bool {
        addr != SUPERBLOCK_ADDR && addr < self.sb.total_blocks
    }

    fn allocate_leaf(&mut self) -> Result<Option<u64>> {
        self.allocate(BlockState::Used).map(Some)
    }
}

impl FsImage {
    /// Handle on the image; shares storage with this builder
    pub fn device(&self) -> MemoryDevice {
        self.dev.clone()
    }

    pub fn root(&self) -> u64 {
        self.sb.root_dir
    }

    pub fn journal(&self) -> u64 {
        self.sb.journal
    }

    pub fn block_size(&self) -> u32 {
        self.sb.block_size
    }

    /// Mark the first free block with `state` in the bitmap and counters
    pub fn allocate(&mut self, state: BlockState) -> Result<u64> {
        for region in &mut self.regions {
            let Some(i) = region.bitmap.iter_state(BlockState::Free).next() else {
                continue;
            };
            region.bitmap.set(i, state);
            region.header.free -= 1;
            if state == BlockState::Dinode {
                region.header.dinodes += 1;
            }
            return Ok(region.header.data0 + i as u64);
        }
        Err(FsckError::Other("image is full".to_string()))
    }

    fn next_formal(&mut self) -> u64 {
        self.next_formal += 1;
        self.next_formal
    }

    /// Write region metadata and the superblock, totals recomputed
    fn flush(&mut self) -> Result<()> {
        let bs = self.sb.block_size;
        for region in &self.regions {
            let mut header = vec![0u8; bs as usize];
            region.header.encode_into(&mut header);
            self.dev.write_block(region.header.start, &header)?;
            let blocks = region.bitmap.to_blocks(bs, region.header.bitmap_blocks);
            for (addr, block) in region.header.bitmap_addrs().zip(blocks) {
                self.dev.write_block(addr, &block)?;
            }
        }
        self.sb.total_free = self.regions.iter().map(|r| r.header.free as u64).sum();
        self.sb.total_dinodes = self.regions.iter().map(|r| r.header.dinodes as u64).sum();
        let sb = self.sb.encode()?;
        self.dev.write_block(SUPERBLOCK_ADDR, &sb)
    }

    /// Pointer subtree `levels` deep holding `count` data blocks; returns
    /// its top block and the blocks it used
    fn subtree(&mut self, levels: u32, count: usize) -> Result<(u64, u64)> {
        let bs = self.sb.block_size;
        if levels == 0 {
            let addr = self.allocate(BlockState::Used)?;
            self.dev.write_block(addr, &vec![DATA_FILL; bs as usize])?;
            return Ok((addr, 1));
        }
        let addr = self.allocate(BlockState::Used)?;
        let child_cap = indirect_pointer_slots(bs).saturating_pow(levels - 1);
        let mut block = new_indirect(bs);
        let mut used = 1;
        let mut remaining = count;
        let mut slot = 0;
        while remaining > 0 {
            let chunk = remaining.min(child_cap);
            let (child, child_used) = self.subtree(levels - 1, chunk)?;
            write_u64_at(&mut block, INDIRECT_PTRS_OFFSET + slot * 8, child);
            used += child_used;
            remaining -= chunk;
            slot += 1;
        }
        self.dev.write_block(addr, &block)?;
        Ok((addr, used))
    }

    /// Allocate and write a regular inode with `data_blocks` blocks of data
    fn new_inode(&mut self, kind: FileKind, data_blocks: usize, flags: u32) -> Result<u64> {
        let bs = self.sb.block_size;
        let addr = self.allocate(BlockState::Dinode)?;
        let formal = self.next_formal();
        let mut ip = Inode::new(addr, formal, kind, 0o644);
        ip.flags = flags;
        ip.nlink = 1;
        ip.blocks = 1;
        let mut block = new_meta_block(bs, MetaType::Inode);

        if data_blocks > 0 {
            let top_slots = inode_pointer_slots(bs);
            let ind_slots = indirect_pointer_slots(bs);
            let mut height = 1u32;
            while top_slots.saturating_mul(ind_slots.saturating_pow(height - 1)) < data_blocks {
                height += 1;
            }
            let child_cap = ind_slots.saturating_pow(height - 1);
            let mut remaining = data_blocks;
            let mut slot = 0;
            while remaining > 0 {
                let chunk = remaining.min(child_cap);
                let (child, used) = self.subtree(height - 1, chunk)?;
                write_u64_at(&mut block, INODE_HEADER_LEN + slot * 8, child);
                ip.blocks += used;
                remaining -= chunk;
                slot += 1;
            }
            ip.height = height as u16;
            ip.size = data_blocks as u64 * bs as u64;
        }
        ip.encode_into(&mut block);
        self.dev.write_block(addr, &block)?;
        Ok(ip.addr)
    }

    /// Stuffed directory whose ".." names `parent`; 0 means itself
    fn new_dir_inode(&mut self, parent: u64) -> Result<u64> {
        let addr = self.allocate(BlockState::Dinode)?;
        let formal = self.next_formal();
        let mut ip = Inode::new(addr, formal, FileKind::Directory, 0o755);
        ip.nlink = 2;
        ip.blocks = 1;
        let mut block = new_meta_block(self.sb.block_size, MetaType::Inode);
        ip.encode_into(&mut block);
        self.dev.write_block(addr, &block)?;

        let parent = if parent == 0 { addr } else { parent };
        let parent_formal = if parent == addr { formal } else { self.inode(parent)?.formal };
        self.insert(addr, &DirEntry::new(b".", addr, formal, DirEntryType::Dir))?;
        self.insert(addr, &DirEntry::new(b"..", parent, parent_formal, DirEntryType::Dir))?;
        Ok(addr)
    }

    fn insert(&mut self, dir: u64, entry: &DirEntry) -> Result<()> {
        if !insert_dirent(self, dir, entry)? {
            return Err(FsckError::Other(format!("directory {} is full", dir)));
        }
        Ok(())
    }

    fn link_new(&mut self, parent: u64, name: &str, target: u64, kind: FileKind) -> Result<()> {
        let formal = self.inode(target)?.formal;
        self.insert(parent, &DirEntry::new(name.as_bytes(), target, formal, DirEntryType::for_kind(kind)))
    }

    pub fn mkdir(&mut self, parent: u64, name: &str) -> Result<u64> {
        let addr = self.new_dir_inode(parent)?;
        self.link_new(parent, name, addr, FileKind::Directory)?;
        self.update_inode(parent, |ip| ip.nlink += 1)?;
        self.flush()?;
        Ok(addr)
    }

    /// Directory kept in a leaf block rather than in its inode
    pub fn mkdir_with_leaf(&mut self, parent: u64, name: &str) -> Result<u64> {
        let bs = self.sb.block_size;
        let addr = self.allocate(BlockState::Dinode)?;
        let leaf_addr = self.allocate(BlockState::Used)?;
        let formal = self.next_formal();
        let parent_formal = self.inode(parent)?.formal;

        let mut leaf = new_leaf(bs);
        let area = [
            DirEntry::new(b".", addr, formal, DirEntryType::Dir),
            DirEntry::new(b"..", parent, parent_formal, DirEntryType::Dir),
        ];
        for entry in &area {
            crate::format::dirent::insert_entry(&mut leaf, LEAF_ENTRIES_OFFSET, entry);
        }
        set_leaf_entry_count(&mut leaf, 2);
        self.dev.write_block(leaf_addr, &leaf)?;

        let mut ip = Inode::new(addr, formal, FileKind::Directory, 0o755);
        ip.nlink = 2;
        ip.blocks = 2;
        ip.height = 1;
        ip.entries = 2;
        let mut block = new_meta_block(bs, MetaType::Inode);
        ip.encode_into(&mut block);
        write_u64_at(&mut block, INODE_HEADER_LEN, leaf_addr);
        self.dev.write_block(addr, &block)?;

        self.link_new(parent, name, addr, FileKind::Directory)?;
        self.update_inode(parent, |ip| ip.nlink += 1)?;
        self.flush()?;
        Ok(addr)
    }

    pub fn create_file(&mut self, parent: u64, name: &str, data_blocks: usize) -> Result<u64> {
        let addr = self.new_inode(FileKind::Regular, data_blocks, 0)?;
        self.link_new(parent, name, addr, FileKind::Regular)?;
        self.flush()?;
        Ok(addr)
    }

    /// File that no directory names
    pub fn create_unlinked_file(&mut self, data_blocks: usize) -> Result<u64> {
        let addr = self.new_inode(FileKind::Regular, data_blocks, 0)?;
        self.flush()?;
        Ok(addr)
    }

    /// Symlink, device, fifo or socket without data blocks
    pub fn create_node(&mut self, parent: u64, name: &str, kind: FileKind) -> Result<u64> {
        let addr = self.new_inode(kind, 0, 0)?;
        self.link_new(parent, name, addr, kind)?;
        self.flush()?;
        Ok(addr)
    }

    /// Another name for an existing file
    pub fn hard_link(&mut self, parent: u64, name: &str, target: u64) -> Result<()> {
        let kind = self.inode(target)?.kind().unwrap_or(FileKind::Regular);
        self.link_new(parent, name, target, kind)?;
        self.update_inode(target, |ip| ip.nlink += 1)?;
        self.flush()
    }

    /// Give an inode extended attributes spread over `leaves` blocks
    pub fn add_eattr(&mut self, inode: u64, leaves: usize) -> Result<()> {
        let bs = self.sb.block_size;
        let mut ip = self.inode(inode)?;
        if leaves <= 1 {
            let leaf = self.allocate(BlockState::Used)?;
            self.dev.write_block(leaf, &new_eattr_leaf(bs, 1))?;
            ip.eattr = leaf;
            ip.blocks += 1;
        } else {
            let indirect = self.allocate(BlockState::Used)?;
            let mut block = new_meta_block(bs, MetaType::EattrIndirect);
            for i in 0..leaves {
                let leaf = self.allocate(BlockState::Used)?;
                self.dev.write_block(leaf, &new_eattr_leaf(bs, 1))?;
                write_u64_at(&mut block, EA_PTRS_OFFSET + i * 8, leaf);
            }
            set_ea_pointer_count(&mut block, leaves as u32);
            self.dev.write_block(indirect, &block)?;
            ip.eattr = indirect;
            ip.flags |= INODE_FLAG_EA_INDIRECT;
            ip.blocks += 1 + leaves as u64;
        }
        self.write_inode(&ip)?;
        self.flush()
    }

    pub fn read_block(&self, addr: u64) -> Result<Vec<u8>> {
        self.dev.clone().read_block(addr)
    }

    pub fn write_block(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.dev.clone().write_block(addr, data)
    }

    /// Superblock as currently stored on the device
    pub fn read_superblock(&self) -> Result<Superblock> {
        Superblock::decode(&self.read_block(SUPERBLOCK_ADDR)?)
    }

    pub fn update_superblock<F: FnOnce(&mut Superblock)>(&mut self, f: F) -> Result<()> {
        let mut sb = self.read_superblock()?;
        f(&mut sb);
        self.sb = sb;
        self.write_block(SUPERBLOCK_ADDR, &self.sb.encode()?)
    }

    pub fn inode(&self, addr: u64) -> Result<Inode> {
        Inode::decode(&self.read_block(addr)?)
            .ok_or_else(|| FsckError::Corrupt(format!("block {} holds no inode", addr)))
    }

    fn write_inode(&self, ip: &Inode) -> Result<()> {
        let mut block = self.read_block(ip.addr)?;
        ip.encode_into(&mut block);
        self.write_block(ip.addr, &block)
    }

    pub fn update_inode<F: FnOnce(&mut Inode)>(&self, addr: u64, f: F) -> Result<()> {
        let mut ip = self.inode(addr)?;
        f(&mut ip);
        self.write_inode(&ip)
    }

    /// Pointers held in an inode's payload
    pub fn inode_pointers(&self, addr: u64) -> Result<Vec<u64>> {
        let block = self.read_block(addr)?;
        Ok(read_pointers(&block, INODE_HEADER_LEN))
    }

    pub fn set_inode_pointer(&self, addr: u64, slot: usize, value: u64) -> Result<()> {
        let mut block = self.read_block(addr)?;
        write_u64_at(&mut block, INODE_HEADER_LEN + slot * 8, value);
        self.write_block(addr, &block)
    }

    /// Data blocks of a regular file in tree order
    pub fn data_blocks(&self, addr: u64) -> Result<Vec<u64>> {
        let ip = self.inode(addr)?;
        let block = self.read_block(addr)?;
        let mut out = Vec::new();
        self.collect_data(&block, INODE_HEADER_LEN, ip.height, &mut out)?;
        Ok(out)
    }

    fn collect_data(&self, block: &[u8], start: usize, height: u16, out: &mut Vec<u64>) -> Result<()> {
        if height == 0 {
            return Ok(());
        }
        for ptr in read_pointers(block, start) {
            if ptr == 0 {
                continue;
            }
            if height == 1 {
                out.push(ptr);
            } else {
                let child = self.read_block(ptr)?;
                if is_meta(&child, MetaType::Indirect) {
                    self.collect_data(&child, INDIRECT_PTRS_OFFSET, height - 1, out)?;
                }
            }
        }
        Ok(())
    }

    /// Blocks holding a directory's entries, with the offset the entries
    /// start at
    fn entry_areas(&mut self, dir: u64) -> Result<Vec<(u64, usize)>> {
        let ip = self.inode(dir)?;
        if ip.height == 0 {
            return Ok(vec![(dir, INODE_HEADER_LEN)]);
        }
        let block = self.read_block(dir)?;
        let mut areas = Vec::new();
        for leaf in collect_leaves(self, &block, INODE_HEADER_LEN, ip.height)? {
            if is_meta(&self.read_block(leaf)?, MetaType::DirLeaf) {
                areas.push((leaf, LEAF_ENTRIES_OFFSET));
            }
        }
        Ok(areas)
    }

    /// Live entries of a directory
    pub fn entries(&mut self, dir: u64) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        for (addr, start) in self.entry_areas(dir)? {
            let block = self.read_block(addr)?;
            out.extend(parse_area(&block, start).active().map(|(_, e)| e.clone()));
        }
        Ok(out)
    }

    pub fn find_entry(&mut self, dir: u64, name: &str) -> Result<Option<DirEntry>> {
        Ok(self.entries(dir)?.into_iter().find(|e| e.name == name.as_bytes()))
    }

    /// Rewrite target, formal number, hash or type of a named entry
    pub fn update_entry<F: FnOnce(&mut DirEntry)>(&mut self, dir: u64, name: &str, f: F) -> Result<()> {
        for (addr, start) in self.entry_areas(dir)? {
            let mut block = self.read_block(addr)?;
            let found = parse_area(&block, start)
                .active()
                .find(|(_, e)| e.name == name.as_bytes())
                .cloned();
            if let Some((offset, mut entry)) = found {
                f(&mut entry);
                rewrite_entry(&mut block, offset, &entry);
                return self.write_block(addr, &block);
            }
        }
        Err(FsckError::Other(format!("directory {} has no entry '{}'", dir, name)))
    }

    /// Region header and bitmap holding `addr`, as stored on the device
    fn stored_region(&self, addr: u64) -> Result<Option<(RegionHeader, RegionBitmap)>> {
        let Some(start) = self.regions.iter().find(|r| r.header.contains(addr)).map(|r| r.header.start) else {
            return Ok(None);
        };
        let header = RegionHeader::decode(&self.read_block(start)?, start)?;
        let blocks = header
            .bitmap_addrs()
            .map(|b| self.read_block(b))
            .collect::<Result<Vec<_>>>()?;
        let bitmap = RegionBitmap::from_blocks(&blocks, header.data_len)?;
        Ok(Some((header, bitmap)))
    }

    /// Allocation state the on-disk bitmap records for a data block
    pub fn bitmap_state(&self, addr: u64) -> Result<Option<BlockState>> {
        Ok(self
            .stored_region(addr)?
            .filter(|(header, _)| header.contains_data(addr))
            .map(|(header, bitmap)| bitmap.get((addr - header.data0) as u32)))
    }

    /// Free and inode counters of the region holding `addr`, as stored
    pub fn region_counts(&self, addr: u64) -> Result<Option<(u32, u32)>> {
        Ok(self.stored_region(addr)?.map(|(header, _)| (header.free, header.dinodes)))
    }

    /// Change a bitmap entry without touching any counter
    pub fn set_bitmap_state(&mut self, addr: u64, state: BlockState) -> Result<()> {
        let bs = self.sb.block_size;
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.header.contains_data(addr))
            .ok_or_else(|| FsckError::Other(format!("block {} is not a data block", addr)))?;
        region.bitmap.set((addr - region.header.data0) as u32, state);
        let blocks = region.bitmap.to_blocks(bs, region.header.bitmap_blocks);
        let addrs: Vec<u64> = region.header.bitmap_addrs().collect();
        for (addr, block) in addrs.into_iter().zip(blocks) {
            self.write_block(addr, &block)?;
        }
        Ok(())
    }

    /// Overwrite the free and inode counters of the region holding `addr`
    pub fn set_region_counts(&mut self, addr: u64, free: u32, dinodes: u32) -> Result<()> {
        let bs = self.sb.block_size;
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.header.contains(addr))
            .ok_or_else(|| FsckError::Other(format!("block {} is in no region", addr)))?;
        region.header.free = free;
        region.header.dinodes = dinodes;
        let mut block = vec![0u8; bs as usize];
        region.header.encode_into(&mut block);
        let start = region.header.start;
        self.write_block(start, &block)
    }
}
