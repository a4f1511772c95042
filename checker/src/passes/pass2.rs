// Pass 2: validate directory entries and count links

use super::{interrupted, PassId, PassStatus};
use crate::blockmap::BlockTag;
use crate::context::FsckContext;
use crate::dir;
use crate::format::dirent::name_hash;
use crate::format::meta::{leaf_entry_count, set_leaf_entry_count};
use crate::format::{is_meta, DirEntry, DirEntryType, FileKind, Inode, MetaType};
use crate::invalidate::invalidate_inode;
use crate::walker::{walk, EntryRef, PtrLoc, Visitor, WalkAction};
use log::debug;
use rgfsck_core::Result;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Entry stays and names a live link
    Keep,
    /// Entry stays but is not counted
    Ignore,
    Removed,
}

#[derive(Default)]
struct LeafCount {
    stored: u16,
    live: u16,
}

struct DentryVisitor {
    dir: u64,
    accepted: u32,
    seen_dot: bool,
    seen_dotdot: bool,
    leaves: BTreeMap<u64, LeafCount>,
}

impl DentryVisitor {
    fn new(dir: u64) -> Self {
        Self { dir, accepted: 0, seen_dot: false, seen_dotdot: false, leaves: BTreeMap::new() }
    }

    fn remove(&mut self, ctx: &mut FsckContext, at: &EntryRef) -> Result<Verdict> {
        dir::remove_entry(ctx, self.dir, at)?;
        if let Some(leaf) = self.leaves.get_mut(&at.block) {
            leaf.stored = leaf.stored.saturating_sub(1);
        }
        Ok(Verdict::Removed)
    }

    /// Ask to delete an entry; a declined deletion leaves it uncounted
    fn offer_removal(&mut self, ctx: &mut FsckContext, at: &EntryRef, problem: &str) -> Result<Verdict> {
        if ctx.fix(problem, "Clear the entry?") {
            self.remove(ctx, at)
        } else {
            Ok(Verdict::Ignore)
        }
    }

    fn check(&mut self, ctx: &mut FsckContext, at: &EntryRef) -> Result<Verdict> {
        let dir = self.dir;
        let mut entry = at.entry.clone();
        let name = entry.name_lossy().into_owned();
        let target = entry.addr;

        if !ctx.blockmap.check_range(target) {
            let problem = format!(
                "Directory {} entry '{}' points to block {} outside the filesystem",
                dir, name, target
            );
            return self.offer_removal(ctx, at, &problem);
        }

        let expected_hash = name_hash(&entry.name);
        if entry.hash != expected_hash {
            let problem = format!(
                "Directory {} entry '{}' has hash {:#010x}, expected {:#010x}",
                dir, name, entry.hash, expected_hash
            );
            if ctx.fix(&problem, "Fix the hash?") {
                entry.hash = expected_hash;
                dir::rewrite(ctx, at, &entry)?;
            }
        }

        let tag = ctx.blockmap.get(target);
        if tag == BlockTag::BadPointerSource {
            let problem = format!(
                "Directory {} entry '{}' points to inode {}, which has pointers outside the filesystem",
                dir, name, target
            );
            if ctx.fix(&problem, "Clear the entry and delete the inode?") {
                self.remove(ctx, at)?;
                invalidate_inode(ctx, target, BlockTag::Free, "bad pointers")?;
                return Ok(Verdict::Removed);
            }
        } else if !tag.is_inode() {
            let problem = match tag {
                BlockTag::Free | BlockTag::Invalid => format!(
                    "Directory {} entry '{}' points to block {}, which is {}",
                    dir,
                    name,
                    target,
                    if tag == BlockTag::Free { "free" } else { "not a valid inode" }
                ),
                _ => format!(
                    "Directory {} entry '{}' points to block {}, which is a {} rather than an inode",
                    dir,
                    name,
                    target,
                    tag.describe()
                ),
            };
            return self.offer_removal(ctx, at, &problem);
        }

        let Some(target_ip) = ctx.read_inode(target)? else {
            let problem = format!("Directory {} entry '{}' points to block {} with no inode", dir, name, target);
            return self.offer_removal(ctx, at, &problem);
        };
        let Some(kind) = target_ip.kind() else {
            return Ok(Verdict::Ignore);
        };

        if entry.formal != target_ip.formal {
            let problem = format!(
                "Directory {} entry '{}' has formal number {}, but inode {} has {}",
                dir, name, entry.formal, target, target_ip.formal
            );
            return self.offer_removal(ctx, at, &problem);
        }

        if !entry.entry_type().matches(kind) {
            let problem = format!(
                "Directory {} entry '{}' declares type {:?}, but inode {} is a {}",
                dir,
                name,
                entry.entry_type(),
                target,
                kind.short_name()
            );
            return self.offer_removal(ctx, at, &problem);
        }

        if entry.is_dot() {
            return self.check_dot(ctx, at, &entry);
        }
        if entry.is_dotdot() {
            return self.check_dotdot(ctx, at, kind);
        }

        if kind == FileKind::Directory {
            if target == dir {
                let problem = format!("Directory {} entry '{}' points to the directory itself", dir, name);
                return self.offer_removal(ctx, at, &problem);
            }
            if let Err(existing) = ctx.dirs.set_treewalk_parent(target, dir) {
                let problem = if existing == dir {
                    format!("Directory {} entry '{}' is a second name for directory {}", dir, name, target)
                } else {
                    format!(
                        "Directory {} is named by both directory {} and directory {} ('{}')",
                        target, existing, dir, name
                    )
                };
                return self.offer_removal(ctx, at, &problem);
            }
        }

        ctx.links.increment(target);
        Ok(Verdict::Keep)
    }

    fn check_dot(&mut self, ctx: &mut FsckContext, at: &EntryRef, entry: &DirEntry) -> Result<Verdict> {
        let dir = self.dir;
        if self.seen_dot {
            return self.offer_removal(ctx, at, &format!("Directory {} has a second '.' entry", dir));
        }
        self.seen_dot = true;

        if entry.addr != dir {
            let problem = format!("The '.' entry of directory {} points to {}", dir, entry.addr);
            if ctx.fix(&problem, "Point it back at the directory?") {
                let formal = ctx.read_inode(dir)?.map(|ip| ip.formal).unwrap_or(0);
                let fixed = DirEntry::new(b".", dir, formal, DirEntryType::Dir);
                dir::rewrite(ctx, at, &fixed)?;
                ctx.links.increment(dir);
                return Ok(Verdict::Keep);
            }
            return Ok(Verdict::Ignore);
        }
        ctx.links.increment(dir);
        Ok(Verdict::Keep)
    }

    fn check_dotdot(&mut self, ctx: &mut FsckContext, at: &EntryRef, kind: FileKind) -> Result<Verdict> {
        let dir = self.dir;
        if self.seen_dotdot {
            return self.offer_removal(ctx, at, &format!("Directory {} has a second '..' entry", dir));
        }
        self.seen_dotdot = true;

        let target = at.entry.addr;
        if kind != FileKind::Directory {
            let problem = format!("The '..' entry of directory {} points to non-directory {}", dir, target);
            return self.offer_removal(ctx, at, &problem);
        }
        ctx.dirs.set_dotdot_parent(dir, target);
        ctx.links.increment(target);
        Ok(Verdict::Keep)
    }
}

impl Visitor for DentryVisitor {
    fn on_dir_leaf(&mut self, ctx: &mut FsckContext, _ip: &Inode, loc: &PtrLoc, block: Option<&[u8]>) -> Result<WalkAction> {
        if ctx.blockmap.get(loc.addr) != BlockTag::DirLeaf {
            return Ok(WalkAction::Invalidate);
        }
        if let Some(b) = block.filter(|b| is_meta(b, MetaType::DirLeaf)) {
            self.leaves.insert(loc.addr, LeafCount { stored: leaf_entry_count(b), live: 0 });
        }
        Ok(WalkAction::Continue)
    }

    fn on_dir_entry(&mut self, ctx: &mut FsckContext, _dir: &Inode, entry: &EntryRef) -> Result<WalkAction> {
        let verdict = self.check(ctx, entry)?;
        if verdict != Verdict::Removed {
            self.accepted += 1;
            if let Some(leaf) = self.leaves.get_mut(&entry.block) {
                leaf.live += 1;
            }
        }
        Ok(WalkAction::Continue)
    }
}

fn check_directory(ctx: &mut FsckContext, addr: u64) -> Result<()> {
    let Some(ip) = ctx.read_inode(addr)? else {
        return Ok(());
    };
    let mut visitor = DentryVisitor::new(addr);
    walk(ctx, &ip, &mut visitor)?;

    for (leaf_addr, count) in &visitor.leaves {
        if count.stored == count.live {
            continue;
        }
        let problem = format!(
            "Leaf {} of directory {} records {} entries, found {}",
            leaf_addr, addr, count.stored, count.live
        );
        if ctx.fix(&problem, "Fix the leaf entry count?") {
            let mut block = ctx.read_block(*leaf_addr)?;
            set_leaf_entry_count(&mut block, count.live);
            ctx.write_block(*leaf_addr, &block)?;
        }
    }

    if !visitor.seen_dot {
        let problem = format!("Directory {} has no '.' entry", addr);
        if ctx.fix(&problem, "Add it?") && dir::add_entry(ctx, addr, b".", addr, ip.formal, DirEntryType::Dir)? {
            ctx.links.increment(addr);
            visitor.accepted += 1;
        }
    }

    let Some(mut ip) = ctx.read_inode(addr)? else {
        return Ok(());
    };
    if ip.entries != visitor.accepted {
        let problem = format!(
            "Directory {} entry count is {}, found {}",
            addr, ip.entries, visitor.accepted
        );
        if ctx.fix(&problem, "Fix the entry count?") {
            ip.entries = visitor.accepted;
            ctx.write_inode(&ip)?;
        }
    }
    debug!("Directory {} holds {} entries", addr, visitor.accepted);
    Ok(())
}

pub fn run(ctx: &mut FsckContext) -> Result<PassStatus> {
    let dirs = ctx.blockmap.find(|t| t == BlockTag::InodeDir);
    let total = dirs.len() as u64;
    for (n, addr) in dirs.into_iter().enumerate() {
        if let Some(status) = interrupted(ctx) {
            return Ok(status);
        }
        ctx.report_progress(PassId::Pass2, n as u64, total);
        if ctx.blockmap.get(addr) == BlockTag::InodeDir {
            check_directory(ctx, addr)?;
        }
    }
    Ok(PassStatus::Completed)
}
