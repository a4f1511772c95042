// Recovery directory for orphaned objects

use crate::blockmap::BlockTag;
use crate::context::FsckContext;
use crate::dir;
use crate::format::{new_meta_block, DirEntryType, FileKind, Inode, MetaType};
use log::{error, info};
use rgfsck_core::Result;

pub const LOST_FOUND_NAME: &[u8] = b"lost+found";

/// Raise the stored link count of a directory gaining a subdirectory
fn bump_nlink(ctx: &mut FsckContext, addr: u64) -> Result<()> {
    if let Some(mut ip) = ctx.read_inode(addr)? {
        ip.nlink += 1;
        ctx.write_inode(&ip)?;
        ctx.links.set_stored(addr, ip.nlink);
    }
    Ok(())
}

/// The lost+found directory, created under the root when missing
pub fn ensure_lost_found(ctx: &mut FsckContext) -> Result<Option<u64>> {
    let existing = ctx.sb.lost_found;
    if existing != 0 && ctx.blockmap.get(existing) == BlockTag::InodeDir {
        return Ok(Some(existing));
    }

    let root = ctx.sb.root_dir;
    if ctx.blockmap.get(root) != BlockTag::InodeDir {
        error!("Cannot create lost+found without a valid root directory");
        return Ok(None);
    }
    let root_formal = ctx.read_inode(root)?.map(|ip| ip.formal).unwrap_or(0);

    let Some(addr) = ctx.allocate_block(BlockTag::InodeDir, "lost+found")? else {
        error!("No free block is left for lost+found");
        return Ok(None);
    };
    info!("Creating lost+found at block {}", addr);

    let formal = ctx.next_formal();
    let mut ip = Inode::new(addr, formal, FileKind::Directory, 0o700);
    ip.nlink = 2;
    ip.blocks = 1;
    let mut block = new_meta_block(ctx.block_size(), MetaType::Inode);
    ip.encode_into(&mut block);
    ctx.write_block(addr, &block)?;
    dir::add_entry(ctx, addr, b".", addr, formal, DirEntryType::Dir)?;
    dir::add_entry(ctx, addr, b"..", root, root_formal, DirEntryType::Dir)?;

    if !dir::add_entry(ctx, root, LOST_FOUND_NAME, addr, formal, DirEntryType::Dir)? {
        error!("No room in the root directory for lost+found");
        return Ok(None);
    }
    bump_nlink(ctx, root)?;
    ctx.links.increment(root);

    ctx.links.set_stored(addr, 2);
    ctx.links.increment(addr);
    ctx.links.increment(addr);
    ctx.dirs.insert(addr);
    let _ = ctx.dirs.set_treewalk_parent(addr, root);
    ctx.dirs.set_dotdot_parent(addr, root);
    ctx.dirs.mark_connected(addr);

    ctx.sb.lost_found = addr;
    ctx.write_superblock()?;
    Ok(Some(addr))
}

/// Link an orphaned inode into lost+found. Returns false when that was
/// not possible.
pub fn attach(ctx: &mut FsckContext, addr: u64) -> Result<bool> {
    let Some(ip) = ctx.read_inode(addr)? else {
        return Ok(false);
    };
    let kind = ip.kind().unwrap_or(FileKind::Regular);
    let Some(lost_found) = ensure_lost_found(ctx)? else {
        ctx.unfixable(&format!("Inode {} could not be linked into lost+found", addr));
        return Ok(false);
    };

    let (parent, name) = if lost_found == addr {
        (ctx.sb.root_dir, LOST_FOUND_NAME.to_vec())
    } else {
        (lost_found, format!("lost_{}_{}", kind.short_name(), addr).into_bytes())
    };
    if !dir::add_entry(ctx, parent, &name, addr, ip.formal, DirEntryType::for_kind(kind))? {
        error!("No room in directory {} for inode {}", parent, addr);
        return Ok(false);
    }
    ctx.links.increment(addr);

    if kind == FileKind::Directory {
        let old_parent = ctx.dirs.get(addr).map(|d| d.dotdot_parent).unwrap_or(0);
        dir::set_dotdot(ctx, addr, parent)?;
        if old_parent != 0 {
            ctx.links.decrement(old_parent);
        }
        ctx.links.increment(parent);
        bump_nlink(ctx, parent)?;

        ctx.dirs.insert(addr);
        if let Some(info) = ctx.dirs.get_mut(addr) {
            info.treewalk_parent = parent;
            info.dotdot_parent = parent;
            info.connected = true;
        }
    }
    info!(
        "Inode {} linked into directory {} as '{}'",
        addr,
        parent,
        String::from_utf8_lossy(&name)
    );
    Ok(true)
}
