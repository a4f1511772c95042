// Inode header codec

use super::{meta_type, write_meta_header, MetaType};
use byteorder::{ByteOrder, LittleEndian};

pub const INODE_HEADER_LEN: usize = 128;
/// Byte offset of the extended attribute head pointer
pub const INODE_EATTR_OFFSET: usize = 64;
pub const MAX_TREE_HEIGHT: u16 = 10;

pub const INODE_FLAG_SYSTEM: u32 = 0x1;
pub const INODE_FLAG_JDATA: u32 = 0x2;
pub const INODE_FLAG_EA_INDIRECT: u32 = 0x4;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Object type encoded in an inode's mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Directory,
    Regular,
    Symlink,
    Device,
    Fifo,
    Socket,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Option<Self> {
        Some(match mode & S_IFMT {
            S_IFDIR => FileKind::Directory,
            S_IFREG => FileKind::Regular,
            S_IFLNK => FileKind::Symlink,
            S_IFBLK | S_IFCHR => FileKind::Device,
            S_IFIFO => FileKind::Fifo,
            S_IFSOCK => FileKind::Socket,
            _ => return None,
        })
    }

    pub fn mode_bits(self) -> u32 {
        match self {
            FileKind::Directory => S_IFDIR,
            FileKind::Regular => S_IFREG,
            FileKind::Symlink => S_IFLNK,
            FileKind::Device => S_IFBLK,
            FileKind::Fifo => S_IFIFO,
            FileKind::Socket => S_IFSOCK,
        }
    }

    /// Short name used for recovered entries
    pub fn short_name(self) -> &'static str {
        match self {
            FileKind::Directory => "dir",
            FileKind::Regular => "file",
            FileKind::Symlink => "link",
            FileKind::Device => "dev",
            FileKind::Fifo => "fifo",
            FileKind::Socket => "sock",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub addr: u64,
    pub formal: u64,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub blocks: u64,
    pub flags: u32,
    pub height: u16,
    /// Directory entry count; unused for other kinds
    pub entries: u32,
    pub eattr: u64,
}

impl Inode {
    pub fn new(addr: u64, formal: u64, kind: FileKind, perm: u32) -> Self {
        Self {
            addr,
            formal,
            mode: kind.mode_bits() | (perm & 0o7777),
            nlink: 1,
            size: 0,
            blocks: 1,
            flags: 0,
            height: 0,
            entries: 0,
            eattr: 0,
        }
    }

    /// Decode the header of an inode block; None if the block is not an inode
    pub fn decode(block: &[u8]) -> Option<Self> {
        if meta_type(block) != Some(MetaType::Inode) || block.len() < INODE_HEADER_LEN {
            return None;
        }
        Some(Self {
            addr: LittleEndian::read_u64(&block[8..16]),
            formal: LittleEndian::read_u64(&block[16..24]),
            mode: LittleEndian::read_u32(&block[24..28]),
            nlink: LittleEndian::read_u32(&block[28..32]),
            size: LittleEndian::read_u64(&block[32..40]),
            blocks: LittleEndian::read_u64(&block[40..48]),
            flags: LittleEndian::read_u32(&block[48..52]),
            height: LittleEndian::read_u16(&block[52..54]),
            entries: LittleEndian::read_u32(&block[56..60]),
            eattr: LittleEndian::read_u64(&block[INODE_EATTR_OFFSET..INODE_EATTR_OFFSET + 8]),
        })
    }

    /// Write the header fields, leaving the payload untouched
    pub fn encode_into(&self, block: &mut [u8]) {
        write_meta_header(block, MetaType::Inode);
        LittleEndian::write_u64(&mut block[8..16], self.addr);
        LittleEndian::write_u64(&mut block[16..24], self.formal);
        LittleEndian::write_u32(&mut block[24..28], self.mode);
        LittleEndian::write_u32(&mut block[28..32], self.nlink);
        LittleEndian::write_u64(&mut block[32..40], self.size);
        LittleEndian::write_u64(&mut block[40..48], self.blocks);
        LittleEndian::write_u32(&mut block[48..52], self.flags);
        LittleEndian::write_u16(&mut block[52..54], self.height);
        LittleEndian::write_u32(&mut block[56..60], self.entries);
        LittleEndian::write_u64(&mut block[INODE_EATTR_OFFSET..INODE_EATTR_OFFSET + 8], self.eattr);
    }

    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == Some(FileKind::Directory)
    }

    pub fn is_system(&self) -> bool {
        self.flags & INODE_FLAG_SYSTEM != 0
    }

    pub fn has_ea_indirect(&self) -> bool {
        self.flags & INODE_FLAG_EA_INDIRECT != 0
    }
}

/// Pointer slots in an inode's payload
pub fn inode_pointer_slots(block_size: u32) -> usize {
    (block_size as usize - INODE_HEADER_LEN) / 8
}
