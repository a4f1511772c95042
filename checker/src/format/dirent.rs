// Directory entry codec
//
// Entries are packed from the start of an entry area (an inode's inline
// payload or a directory leaf). Each record is 8-byte aligned; a record
// length of zero ends the area, and an entry address of zero marks a
// deleted record whose space may be reused.

use super::inode::FileKind;
use byteorder::{ByteOrder, LittleEndian};
use std::borrow::Cow;

pub const DIRENT_HEADER_LEN: usize = 28;
/// Offset of the first entry in a directory leaf
pub const LEAF_ENTRIES_OFFSET: usize = 16;

/// Declared type of an entry's target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DirEntryType {
    Unknown = 0,
    Fifo = 1,
    Chr = 2,
    Dir = 4,
    Blk = 6,
    Reg = 8,
    Lnk = 10,
    Sock = 12,
}

impl DirEntryType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => DirEntryType::Fifo,
            2 => DirEntryType::Chr,
            4 => DirEntryType::Dir,
            6 => DirEntryType::Blk,
            8 => DirEntryType::Reg,
            10 => DirEntryType::Lnk,
            12 => DirEntryType::Sock,
            _ => DirEntryType::Unknown,
        }
    }

    pub fn for_kind(kind: FileKind) -> Self {
        match kind {
            FileKind::Directory => DirEntryType::Dir,
            FileKind::Regular => DirEntryType::Reg,
            FileKind::Symlink => DirEntryType::Lnk,
            FileKind::Device => DirEntryType::Blk,
            FileKind::Fifo => DirEntryType::Fifo,
            FileKind::Socket => DirEntryType::Sock,
        }
    }

    /// Whether an entry of this type may name an object of `kind`
    pub fn matches(self, kind: FileKind) -> bool {
        matches!(
            (self, kind),
            (DirEntryType::Dir, FileKind::Directory)
                | (DirEntryType::Reg, FileKind::Regular)
                | (DirEntryType::Lnk, FileKind::Symlink)
                | (DirEntryType::Blk, FileKind::Device)
                | (DirEntryType::Chr, FileKind::Device)
                | (DirEntryType::Fifo, FileKind::Fifo)
                | (DirEntryType::Sock, FileKind::Socket)
        )
    }
}

/// Hash stored with every entry
pub fn name_hash(name: &[u8]) -> u32 {
    crc32fast::hash(name)
}

/// Record length needed for a name
pub fn entry_len(name_len: usize) -> usize {
    (DIRENT_HEADER_LEN + name_len + 7) & !7
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub addr: u64,
    pub formal: u64,
    pub hash: u32,
    pub rec_len: u16,
    pub dtype: u8,
    pub name: Vec<u8>,
}

impl DirEntry {
    pub fn new(name: &[u8], addr: u64, formal: u64, dtype: DirEntryType) -> Self {
        Self {
            addr,
            formal,
            hash: name_hash(name),
            rec_len: entry_len(name.len()) as u16,
            dtype: dtype as u8,
            name: name.to_vec(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.addr != 0
    }

    pub fn entry_type(&self) -> DirEntryType {
        DirEntryType::from_u8(self.dtype)
    }

    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// Result of parsing an entry area
#[derive(Debug, Default)]
pub struct ParsedArea {
    /// Records with their absolute byte offsets, deleted records included
    pub entries: Vec<(usize, DirEntry)>,
    /// Offset just past the last well-formed record
    pub end: usize,
    /// Offset of a malformed record that ended parsing early
    pub corrupt_at: Option<usize>,
}

impl ParsedArea {
    pub fn active(&self) -> impl Iterator<Item = &(usize, DirEntry)> {
        self.entries.iter().filter(|(_, e)| e.is_active())
    }
}

/// Parse the entry area of `block` beginning at `start`
pub fn parse_area(block: &[u8], start: usize) -> ParsedArea {
    let mut parsed = ParsedArea { end: start, ..Default::default() };
    let mut off = start;
    while off + DIRENT_HEADER_LEN <= block.len() {
        let rec_len = LittleEndian::read_u16(&block[off + 20..off + 22]) as usize;
        if rec_len == 0 {
            break;
        }
        let name_len = LittleEndian::read_u16(&block[off + 22..off + 24]) as usize;
        if rec_len < DIRENT_HEADER_LEN
            || rec_len % 8 != 0
            || off + rec_len > block.len()
            || DIRENT_HEADER_LEN + name_len > rec_len
        {
            parsed.corrupt_at = Some(off);
            break;
        }
        let name_start = off + DIRENT_HEADER_LEN;
        parsed.entries.push((
            off,
            DirEntry {
                addr: LittleEndian::read_u64(&block[off..off + 8]),
                formal: LittleEndian::read_u64(&block[off + 8..off + 16]),
                hash: LittleEndian::read_u32(&block[off + 16..off + 20]),
                rec_len: rec_len as u16,
                dtype: block[off + 24],
                name: block[name_start..name_start + name_len].to_vec(),
            },
        ));
        off += rec_len;
        parsed.end = off;
    }
    parsed
}

/// Rewrite target, hash and type of the record at `offset`; its length
/// and name are kept.
pub fn rewrite_entry(block: &mut [u8], offset: usize, entry: &DirEntry) {
    LittleEndian::write_u64(&mut block[offset..offset + 8], entry.addr);
    LittleEndian::write_u64(&mut block[offset + 8..offset + 16], entry.formal);
    LittleEndian::write_u32(&mut block[offset + 16..offset + 20], entry.hash);
    block[offset + 24] = entry.dtype;
}

/// Mark the record at `offset` deleted
pub fn clear_entry(block: &mut [u8], offset: usize) {
    LittleEndian::write_u64(&mut block[offset..offset + 8], 0);
    LittleEndian::write_u64(&mut block[offset + 8..offset + 16], 0);
}

fn write_record(block: &mut [u8], offset: usize, entry: &DirEntry, rec_len: usize) {
    rewrite_entry(block, offset, entry);
    LittleEndian::write_u16(&mut block[offset + 20..offset + 22], rec_len as u16);
    LittleEndian::write_u16(&mut block[offset + 22..offset + 24], entry.name.len() as u16);
    block[offset + 25..offset + DIRENT_HEADER_LEN].fill(0);
    let name_start = offset + DIRENT_HEADER_LEN;
    block[name_start..name_start + entry.name.len()].copy_from_slice(&entry.name);
    block[name_start + entry.name.len()..offset + rec_len].fill(0);
}

/// Insert an entry into the area at `start`, reusing a deleted record
/// when one is large enough. Returns the record offset, or None when the
/// area has no room or is malformed.
pub fn insert_entry(block: &mut [u8], start: usize, entry: &DirEntry) -> Option<usize> {
    let need = entry_len(entry.name.len());
    let parsed = parse_area(block, start);
    if parsed.corrupt_at.is_some() {
        return None;
    }
    if let Some((offset, slot)) = parsed
        .entries
        .iter()
        .find(|(_, e)| !e.is_active() && e.rec_len as usize >= need)
    {
        let (offset, rec_len) = (*offset, slot.rec_len as usize);
        write_record(block, offset, entry, rec_len);
        return Some(offset);
    }
    let end = parsed.end;
    if end + need > block.len() {
        return None;
    }
    write_record(block, end, entry, need);
    // Keep the area terminated if the following bytes were ever used
    let next = end + need;
    if next + DIRENT_HEADER_LEN <= block.len() {
        LittleEndian::write_u16(&mut block[next + 20..next + 22], 0);
    }
    Some(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_len_alignment() {
        assert_eq!(entry_len(1), 32);
        assert_eq!(entry_len(4), 32);
        assert_eq!(entry_len(5), 40);
    }

    #[test]
    fn test_insert_and_parse() {
        let mut block = vec![0u8; 256];
        let dot = DirEntry::new(b".", 10, 1, DirEntryType::Dir);
        let file = DirEntry::new(b"hello.txt", 20, 2, DirEntryType::Reg);
        assert_eq!(insert_entry(&mut block, 16, &dot), Some(16));
        assert_eq!(insert_entry(&mut block, 16, &file), Some(48));

        let parsed = parse_area(&block, 16);
        assert!(parsed.corrupt_at.is_none());
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[1].1.name_lossy(), "hello.txt");
        assert_eq!(parsed.entries[1].1.hash, name_hash(b"hello.txt"));
        assert_eq!(parsed.end, 48 + 40);
    }

    #[test]
    fn test_deleted_record_is_reused() {
        let mut block = vec![0u8; 256];
        insert_entry(&mut block, 0, &DirEntry::new(b"aaaaaaaa", 5, 5, DirEntryType::Reg));
        insert_entry(&mut block, 0, &DirEntry::new(b"b", 6, 6, DirEntryType::Reg));
        clear_entry(&mut block, 0);

        let offset = insert_entry(&mut block, 0, &DirEntry::new(b"c", 7, 7, DirEntryType::Reg));
        assert_eq!(offset, Some(0));
        let parsed = parse_area(&block, 0);
        assert_eq!(parsed.active().count(), 2);
        // The reused record keeps its original length
        assert_eq!(parsed.entries[0].1.rec_len, 40);
    }

    #[test]
    fn test_full_area() {
        let mut block = vec![0u8; 64];
        assert!(insert_entry(&mut block, 0, &DirEntry::new(b"one", 1, 1, DirEntryType::Reg)).is_some());
        assert!(insert_entry(&mut block, 0, &DirEntry::new(b"two", 2, 2, DirEntryType::Reg)).is_some());
        assert!(insert_entry(&mut block, 0, &DirEntry::new(b"three", 3, 3, DirEntryType::Reg)).is_none());
    }

    #[test]
    fn test_malformed_record_stops_parse() {
        let mut block = vec![0u8; 128];
        insert_entry(&mut block, 0, &DirEntry::new(b"ok", 1, 1, DirEntryType::Reg));
        insert_entry(&mut block, 0, &DirEntry::new(b"bad", 2, 2, DirEntryType::Reg));
        LittleEndian::write_u16(&mut block[32 + 20..32 + 22], 12);
        let parsed = parse_area(&block, 0);
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.corrupt_at, Some(32));
    }

    #[test]
    fn test_type_matching() {
        assert!(DirEntryType::Chr.matches(FileKind::Device));
        assert!(DirEntryType::Blk.matches(FileKind::Device));
        assert!(!DirEntryType::Reg.matches(FileKind::Directory));
        assert!(!DirEntryType::Unknown.matches(FileKind::Regular));
    }
}
