// Block device access for the checker
// Provides fixed-size block reads and writes on a file, a device node or memory

use log::debug;
use rgfsck_core::{FsckError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::format::MIN_BLOCK_SIZE;

/// Block store the engine runs against
pub trait BlockDevice: Send {
    fn block_size(&self) -> u32;

    /// Number of whole blocks the device holds
    fn total_blocks(&self) -> u64;

    fn read_block(&mut self, addr: u64) -> Result<Vec<u8>>;

    fn write_block(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    fn sync(&mut self) -> Result<()>;

    /// Adopt the block size recorded in the superblock
    fn set_block_size(&mut self, block_size: u32);
}

fn check_write(addr: u64, data: &[u8], block_size: u32, total: u64) -> Result<()> {
    if data.len() != block_size as usize {
        return Err(FsckError::Other(format!(
            "Invalid block size: expected {}, got {}",
            block_size,
            data.len()
        )));
    }
    if addr >= total {
        return Err(FsckError::OutOfRange { addr, total });
    }
    Ok(())
}

/// Device backed by a regular file or a block device node
pub struct FileDevice {
    file: File,
    block_size: u32,
    size_bytes: u64,
    writable: bool,
}

impl FileDevice {
    /// Open for checking; the block size starts at the minimum until the
    /// superblock has been read.
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;
        let size_bytes = file.seek(SeekFrom::End(0))?;
        debug!("Opened {} ({} bytes, writable: {})", path.display(), size_bytes, writable);
        Ok(Self {
            file,
            block_size: MIN_BLOCK_SIZE,
            size_bytes,
            writable,
        })
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.size_bytes / self.block_size as u64
    }

    fn read_block(&mut self, addr: u64) -> Result<Vec<u8>> {
        let total = self.total_blocks();
        if addr >= total {
            return Err(FsckError::OutOfRange { addr, total });
        }
        let mut buf = vec![0u8; self.block_size as usize];
        self.file.seek(SeekFrom::Start(addr * self.block_size as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_block(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(FsckError::Other(format!("write to block {} on a read-only device", addr)));
        }
        check_write(addr, data, self.block_size, self.total_blocks())?;
        self.file.seek(SeekFrom::Start(addr * self.block_size as u64))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn set_block_size(&mut self, block_size: u32) {
        self.block_size = block_size;
    }
}

/// In-memory device; clones share the same storage
#[derive(Clone)]
pub struct MemoryDevice {
    data: Arc<Mutex<Vec<u8>>>,
    block_size: u32,
}

impl MemoryDevice {
    pub fn new(block_size: u32, total_blocks: u64) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0u8; (block_size as u64 * total_blocks) as usize])),
            block_size,
        }
    }

    fn storage(&self) -> Result<std::sync::MutexGuard<'_, Vec<u8>>> {
        self.data
            .lock()
            .map_err(|_| FsckError::Other("memory device lock poisoned".to_string()))
    }

    /// Copy of the whole device image
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.storage()?.clone())
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.storage().map(|d| d.len() as u64).unwrap_or(0) / self.block_size as u64
    }

    fn read_block(&mut self, addr: u64) -> Result<Vec<u8>> {
        let total = self.total_blocks();
        if addr >= total {
            return Err(FsckError::OutOfRange { addr, total });
        }
        let bs = self.block_size as usize;
        let start = addr as usize * bs;
        Ok(self.storage()?[start..start + bs].to_vec())
    }

    fn write_block(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        check_write(addr, data, self.block_size, self.total_blocks())?;
        let bs = self.block_size as usize;
        let start = addr as usize * bs;
        self.storage()?[start..start + bs].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_block_size(&mut self, block_size: u32) {
        self.block_size = block_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_clones_share_storage() {
        let mut dev = MemoryDevice::new(512, 8);
        let mut other = dev.clone();
        dev.write_block(3, &[7u8; 512]).unwrap();
        assert_eq!(other.read_block(3).unwrap(), vec![7u8; 512]);
        assert!(matches!(other.read_block(8), Err(FsckError::OutOfRange { addr: 8, total: 8 })));
    }

    #[test]
    fn test_wrong_size_write_rejected() {
        let mut dev = MemoryDevice::new(512, 8);
        assert!(dev.write_block(0, &[0u8; 100]).is_err());
    }

    #[test]
    fn test_file_device_read_only() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096).unwrap();

        let mut dev = FileDevice::open(file.path(), false).unwrap();
        assert_eq!(dev.total_blocks(), 8);
        assert_eq!(dev.read_block(2).unwrap(), vec![0u8; 512]);
        assert!(dev.write_block(2, &[1u8; 512]).is_err());

        let mut dev = FileDevice::open(file.path(), true).unwrap();
        dev.set_block_size(1024);
        assert_eq!(dev.total_blocks(), 4);
        dev.write_block(1, &[9u8; 1024]).unwrap();
        dev.sync().unwrap();
        assert_eq!(dev.read_block(1).unwrap(), vec![9u8; 1024]);
    }
}
