// Directory linkage tracker

use std::collections::BTreeMap;

/// Parent candidates of one directory; 0 means not found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirInfo {
    /// Directory holding the entry that names this one
    pub treewalk_parent: u64,
    /// Target of this directory's ".." entry
    pub dotdot_parent: u64,
    pub connected: bool,
}

#[derive(Default)]
pub struct DirTracker {
    dirs: BTreeMap<u64, DirInfo>,
}

impl DirTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dir: u64) {
        self.dirs.entry(dir).or_default();
    }

    pub fn get(&self, dir: u64) -> Option<&DirInfo> {
        self.dirs.get(&dir)
    }

    pub fn get_mut(&mut self, dir: u64) -> Option<&mut DirInfo> {
        self.dirs.get_mut(&dir)
    }

    pub fn remove(&mut self, dir: u64) -> Option<DirInfo> {
        self.dirs.remove(&dir)
    }

    /// Record `parent` as the directory naming `dir`. A directory has one
    /// name only, so once a parent is recorded every later call returns
    /// it as the error, even when `parent` is the same directory.
    pub fn set_treewalk_parent(&mut self, dir: u64, parent: u64) -> Result<(), u64> {
        let info = self.dirs.entry(dir).or_default();
        if info.treewalk_parent != 0 {
            return Err(info.treewalk_parent);
        }
        info.treewalk_parent = parent;
        Ok(())
    }

    pub fn set_dotdot_parent(&mut self, dir: u64, parent: u64) {
        self.dirs.entry(dir).or_default().dotdot_parent = parent;
    }

    pub fn mark_connected(&mut self, dir: u64) {
        if let Some(info) = self.dirs.get_mut(&dir) {
            info.connected = true;
        }
    }

    pub fn is_connected(&self, dir: u64) -> bool {
        self.dirs.get(&dir).map(|i| i.connected).unwrap_or(false)
    }

    /// Tracked directories in ascending order
    pub fn addrs(&self) -> Vec<u64> {
        self.dirs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}
