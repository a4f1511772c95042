// Link accounting tracker

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkRecord {
    /// Valid directory entries naming the inode
    pub counted: u32,
    /// Link count recorded in the inode
    pub stored: u32,
}

#[derive(Default)]
pub struct LinkTracker {
    records: BTreeMap<u64, LinkRecord>,
}

impl LinkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stored(&mut self, inode: u64, stored: u32) {
        self.records.entry(inode).or_default().stored = stored;
    }

    pub fn increment(&mut self, inode: u64) {
        let record = self.records.entry(inode).or_default();
        record.counted = record.counted.saturating_add(1);
    }

    pub fn decrement(&mut self, inode: u64) {
        if let Some(record) = self.records.get_mut(&inode) {
            record.counted = record.counted.saturating_sub(1);
        }
    }

    pub fn get(&self, inode: u64) -> Option<LinkRecord> {
        self.records.get(&inode).copied()
    }

    pub fn remove(&mut self, inode: u64) -> Option<LinkRecord> {
        self.records.remove(&inode)
    }

    pub fn addrs(&self) -> Vec<u64> {
        self.records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting() {
        let mut links = LinkTracker::new();
        links.set_stored(40, 3);
        links.increment(40);
        links.increment(41);
        links.decrement(40);
        links.decrement(40);
        assert_eq!(links.get(40), Some(LinkRecord { counted: 0, stored: 3 }));
        assert_eq!(links.get(41), Some(LinkRecord { counted: 1, stored: 0 }));
        assert_eq!(links.addrs(), vec![40, 41]);
    }
}
