// Duplicate reference tracker
// Sparse record of blocks claimed by more than one owner.

use crate::format::MetaType;
use crate::walker::PtrLoc;
use log::debug;
use std::collections::BTreeMap;

/// How a claimant refers to a duplicated block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// The block is the claimant's own inode block
    Inode,
    Data,
    /// Indirect, directory leaf or extended attribute block
    Meta(MetaType),
}

impl RefKind {
    pub fn describe(self) -> &'static str {
        match self {
            RefKind::Inode => "inode",
            RefKind::Data => "data",
            RefKind::Meta(t) => t.describe(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DupRef {
    pub inode: u64,
    pub kind: RefKind,
    /// Pointer naming the block; None for an inode's own block
    pub loc: Option<PtrLoc>,
}

#[derive(Debug, Clone, Default)]
pub struct DupRecord {
    pub refs: Vec<DupRef>,
    /// The claimant that owned the block before the first collision has
    /// been located by a re-walk
    pub first_ref_found: bool,
    /// Inodes whose claims collided during classification
    colliders: Vec<u64>,
}

impl DupRecord {
    pub fn ref_count(&self) -> usize {
        self.refs.len()
    }

    /// Distinct claiming inodes, in the order first seen
    pub fn claimants(&self) -> Vec<u64> {
        let mut out: Vec<u64> = Vec::new();
        for r in &self.refs {
            if !out.contains(&r.inode) {
                out.push(r.inode);
            }
        }
        out
    }

    pub fn refs_of(&self, inode: u64) -> impl Iterator<Item = &DupRef> {
        self.refs.iter().filter(move |r| r.inode == inode)
    }
}

#[derive(Default)]
pub struct DupTracker {
    records: BTreeMap<u64, DupRecord>,
}

impl DupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a colliding claim on `block`, creating the record on first use
    pub fn add_collision(&mut self, block: u64, dup_ref: DupRef) {
        debug!(
            "Duplicate reference to block {} from inode {} as {}",
            block,
            dup_ref.inode,
            dup_ref.kind.describe()
        );
        let record = self.records.entry(block).or_default();
        if !record.colliders.contains(&dup_ref.inode) {
            record.colliders.push(dup_ref.inode);
        }
        record.refs.push(dup_ref);
    }

    /// Drop all references found by walking, keeping inode self-claims,
    /// before every claimant is rediscovered
    pub fn begin_recount(&mut self) {
        for record in self.records.values_mut() {
            record.refs.retain(|r| r.kind == RefKind::Inode);
            record.first_ref_found = false;
        }
    }

    /// Record a reference found by the re-walk
    pub fn add_recounted(&mut self, block: u64, dup_ref: DupRef) {
        if let Some(record) = self.records.get_mut(&block) {
            if dup_ref.kind == RefKind::Inode && record.refs_of(dup_ref.inode).any(|r| r.kind == RefKind::Inode) {
                return;
            }
            if !record.colliders.contains(&dup_ref.inode) {
                record.first_ref_found = true;
            }
            record.refs.push(dup_ref);
        }
    }

    pub fn contains(&self, block: u64) -> bool {
        self.records.contains_key(&block)
    }

    pub fn get(&self, block: u64) -> Option<&DupRecord> {
        self.records.get(&block)
    }

    /// `inode` reached `block` only through a collision, so its walk never
    /// went below it
    pub fn is_collider(&self, block: u64, inode: u64) -> bool {
        self.records.get(&block).map(|r| r.colliders.contains(&inode)).unwrap_or(false)
    }

    /// Remove every reference `inode` holds on `block`; returns the
    /// references that remain
    pub fn remove_claimant(&mut self, block: u64, inode: u64) -> usize {
        match self.records.get_mut(&block) {
            Some(record) => {
                record.refs.retain(|r| r.inode != inode);
                record.ref_count()
            }
            None => 0,
        }
    }

    pub fn remove(&mut self, block: u64) -> Option<DupRecord> {
        self.records.remove(&block)
    }

    /// Duplicated blocks in ascending order
    pub fn blocks(&self) -> Vec<u64> {
        self.records.keys().copied().collect()
    }

    /// Inodes whose own block is disputed
    pub fn inode_claimants(&self) -> Vec<u64> {
        self.records
            .values()
            .flat_map(|r| r.refs.iter())
            .filter(|r| r.kind == RefKind::Inode)
            .map(|r| r.inode)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
