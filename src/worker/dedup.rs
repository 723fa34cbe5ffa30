use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::db::models::RecordId;

/// Bounded set of recently emitted record identities.
///
/// Entries are indexed by block so they can be expired once their block falls
/// below the retention floor. When the set is full the oldest blocks are
/// evicted first.
#[derive(Debug)]
pub struct DedupWindow {
    seen: FxHashMap<RecordId, u64>,
    by_block: BTreeMap<u64, Vec<RecordId>>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: FxHashMap::default(),
            by_block: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.seen.contains_key(id)
    }

    /// Record `id` as emitted at `block`. Returns `false` if it was already
    /// present.
    pub fn insert(&mut self, id: RecordId, block: u64) -> bool {
        if self.seen.contains_key(&id) {
            return false;
        }

        while self.seen.len() >= self.capacity {
            if !self.evict_oldest_block() {
                break;
            }
        }

        self.seen.insert(id, block);
        self.by_block.entry(block).or_default().push(id);
        true
    }

    /// Drop every entry whose block is below `floor`. Returns how many were
    /// removed.
    pub fn prune_below(&mut self, floor: u64) -> usize {
        let kept = self.by_block.split_off(&floor);
        let expired = std::mem::replace(&mut self.by_block, kept);

        let mut removed = 0;
        for id in expired.into_values().flatten() {
            if self.seen.remove(&id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict_oldest_block(&mut self) -> bool {
        match self.by_block.pop_first() {
            Some((_, ids)) => {
                for id in ids {
                    self.seen.remove(&id);
                }
                true
            },
            None => false,
        }
    }
}

/// Lowest block the window must still cover for a given watermark.
pub fn retention_floor(watermark: u64, confirmation_depth: u64, margin: u64) -> u64 {
    watermark.saturating_sub(confirmation_depth.saturating_add(margin))
}
