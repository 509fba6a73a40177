//! In-memory buffer for blocks whose parent has not arrived yet.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ledgerd_params::Hash256;
use ledgerd_primitives::Block;

#[derive(Clone, Debug)]
pub struct OrphanBlock {
    pub hash: Hash256,
    pub block: Block,
    pub received: Instant,
    seq: u64,
}

impl OrphanBlock {
    pub fn prev_hash(&self) -> Hash256 {
        self.block.header.prev_hash
    }
}

pub struct OrphanPool {
    orphans: HashMap<Hash256, OrphanBlock>,
    orphans_by_parent: HashMap<Hash256, Vec<Hash256>>,
    next_seq: u64,
    max_orphans: usize,
    retention: Duration,
}

impl OrphanPool {
    pub fn new(max_orphans: usize, retention: Duration) -> Self {
        Self {
            orphans: HashMap::new(),
            orphans_by_parent: HashMap::new(),
            next_seq: 0,
            max_orphans,
            retention,
        }
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.orphans.contains_key(hash)
    }

    /// Buffers `block`; returns the orphans evicted to make room.
    pub fn insert(&mut self, hash: Hash256, block: Block, now: Instant) -> Vec<OrphanBlock> {
        let mut evicted = Vec::new();
        if self.max_orphans == 0 || self.orphans.contains_key(&hash) {
            return evicted;
        }
        while self.orphans.len() >= self.max_orphans {
            match self.evict_oldest() {
                Some(orphan) => evicted.push(orphan),
                None => break,
            }
        }
        let orphan = OrphanBlock {
            hash,
            block,
            received: now,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.orphans_by_parent
            .entry(orphan.prev_hash())
            .or_default()
            .push(hash);
        self.orphans.insert(hash, orphan);
        evicted
    }

    /// Removes and returns every orphan waiting on `parent`, oldest first.
    pub fn take_children(&mut self, parent: &Hash256) -> Vec<OrphanBlock> {
        let Some(hashes) = self.orphans_by_parent.remove(parent) else {
            return Vec::new();
        };
        let mut out: Vec<OrphanBlock> = hashes
            .iter()
            .filter_map(|hash| self.orphans.remove(hash))
            .collect();
        out.sort_by_key(|orphan| orphan.seq);
        out
    }

    /// Drops orphans older than the retention window.
    pub fn expire(&mut self, now: Instant) -> Vec<OrphanBlock> {
        let mut stale: Vec<(u64, Hash256)> = self
            .orphans
            .values()
            .filter(|orphan| now.saturating_duration_since(orphan.received) >= self.retention)
            .map(|orphan| (orphan.seq, orphan.hash))
            .collect();
        stale.sort_unstable();
        stale
            .into_iter()
            .filter_map(|(_, hash)| self.remove(&hash))
            .collect()
    }

    fn evict_oldest(&mut self) -> Option<OrphanBlock> {
        let oldest = self
            .orphans
            .values()
            .min_by_key(|orphan| orphan.seq)
            .map(|orphan| orphan.hash)?;
        self.remove(&oldest)
    }

    fn remove(&mut self, hash: &Hash256) -> Option<OrphanBlock> {
        let orphan = self.orphans.remove(hash)?;
        let parent = orphan.prev_hash();
        if let Some(children) = self.orphans_by_parent.get_mut(&parent) {
            children.retain(|child| child != hash);
            if children.is_empty() {
                self.orphans_by_parent.remove(&parent);
            }
        }
        Some(orphan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_primitives::BlockHeader;

    fn block(prev: u8, nonce: u64) -> (Hash256, Block) {
        let block = Block {
            header: BlockHeader {
                prev_hash: [prev; 32],
                height: 5,
                timestamp: 0,
                nonce,
                difficulty: 1,
                merkle_root: [0u8; 32],
                miner: "miner".to_string(),
                reward: 0,
            },
            transactions: Vec::new(),
        };
        (block.hash(), block)
    }

    #[test]
    fn children_come_back_in_arrival_order() {
        let now = Instant::now();
        let mut pool = OrphanPool::new(10, Duration::from_secs(60));
        let (h1, b1) = block(1, 1);
        let (h2, b2) = block(1, 2);
        let (h3, b3) = block(2, 3);
        pool.insert(h2, b2, now);
        pool.insert(h1, b1, now);
        pool.insert(h3, b3, now);
        let children: Vec<Hash256> = pool
            .take_children(&[1u8; 32])
            .into_iter()
            .map(|o| o.hash)
            .collect();
        assert_eq!(children, vec![h2, h1]);
        assert_eq!(pool.len(), 1);
        assert!(pool.take_children(&[1u8; 32]).is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let now = Instant::now();
        let mut pool = OrphanPool::new(2, Duration::from_secs(60));
        let (h1, b1) = block(1, 1);
        let (h2, b2) = block(1, 2);
        let (h3, b3) = block(3, 3);
        assert!(pool.insert(h1, b1, now).is_empty());
        assert!(pool.insert(h2, b2, now).is_empty());
        let evicted = pool.insert(h3, b3, now);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].hash, h1);
        assert!(!pool.contains(&h1));
        assert!(pool.contains(&h2) && pool.contains(&h3));
    }

    #[test]
    fn expiry_uses_retention_window() {
        let start = Instant::now();
        let mut pool = OrphanPool::new(10, Duration::from_secs(30));
        let (h1, b1) = block(1, 1);
        let (h2, b2) = block(2, 2);
        pool.insert(h1, b1, start);
        pool.insert(h2, b2, start + Duration::from_secs(20));
        assert!(pool.expire(start + Duration::from_secs(29)).is_empty());
        let expired = pool.expire(start + Duration::from_secs(31));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].hash, h1);
        assert_eq!(pool.len(), 1);
        assert!(pool.take_children(&[1u8; 32]).is_empty());
    }
}
