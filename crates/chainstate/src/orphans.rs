//! Blocks whose parent has not arrived yet.

use std::collections::{HashMap, VecDeque};

use beand_consensus::constants::MAX_ORPHAN_BLOCKS;
use beand_consensus::Hash256;
use beand_primitives::Block;

pub struct OrphanPool {
    capacity: usize,
    by_hash: HashMap<Hash256, Block>,
    by_parent: HashMap<Hash256, Vec<Hash256>>,
    arrival: VecDeque<Hash256>,
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new(MAX_ORPHAN_BLOCKS)
    }
}

impl OrphanPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            by_hash: HashMap::new(),
            by_parent: HashMap::new(),
            arrival: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Buffers `block`, evicting the oldest orphan when full. Returns false if already held.
    pub fn insert(&mut self, block: Block) -> bool {
        let hash = block.hash();
        if self.by_hash.contains_key(&hash) {
            return false;
        }
        while self.by_hash.len() >= self.capacity {
            let Some(oldest) = self.arrival.pop_front() else {
                break;
            };
            self.remove(&oldest);
        }
        self.by_parent
            .entry(block.header.prev_block)
            .or_default()
            .push(hash);
        self.arrival.push_back(hash);
        self.by_hash.insert(hash, block);
        true
    }

    /// Removes and returns the orphans waiting on `parent`.
    pub fn take_children(&mut self, parent: &Hash256) -> Vec<Block> {
        let Some(children) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        children
            .into_iter()
            .filter_map(|hash| {
                self.arrival.retain(|queued| queued != &hash);
                self.by_hash.remove(&hash)
            })
            .collect()
    }

    fn remove(&mut self, hash: &Hash256) -> Option<Block> {
        let block = self.by_hash.remove(hash)?;
        let parent = block.header.prev_block;
        if let Some(siblings) = self.by_parent.get_mut(&parent) {
            siblings.retain(|sibling| sibling != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        self.arrival.retain(|queued| queued != hash);
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beand_primitives::block::BlockHeader;

    fn block(prev: u8, nonce: u32) -> Block {
        Block {
            header: BlockHeader {
                version: 6,
                prev_block: [prev; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0,
                nonce,
            },
            transactions: Vec::new(),
            signature: Vec::new(),
        }
    }

    #[test]
    fn children_are_released_with_their_parent() {
        let mut pool = OrphanPool::new(10);
        assert!(pool.insert(block(1, 0)));
        assert!(pool.insert(block(1, 1)));
        assert!(pool.insert(block(2, 0)));
        assert!(!pool.insert(block(2, 0)));
        let released = pool.take_children(&[1u8; 32]);
        assert_eq!(released.len(), 2);
        assert_eq!(pool.len(), 1);
        assert!(pool.take_children(&[1u8; 32]).is_empty());
    }

    #[test]
    fn oldest_orphan_is_evicted() {
        let mut pool = OrphanPool::new(2);
        let first = block(1, 0);
        pool.insert(first.clone());
        pool.insert(block(1, 1));
        pool.insert(block(3, 0));
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&first.hash()));
        assert_eq!(pool.take_children(&[1u8; 32]).len(), 1);
    }
}
