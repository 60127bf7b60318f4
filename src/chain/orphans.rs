//! Bounded orphan pool for blocks that arrive before their parents.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::core::block::FullBlock;
use crate::core::hash::Hash;

/// Maximum orphans held at once; the least recently touched is evicted.
const MAX_ORPHANS: usize = 128;

/// Orphans keyed by the parent hash they are waiting for.
pub struct OrphanPool {
    by_parent: Mutex<LruCache<Hash, FullBlock>>,
}

impl Default for OrphanPool {
    fn default() -> Self {
        OrphanPool {
            by_parent: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_ORPHANS).expect("nonzero capacity"),
            )),
        }
    }
}

impl OrphanPool {
    pub fn new() -> Self {
        OrphanPool::default()
    }

    /// Hold a block until its parent shows up.
    pub fn add(&self, block: FullBlock) {
        let parent = block.header.prev_hash;
        self.by_parent.lock().expect("orphan lock").put(parent, block);
    }

    /// Release the orphan waiting on `parent`, if any.
    pub fn take_child_of(&self, parent: &Hash) -> Option<FullBlock> {
        self.by_parent.lock().expect("orphan lock").pop(parent)
    }

    pub fn contains_child_of(&self, parent: &Hash) -> bool {
        self.by_parent.lock().expect("orphan lock").contains(parent)
    }

    pub fn len(&self) -> usize {
        self.by_parent.lock().expect("orphan lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::genesis;

    #[test]
    fn add_and_take() {
        let pool = OrphanPool::new();
        let block = genesis();
        let parent = block.header.prev_hash;

        assert!(pool.take_child_of(&parent).is_none());
        pool.add(block.clone());
        assert!(pool.contains_child_of(&parent));
        assert_eq!(pool.take_child_of(&parent).unwrap(), block);
        assert!(pool.is_empty());
    }

    #[test]
    fn capacity_bounded() {
        let pool = OrphanPool::new();
        for i in 0..(MAX_ORPHANS + 10) {
            let mut block = genesis();
            block.header.prev_hash = crate::core::hash::hash_bytes(&i.to_be_bytes());
            pool.add(block);
        }
        assert_eq!(pool.len(), MAX_ORPHANS);
    }
}
