//! Physical block allocator for the content store.
//!
//! Content blocks are all one size, so the allocator hands out fixed-size
//! slots. Freed slots are reused lowest-first before the high-water mark is
//! advanced, which keeps the used region of the backing provider compact.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block::PhysicalBlock;
use crate::error::{DedupeError, DedupeResult};

/// Configuration for the slot allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Total number of slots available on the backing provider
    pub total_blocks: u64,
}

/// Fixed-size slot allocator. Thread-safe via internal mutex.
pub struct BlockAllocator {
    inner: Mutex<AllocatorInner>,
}

struct AllocatorInner {
    total_blocks: u64,
    /// Slots below this mark have been handed out at least once.
    high_water: u64,
    free_list: BTreeSet<u64>,
    total_allocations: u64,
    total_frees: u64,
}

impl AllocatorInner {
    fn allocate(&mut self) -> DedupeResult<PhysicalBlock> {
        let slot = if let Some(slot) = self.free_list.pop_first() {
            slot
        } else if self.high_water < self.total_blocks {
            self.high_water += 1;
            self.high_water - 1
        } else {
            return Err(DedupeError::OutOfSpace);
        };
        self.total_allocations += 1;
        debug!(slot, "allocated content slot");
        Ok(PhysicalBlock(slot))
    }

    fn free(&mut self, block: PhysicalBlock) -> DedupeResult<()> {
        let slot = block.0;
        if slot >= self.high_water {
            return Err(DedupeError::invalid(format!(
                "free of never-allocated slot {} (high water {})",
                slot, self.high_water
            )));
        }
        if !self.free_list.insert(slot) {
            return Err(DedupeError::invalid(format!("double free of slot {}", slot)));
        }
        self.total_frees += 1;

        // Give back the tail so the high-water mark shrinks with the data.
        while self.high_water > 0 && self.free_list.remove(&(self.high_water - 1)) {
            self.high_water -= 1;
        }
        debug!(slot, high_water = self.high_water, "freed content slot");
        Ok(())
    }

    fn stats(&self) -> AllocatorStats {
        let used = self.high_water - self.free_list.len() as u64;
        AllocatorStats {
            total_blocks: self.total_blocks,
            used_blocks: used,
            free_blocks: self.total_blocks - used,
            high_water: self.high_water,
            total_allocations: self.total_allocations,
            total_frees: self.total_frees,
        }
    }
}

impl BlockAllocator {
    /// Create a new allocator with every slot free.
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            inner: Mutex::new(AllocatorInner {
                total_blocks: config.total_blocks,
                high_water: 0,
                free_list: BTreeSet::new(),
                total_allocations: 0,
                total_frees: 0,
            }),
        }
    }

    /// Rebuild an allocator whose `used` slots are taken; every other slot
    /// below the highest used one goes on the free list.
    pub fn with_used(config: AllocatorConfig, used: &BTreeSet<u64>) -> DedupeResult<Self> {
        let high_water = used.last().map_or(0, |slot| slot + 1);
        if high_water > config.total_blocks {
            return Err(DedupeError::invalid(format!(
                "slot {} beyond {} slots",
                high_water - 1,
                config.total_blocks
            )));
        }
        let free_list = (0..high_water).filter(|s| !used.contains(s)).collect();
        debug!(used = used.len(), high_water, "allocator restored");
        Ok(Self {
            inner: Mutex::new(AllocatorInner {
                total_blocks: config.total_blocks,
                high_water,
                free_list,
                total_allocations: 0,
                total_frees: 0,
            }),
        })
    }

    /// Allocate one slot, or `OutOfSpace`.
    pub fn allocate(&self) -> DedupeResult<PhysicalBlock> {
        self.inner.lock().allocate()
    }

    /// Return a previously allocated slot.
    pub fn free(&self, block: PhysicalBlock) -> DedupeResult<()> {
        self.inner.lock().free(block)
    }

    /// Returns current allocation statistics.
    pub fn stats(&self) -> AllocatorStats {
        self.inner.lock().stats()
    }
}

/// Statistics about the allocator's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    /// Total slots
    pub total_blocks: u64,
    /// Slots currently holding content
    pub used_blocks: u64,
    /// Slots available for allocation
    pub free_blocks: u64,
    /// One past the highest slot handed out
    pub high_water: u64,
    /// Total allocations performed
    pub total_allocations: u64,
    /// Total frees performed
    pub total_frees: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(total_blocks: u64) -> BlockAllocator {
        BlockAllocator::new(AllocatorConfig { total_blocks })
    }

    #[test]
    fn test_new_allocator() {
        let stats = allocator(1024).stats();
        assert_eq!(stats.total_blocks, 1024);
        assert_eq!(stats.free_blocks, 1024);
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.total_allocations, 0);
    }

    #[test]
    fn test_allocate_sequential() {
        let alloc = allocator(8);
        assert_eq!(alloc.allocate().unwrap(), PhysicalBlock(0));
        assert_eq!(alloc.allocate().unwrap(), PhysicalBlock(1));
        assert_eq!(alloc.allocate().unwrap(), PhysicalBlock(2));
        assert_eq!(alloc.stats().used_blocks, 3);
    }

    #[test]
    fn test_allocate_until_full() {
        let alloc = allocator(16);
        let mut count = 0;
        while alloc.allocate().is_ok() {
            count += 1;
        }
        assert_eq!(count, 16);
        assert!(matches!(alloc.allocate(), Err(DedupeError::OutOfSpace)));
    }

    #[test]
    fn test_free_reuses_lowest_slot() {
        let alloc = allocator(8);
        let blocks: Vec<_> = (0..5).map(|_| alloc.allocate().unwrap()).collect();
        alloc.free(blocks[3]).unwrap();
        alloc.free(blocks[1]).unwrap();
        assert_eq!(alloc.allocate().unwrap(), PhysicalBlock(1));
        assert_eq!(alloc.allocate().unwrap(), PhysicalBlock(3));
        assert_eq!(alloc.allocate().unwrap(), PhysicalBlock(5));
    }

    #[test]
    fn test_high_water_shrinks() {
        let alloc = allocator(8);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        let c = alloc.allocate().unwrap();
        alloc.free(b).unwrap();
        assert_eq!(alloc.stats().high_water, 3);
        alloc.free(c).unwrap();
        assert_eq!(alloc.stats().high_water, 1);
        alloc.free(a).unwrap();
        let stats = alloc.stats();
        assert_eq!(stats.high_water, 0);
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.free_blocks, 8);
    }

    #[test]
    fn test_double_free_rejected() {
        let alloc = allocator(8);
        let a = alloc.allocate().unwrap();
        let _b = alloc.allocate().unwrap();
        alloc.free(a).unwrap();
        assert!(alloc.free(a).is_err());
        assert!(alloc.free(PhysicalBlock(7)).is_err());
    }

    #[test]
    fn test_with_used() {
        let used: BTreeSet<u64> = [0, 2, 5].into_iter().collect();
        let alloc = BlockAllocator::with_used(AllocatorConfig { total_blocks: 8 }, &used).unwrap();
        let stats = alloc.stats();
        assert_eq!(stats.used_blocks, 3);
        assert_eq!(stats.high_water, 6);
        assert_eq!(alloc.allocate().unwrap(), PhysicalBlock(1));
        assert_eq!(alloc.allocate().unwrap(), PhysicalBlock(3));
        assert_eq!(alloc.allocate().unwrap(), PhysicalBlock(4));
        assert_eq!(alloc.allocate().unwrap(), PhysicalBlock(6));
        assert!(alloc.free(PhysicalBlock(2)).is_ok());

        let beyond: BTreeSet<u64> = [8].into_iter().collect();
        assert!(BlockAllocator::with_used(AllocatorConfig { total_blocks: 8 }, &beyond).is_err());
    }

    #[test]
    fn test_zero_capacity() {
        let alloc = allocator(0);
        assert!(matches!(alloc.allocate(), Err(DedupeError::OutOfSpace)));
    }
}
