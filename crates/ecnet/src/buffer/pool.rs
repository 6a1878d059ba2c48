// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! Shared block pool backing all send buffers of a server instance.
//!
//! Blocks are fixed-size byte vectors recycled through a locked free
//! list. The lock makes the pool safe to touch from auxiliary threads;
//! session-path usage stays on the owning thread.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{SNDBUF_BLOCK_SIZE, SNDBUF_POOL_BLOCKS};

/// Fixed-size block allocator with a free list.
pub struct BlockPool {
    free: Mutex<Vec<Vec<u8>>>,
    block_size: usize,
}

impl BlockPool {
    /// Pool with the default block size, pre-warmed to 4 MiB.
    pub fn new() -> Arc<Self> {
        Self::with_block_size(SNDBUF_BLOCK_SIZE, SNDBUF_POOL_BLOCKS)
    }

    /// Pool with an explicit block size and pre-warm count.
    pub fn with_block_size(block_size: usize, prewarm: usize) -> Arc<Self> {
        let free = (0..prewarm)
            .map(|_| Vec::with_capacity(block_size))
            .collect();
        Arc::new(Self {
            free: Mutex::new(free),
            block_size,
        })
    }

    /// Block capacity in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Take a cleared block, allocating if the free list is empty.
    pub fn acquire(&self) -> Vec<u8> {
        let mut free = self.free.lock();
        match free.pop() {
            Some(mut blk) => {
                blk.clear();
                blk
            }
            None => Vec::with_capacity(self.block_size),
        }
    }

    /// Return a block to the free list.
    ///
    /// Blocks that were grown past the pool's block size are dropped
    /// instead of being cached.
    pub fn release(&self, blk: Vec<u8>) {
        if blk.capacity() < self.block_size || blk.capacity() > self.block_size * 2 {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < SNDBUF_POOL_BLOCKS * 2 {
            free.push(blk);
        }
    }

    /// Number of cached free blocks.
    pub fn free_blocks(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_recycles() {
        let pool = BlockPool::with_block_size(1024, 2);
        assert_eq!(pool.free_blocks(), 2);

        let blk = pool.acquire();
        assert_eq!(pool.free_blocks(), 1);
        assert_eq!(blk.capacity(), 1024);
        assert!(blk.is_empty());

        pool.release(blk);
        assert_eq!(pool.free_blocks(), 2);
    }

    #[test]
    fn test_acquire_beyond_prewarm_allocates() {
        let pool = BlockPool::with_block_size(64, 1);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.free_blocks(), 0);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.free_blocks(), 2);
    }

    #[test]
    fn test_oversized_block_not_cached() {
        let pool = BlockPool::with_block_size(64, 0);
        let blk = Vec::with_capacity(64 * 16);
        pool.release(blk);
        assert_eq!(pool.free_blocks(), 0);
    }
}
