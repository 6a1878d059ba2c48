// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! Per-session send buffer: a FIFO of pooled blocks with a hard byte cap.
//!
//! Appending past the cap fails instead of blocking or growing; draining
//! is driven by the event server when the socket signals writability.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffer::BlockPool;
use crate::error::{Error, Result};

struct Chunk {
    data: Vec<u8>,
    read: usize,
}

/// Chunked byte FIFO awaiting socket write.
pub struct SendBuffer {
    chunks: VecDeque<Chunk>,
    pool: Arc<BlockPool>,
    size: usize,
    cap: usize,
}

impl SendBuffer {
    pub fn new(cap: usize, pool: Arc<BlockPool>) -> Self {
        Self {
            chunks: VecDeque::new(),
            pool,
            size: 0,
            cap,
        }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Buffer cap in bytes.
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Back-pressure indicator: `10000 * len / cap`.
    pub fn water_level(&self) -> u32 {
        if self.cap == 0 {
            return 10_000;
        }
        ((self.size as u64 * 10_000) / self.cap as u64) as u32
    }

    /// Append bytes; fails with [`Error::BufferFull`] if the cap would be
    /// exceeded, leaving the buffer unchanged.
    pub fn append(&mut self, mut data: &[u8]) -> Result<()> {
        if self.size + data.len() > self.cap {
            return Err(Error::BufferFull);
        }
        let block = self.pool.block_size();
        self.size += data.len();
        while !data.is_empty() {
            let tail_room = self
                .chunks
                .back()
                .map(|c| block.saturating_sub(c.data.len()))
                .unwrap_or(0);
            if tail_room == 0 {
                self.chunks.push_back(Chunk {
                    data: self.pool.acquire(),
                    read: 0,
                });
                continue;
            }
            let n = tail_room.min(data.len());
            if let Some(tail) = self.chunks.back_mut() {
                tail.data.extend_from_slice(&data[..n]);
            }
            data = &data[n..];
        }
        Ok(())
    }

    /// Next contiguous region to write, or None when empty.
    pub fn peek_contiguous(&self) -> Option<&[u8]> {
        self.chunks.front().map(|c| &c.data[c.read..])
    }

    /// Release the first `n` bytes (previously written to the socket).
    pub fn consume(&mut self, mut n: usize) {
        debug_assert!(n <= self.size);
        self.size -= n.min(self.size);
        while n > 0 {
            let done = match self.chunks.front_mut() {
                Some(front) => {
                    let avail = front.data.len() - front.read;
                    let take = avail.min(n);
                    front.read += take;
                    n -= take;
                    front.read == front.data.len()
                }
                None => break,
            };
            if done {
                if let Some(chunk) = self.chunks.pop_front() {
                    self.pool.release(chunk.data);
                }
            }
        }
    }

    /// Drop all buffered bytes, returning blocks to the pool.
    pub fn clear(&mut self) {
        while let Some(chunk) = self.chunks.pop_front() {
            self.pool.release(chunk.data);
        }
        self.size = 0;
    }
}

impl Drop for SendBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(cap: usize) -> SendBuffer {
        SendBuffer::new(cap, BlockPool::with_block_size(16, 2))
    }

    #[test]
    fn test_append_peek_consume() {
        let mut sb = buf(1024);
        sb.append(b"hello ").expect("append should fit");
        sb.append(b"world").expect("append should fit");
        assert_eq!(sb.len(), 11);

        let mut out = Vec::new();
        while let Some(region) = sb.peek_contiguous() {
            out.extend_from_slice(region);
            let n = region.len();
            sb.consume(n);
        }
        assert_eq!(out, b"hello world");
        assert!(sb.is_empty());
    }

    #[test]
    fn test_cap_enforced() {
        let mut sb = buf(8);
        assert!(sb.append(b"12345678").is_ok());
        let err = sb.append(b"9").unwrap_err();
        assert!(matches!(err, Error::BufferFull));
        assert_eq!(sb.len(), 8, "failed append must not change the buffer");
    }

    #[test]
    fn test_spans_blocks() {
        let mut sb = buf(1024);
        let payload: Vec<u8> = (0..100u8).collect();
        sb.append(&payload).expect("append should fit");

        let mut out = Vec::new();
        while let Some(region) = sb.peek_contiguous() {
            assert!(region.len() <= 16, "chunks bounded by block size");
            out.extend_from_slice(region);
            let n = region.len();
            sb.consume(n);
        }
        assert_eq!(out, payload);
    }

    #[test]
    fn test_partial_consume() {
        let mut sb = buf(1024);
        sb.append(b"abcdef").expect("append should fit");
        sb.consume(2);
        assert_eq!(sb.peek_contiguous(), Some(&b"cdef"[..]));
        assert_eq!(sb.len(), 4);
    }

    #[test]
    fn test_water_level() {
        let mut sb = buf(100);
        assert_eq!(sb.water_level(), 0);
        sb.append(&[0u8; 25]).expect("append should fit");
        assert_eq!(sb.water_level(), 2500);
        sb.append(&[0u8; 75]).expect("append should fit");
        assert_eq!(sb.water_level(), 10_000);
    }

    #[test]
    fn test_blocks_recycled_through_pool() {
        let pool = BlockPool::with_block_size(16, 0);
        let mut sb = SendBuffer::new(1024, pool.clone());
        sb.append(&[7u8; 64]).expect("append should fit");
        sb.consume(64);
        assert!(pool.free_blocks() >= 4);
    }
}
