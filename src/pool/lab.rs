// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// Slab arena for the short-lived small blocks of a partition. Block copies
/// are packed into fixed-size chunks so one chunk backs many blocks and the
/// whole chunk returns at once when the last view drops. Requests above
/// `max_alloc` bypass the arena.
pub struct ChunkAllocator {
    chunk_size: usize,
    max_alloc: usize,
    // chunks the arena may hold handles to, derived from the pool capacity
    max_chunks: usize,
    inner: Mutex<AllocatorInner>,
}

struct AllocatorInner {
    current: BytesMut,
    // whether `current` is backed by a real chunk allocation
    backed: bool,
    // drained chunks waiting for their outstanding views to drop
    retired: VecDeque<BytesMut>,
}

impl ChunkAllocator {
    pub fn new(chunk_size: usize, pool_capacity: usize, max_alloc: usize) -> ChunkAllocator {
        let chunk_size = chunk_size.max(4 * 1024);
        let max_chunks = (pool_capacity / chunk_size).max(1);
        let max_alloc = max_alloc.min(chunk_size);
        ChunkAllocator {
            chunk_size,
            max_alloc,
            max_chunks,
            inner: Mutex::new(AllocatorInner {
                current: BytesMut::new(),
                backed: false,
                retired: VecDeque::new(),
            }),
        }
    }

    /// Copies `data` into the arena and returns a view sharing the chunk
    /// allocation. Falls back to a direct copy for oversized requests or
    /// when the arena is at its chunk cap and nothing is reclaimable.
    pub fn allocate(&self, data: &[u8]) -> Bytes {
        if data.is_empty() || data.len() > self.max_alloc {
            return Bytes::copy_from_slice(data);
        }

        let mut inner = self.inner.lock();
        if inner.current.capacity() < data.len() {
            match self.next_chunk(&mut inner) {
                Some(chunk) => {
                    let exhausted = std::mem::replace(&mut inner.current, chunk);
                    if inner.backed {
                        inner.retired.push_back(exhausted);
                        while inner.retired.len() > self.max_chunks {
                            inner.retired.pop_front();
                        }
                    }
                    inner.backed = true;
                }
                None => return Bytes::copy_from_slice(data),
            }
        }

        inner.current.extend_from_slice(data);
        inner.current.split().freeze()
    }

    // A retired chunk whose views all dropped is reclaimed for reuse.
    fn next_chunk(&self, inner: &mut AllocatorInner) -> Option<BytesMut> {
        for idx in 0..inner.retired.len() {
            if inner.retired[idx].try_reclaim(self.chunk_size) {
                let mut chunk = inner.retired.remove(idx).unwrap();
                chunk.clear();
                return Some(chunk);
            }
        }
        let held = inner.retired.len() + usize::from(inner.backed);
        if held < self.max_chunks {
            return Some(BytesMut::with_capacity(self.chunk_size));
        }
        None
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn max_alloc(&self) -> usize {
        self.max_alloc
    }

    // only for test cases
    #[allow(dead_code)]
    pub(crate) fn retired_chunks(&self) -> usize {
        self.inner.lock().retired.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_allocate_and_pack() {
        let allocator = ChunkAllocator::new(4 * 1024, 64 * 1024, 1024);

        let b1 = allocator.allocate(b"hello");
        let b2 = allocator.allocate(b"world");
        assert_eq!(b"hello", b1.as_ref());
        assert_eq!(b"world", b2.as_ref());
        // packed into one chunk, nothing retired yet
        assert_eq!(0, allocator.retired_chunks());
    }

    #[test]
    fn test_oversized_fallback() {
        let allocator = ChunkAllocator::new(4 * 1024, 64 * 1024, 16);
        let data = vec![1u8; 1024];
        let bytes = allocator.allocate(&data);
        assert_eq!(data, bytes.as_ref());
        assert_eq!(0, allocator.retired_chunks());
    }

    #[test]
    fn test_chunk_rotation_and_reclaim() {
        // 4KiB chunks, up to 4 chunks held by the arena
        let allocator = ChunkAllocator::new(4 * 1024, 16 * 1024, 2 * 1024);

        let mut views = vec![];
        for _ in 0..4 {
            views.push(allocator.allocate(&vec![7u8; 2 * 1024]));
        }
        // the first chunk is drained and retired, the second is current
        assert_eq!(1, allocator.retired_chunks());

        // dropping every view makes the retired chunk reclaimable, so
        // further rotations recycle instead of growing the arena
        views.clear();
        for _ in 0..8 {
            let _ = allocator.allocate(&vec![8u8; 2 * 1024]);
        }
        assert_eq!(1, allocator.retired_chunks());
    }

    #[test]
    fn test_fallback_when_capped() {
        // a single-chunk arena: once drained with live views, allocations
        // fall back to the general allocator instead of carving new chunks
        let allocator = ChunkAllocator::new(4 * 1024, 4 * 1024, 4 * 1024);

        let held = allocator.allocate(&vec![1u8; 4 * 1024]);
        let fallback = allocator.allocate(&vec![2u8; 1024]);
        assert_eq!(1024, fallback.len());
        assert_eq!(4 * 1024, held.len());
        assert_eq!(0, allocator.retired_chunks());
    }
}
