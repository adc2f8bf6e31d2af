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

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use croaring::Treemap;
use parking_lot::Mutex;

use crate::config::BufferType;
use crate::error::PoolError;
use crate::pool::lab::ChunkAllocator;
use crate::pool::{Block, DataDistribution};

#[derive(Default, Debug)]
pub struct BufferReadResult {
    pub blocks: Vec<Block>,
    pub read_len: i64,
}

/// Snapshot handed out by `create_flight`. The buffer keeps the same block
/// batch in its in-flight set until `finish_flight` acknowledges it.
pub struct Flight {
    pub id: u64,
    pub blocks: Arc<Vec<Block>>,
    pub size: i64,
}

/// The per-partition sink. Appends land in the staging store, a flush
/// atomically swaps the staging store into the in-flight set. The staging
/// layout is insertion-ordered or `(task_attempt_id, seq_no)` ordered, and
/// block payloads optionally relocate into the chunk arena.
pub struct PartitionBuffer {
    allocator: Option<Arc<ChunkAllocator>>,
    inner: Mutex<BufferInner>,
}

struct BufferInner {
    staging: Staging,
    in_flight: BTreeMap<u64, FlightSnapshot>,
    staging_size: i64,
    staging_block_num: i64,
    in_flight_size: i64,
    in_flight_block_num: i64,
    flight_counter: u64,
    evicted: bool,
}

struct FlightSnapshot {
    blocks: Arc<Vec<Block>>,
    size: i64,
    block_num: i64,
}

enum Staging {
    Insertion(Vec<Block>),
    TaskOrdered(BTreeMap<(i64, i64), Block>),
}

impl Staging {
    fn empty_like(&self) -> Staging {
        match self {
            Staging::Insertion(_) => Staging::Insertion(vec![]),
            Staging::TaskOrdered(_) => Staging::TaskOrdered(BTreeMap::new()),
        }
    }
}

impl PartitionBuffer {
    pub fn new(buffer_type: BufferType, allocator: Option<Arc<ChunkAllocator>>) -> Self {
        let staging = match buffer_type {
            BufferType::LINKED_LIST => Staging::Insertion(vec![]),
            BufferType::SKIP_LIST => Staging::TaskOrdered(BTreeMap::new()),
        };
        PartitionBuffer {
            allocator,
            inner: Mutex::new(BufferInner {
                staging,
                in_flight: BTreeMap::new(),
                staging_size: 0,
                staging_block_num: 0,
                in_flight_size: 0,
                in_flight_block_num: 0,
                flight_counter: 0,
                evicted: false,
            }),
        }
    }

    /// Appends the blocks and returns the bytes to charge against the pool.
    pub fn append(&self, blocks: Vec<Block>) -> Result<i64, PoolError> {
        let mut inner = self.inner.lock();
        if inner.evicted {
            return Err(PoolError::BUFFER_HAS_BEEN_EVICTED);
        }

        let mut appended = 0i64;
        let mut num = 0i64;
        for mut block in blocks {
            if let Some(allocator) = &self.allocator {
                block.data = allocator.allocate(&block.data);
            }
            appended += block.length as i64;
            num += 1;
            match &mut inner.staging {
                Staging::Insertion(list) => list.push(block),
                Staging::TaskOrdered(map) => {
                    let key = (block.task_attempt_id, block.seq_no);
                    if let Some(replaced) = map.insert(key, block) {
                        appended -= replaced.length as i64;
                        num -= 1;
                    }
                }
            }
        }
        inner.staging_size += appended;
        inner.staging_block_num += num;
        Ok(appended)
    }

    /// Atomically snapshots the staging blocks into the in-flight set and
    /// resets the staging store. `None` when there is nothing to flush, the
    /// buffer is terminal or the app is gone.
    pub fn create_flight<F>(&self, is_app_alive: F, distribution: DataDistribution) -> Option<Flight>
    where
        F: FnOnce() -> bool,
    {
        let mut inner = self.inner.lock();
        if inner.evicted || inner.staging_block_num == 0 || !is_app_alive() {
            return None;
        }
        Some(Self::take_flight(&mut inner, distribution))
    }

    /// The single-buffer fast path: the thresholds are re-checked under the
    /// buffer mutex before the snapshot is taken.
    pub fn create_flight_if_exceeds<F>(
        &self,
        size_threshold: i64,
        blocks_num_threshold: i64,
        is_app_alive: F,
        distribution: DataDistribution,
    ) -> Option<Flight>
    where
        F: FnOnce() -> bool,
    {
        let mut inner = self.inner.lock();
        if inner.evicted || inner.staging_block_num == 0 || !is_app_alive() {
            return None;
        }
        if inner.staging_size <= size_threshold && inner.staging_block_num <= blocks_num_threshold {
            return None;
        }
        Some(Self::take_flight(&mut inner, distribution))
    }

    fn take_flight(inner: &mut BufferInner, distribution: DataDistribution) -> Flight {
        let empty = inner.staging.empty_like();
        let staging = mem::replace(&mut inner.staging, empty);
        let blocks = match staging {
            Staging::Insertion(mut list) => {
                if distribution == DataDistribution::LOCAL_ORDER {
                    // stable sort keeps the per-task append order
                    list.sort_by_key(|block| block.task_attempt_id);
                }
                list
            }
            Staging::TaskOrdered(map) => map.into_values().collect(),
        };

        let size = inner.staging_size;
        let block_num = inner.staging_block_num;
        inner.staging_size = 0;
        inner.staging_block_num = 0;

        let id = inner.flight_counter;
        inner.flight_counter += 1;

        let blocks = Arc::new(blocks);
        inner.in_flight.insert(
            id,
            FlightSnapshot {
                blocks: blocks.clone(),
                size,
                block_num,
            },
        );
        inner.in_flight_size += size;
        inner.in_flight_block_num += block_num;

        Flight { id, blocks, size }
    }

    /// Acknowledges a dispatched flight and returns the bytes the buffer was
    /// still holding for it. 0 when the buffer already freed them itself.
    pub fn finish_flight(&self, flight_id: u64) -> i64 {
        let mut inner = self.inner.lock();
        match inner.in_flight.remove(&flight_id) {
            Some(snapshot) => {
                inner.in_flight_size -= snapshot.size;
                inner.in_flight_block_num -= snapshot.block_num;
                snapshot.size
            }
            None => 0,
        }
    }

    /// Reads up to `max_size` bytes of blocks after `last_block_id` (from
    /// the start when the id is not positive or unknown), in-flight flights
    /// first and staging last, optionally filtered by the task bitmap. The
    /// iteration plan is collected under the lock, the bytes are not copied.
    pub fn read(
        &self,
        last_block_id: i64,
        max_size: i64,
        task_ids_filter: Option<&Treemap>,
    ) -> BufferReadResult {
        let inner = self.inner.lock();

        let mut ordered: Vec<&Block> = Vec::with_capacity(
            (inner.staging_block_num + inner.in_flight_block_num) as usize,
        );
        for snapshot in inner.in_flight.values() {
            ordered.extend(snapshot.blocks.iter());
        }
        match &inner.staging {
            Staging::Insertion(list) => ordered.extend(list.iter()),
            Staging::TaskOrdered(map) => ordered.extend(map.values()),
        }

        let start = if last_block_id > 0 {
            ordered
                .iter()
                .position(|block| block.block_id == last_block_id)
                .map(|idx| idx + 1)
                .unwrap_or(0)
        } else {
            0
        };

        let mut fetched = vec![];
        let mut fetched_size = 0i64;
        for block in &ordered[start..] {
            if let Some(filter) = task_ids_filter {
                if !filter.contains(block.task_attempt_id as u64) {
                    continue;
                }
            }
            if fetched_size >= max_size {
                break;
            }
            fetched_size += block.length as i64;
            fetched.push((*block).clone());
        }

        BufferReadResult {
            blocks: fetched,
            read_len: fetched_size,
        }
    }

    /// Terminal: drops the staging blocks and every in-flight snapshot.
    /// Returns `(staging_bytes, in_flight_bytes)` on the first call and
    /// zeros afterwards.
    pub fn release(&self) -> (i64, i64) {
        let mut inner = self.inner.lock();
        if inner.evicted {
            return (0, 0);
        }
        inner.evicted = true;

        let staging_size = inner.staging_size;
        let in_flight_size = inner.in_flight_size;
        let empty = inner.staging.empty_like();
        inner.staging = empty;
        inner.in_flight.clear();
        inner.staging_size = 0;
        inner.staging_block_num = 0;
        inner.in_flight_size = 0;
        inner.in_flight_block_num = 0;

        (staging_size, in_flight_size)
    }

    pub fn staging_size(&self) -> i64 {
        self.inner.lock().staging_size
    }

    pub fn staging_block_num(&self) -> i64 {
        self.inner.lock().staging_block_num
    }

    pub fn in_flight_block_num(&self) -> i64 {
        self.inner.lock().in_flight_block_num
    }

    pub fn total_size(&self) -> i64 {
        let inner = self.inner.lock();
        inner.staging_size + inner.in_flight_size
    }

    pub fn is_evicted(&self) -> bool {
        self.inner.lock().evicted
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn block(block_id: i64, task_attempt_id: i64, seq_no: i64, length: i32) -> Block {
        Block {
            block_id,
            length,
            uncompress_length: length,
            crc: 0,
            seq_no,
            task_attempt_id,
            data: Bytes::from(vec![block_id as u8; length as usize]),
        }
    }

    fn insertion_buffer() -> PartitionBuffer {
        PartitionBuffer::new(BufferType::LINKED_LIST, None)
    }

    #[test]
    fn test_append_and_read_in_insertion_order() {
        let buffer = insertion_buffer();
        let appended = buffer
            .append(vec![block(1, 0, 0, 10), block(2, 0, 1, 20), block(3, 1, 0, 30)])
            .unwrap();
        assert_eq!(60, appended);
        assert_eq!(60, buffer.staging_size());
        assert_eq!(3, buffer.staging_block_num());

        let result = buffer.read(0, 1024, None);
        assert_eq!(
            vec![1, 2, 3],
            result.blocks.iter().map(|b| b.block_id).collect::<Vec<_>>()
        );
        assert_eq!(60, result.read_len);
    }

    #[test]
    fn test_task_ordered_layout() {
        let buffer = PartitionBuffer::new(BufferType::SKIP_LIST, None);
        buffer
            .append(vec![block(10, 2, 0, 10), block(11, 1, 1, 10), block(12, 1, 0, 10)])
            .unwrap();

        let flight = buffer
            .create_flight(|| true, DataDistribution::NORMAL)
            .unwrap();
        let ids: Vec<_> = flight.blocks.iter().map(|b| b.block_id).collect();
        // ordered by (task_attempt_id, seq_no)
        assert_eq!(vec![12, 11, 10], ids);
    }

    #[test]
    fn test_local_order_sorts_insertion_layout() {
        let buffer = insertion_buffer();
        buffer
            .append(vec![block(1, 5, 0, 10), block(2, 3, 0, 10), block(3, 5, 1, 10)])
            .unwrap();

        let flight = buffer
            .create_flight(|| true, DataDistribution::LOCAL_ORDER)
            .unwrap();
        let tasks: Vec<_> = flight.blocks.iter().map(|b| b.task_attempt_id).collect();
        assert_eq!(vec![3, 5, 5], tasks);
        // the per-task order of appends survives the stable sort
        let ids: Vec<_> = flight.blocks.iter().map(|b| b.block_id).collect();
        assert_eq!(vec![2, 1, 3], ids);
    }

    #[test]
    fn test_flight_lifecycle() {
        let buffer = insertion_buffer();
        buffer.append(vec![block(1, 0, 0, 100)]).unwrap();

        let flight = buffer.create_flight(|| true, DataDistribution::NORMAL).unwrap();
        assert_eq!(100, flight.size);
        assert_eq!(0, buffer.staging_size());
        assert_eq!(100, buffer.total_size());
        // nothing staged anymore
        assert!(buffer.create_flight(|| true, DataDistribution::NORMAL).is_none());

        assert_eq!(100, buffer.finish_flight(flight.id));
        assert_eq!(0, buffer.total_size());
        // the acknowledgement is idempotent
        assert_eq!(0, buffer.finish_flight(flight.id));
    }

    #[test]
    fn test_flight_skipped_for_dead_app() {
        let buffer = insertion_buffer();
        buffer.append(vec![block(1, 0, 0, 100)]).unwrap();
        assert!(buffer.create_flight(|| false, DataDistribution::NORMAL).is_none());
        assert_eq!(100, buffer.staging_size());
    }

    #[test]
    fn test_single_buffer_threshold_double_check() {
        let buffer = insertion_buffer();
        buffer.append(vec![block(1, 0, 0, 100)]).unwrap();

        assert!(buffer
            .create_flight_if_exceeds(100, 10, || true, DataDistribution::NORMAL)
            .is_none());
        assert!(buffer
            .create_flight_if_exceeds(99, 10, || true, DataDistribution::NORMAL)
            .is_some());
    }

    #[test]
    fn test_read_across_flight_and_staging() {
        let buffer = insertion_buffer();
        buffer.append(vec![block(1, 0, 0, 10), block(2, 0, 1, 10)]).unwrap();
        let _flight = buffer.create_flight(|| true, DataDistribution::NORMAL).unwrap();
        buffer.append(vec![block(3, 0, 2, 10)]).unwrap();

        // in-flight blocks first, then staging
        let result = buffer.read(0, 1024, None);
        assert_eq!(
            vec![1, 2, 3],
            result.blocks.iter().map(|b| b.block_id).collect::<Vec<_>>()
        );

        // resume after an id that sits inside the in-flight snapshot
        let result = buffer.read(2, 1024, None);
        assert_eq!(
            vec![3],
            result.blocks.iter().map(|b| b.block_id).collect::<Vec<_>>()
        );

        // unknown id falls back to the start
        let result = buffer.read(100, 1024, None);
        assert_eq!(3, result.blocks.len());
    }

    #[test]
    fn test_read_size_limit() {
        let buffer = insertion_buffer();
        buffer
            .append(vec![block(1, 0, 0, 10), block(2, 0, 1, 10), block(3, 0, 2, 10)])
            .unwrap();

        let result = buffer.read(0, 20, None);
        assert_eq!(2, result.blocks.len());
        assert_eq!(20, result.read_len);
    }

    #[test]
    fn test_read_with_task_filter() {
        let buffer = insertion_buffer();
        buffer
            .append(vec![block(1, 0, 0, 10), block(2, 1, 0, 10), block(3, 0, 1, 10)])
            .unwrap();

        let mut bitmap = Treemap::default();
        bitmap.add(1);
        let result = buffer.read(0, 1024, Some(&bitmap));
        assert_eq!(
            vec![2],
            result.blocks.iter().map(|b| b.block_id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_release_is_terminal_and_idempotent() {
        let buffer = insertion_buffer();
        buffer.append(vec![block(1, 0, 0, 10), block(2, 0, 1, 10)]).unwrap();
        let flight = buffer.create_flight(|| true, DataDistribution::NORMAL).unwrap();
        buffer.append(vec![block(3, 0, 2, 30)]).unwrap();

        let (staging, in_flight) = buffer.release();
        assert_eq!(30, staging);
        assert_eq!(20, in_flight);
        assert!(buffer.is_evicted());

        // the late acknowledgement finds nothing to free
        assert_eq!(0, buffer.finish_flight(flight.id));
        assert_eq!((0, 0), buffer.release());

        assert!(matches!(
            buffer.append(vec![block(4, 0, 3, 10)]),
            Err(PoolError::BUFFER_HAS_BEEN_EVICTED)
        ));
        assert!(buffer.read(0, 1024, None).blocks.is_empty());
    }

    #[test]
    fn test_flights_partition_the_append_sequence() {
        let buffer = insertion_buffer();
        let mut flights = vec![];

        let mut id = 0i64;
        for round in 0..3 {
            for _ in 0..=round {
                id += 1;
                buffer.append(vec![block(id, 0, id, 1)]).unwrap();
            }
            flights.push(buffer.create_flight(|| true, DataDistribution::NORMAL).unwrap());
        }
        id += 1;
        buffer.append(vec![block(id, 0, id, 1)]).unwrap();

        // the read view yields the exact append sequence, and the flight
        // concatenation is a prefix of it: no duplication, no loss
        let all: Vec<i64> = buffer
            .read(0, i64::MAX, None)
            .blocks
            .iter()
            .map(|b| b.block_id)
            .collect();
        assert_eq!((1..=id).collect::<Vec<_>>(), all);

        let mut flight_ids = vec![];
        for flight in &flights {
            flight_ids.extend(flight.blocks.iter().map(|b| b.block_id));
        }
        assert_eq!(all[..flight_ids.len()], flight_ids[..]);
    }

    #[test]
    fn test_lab_backed_buffer() {
        let allocator = Arc::new(ChunkAllocator::new(4 * 1024, 64 * 1024, 1024));
        let buffer = PartitionBuffer::new(BufferType::LINKED_LIST, Some(allocator));
        buffer.append(vec![block(1, 0, 0, 100), block(2, 0, 1, 200)]).unwrap();

        let result = buffer.read(0, 1024, None);
        assert_eq!(2, result.blocks.len());
        assert_eq!(vec![1u8; 100], result.blocks[0].data.as_ref());
        assert_eq!(vec![2u8; 200], result.blocks[1].data.as_ref());
    }
}
