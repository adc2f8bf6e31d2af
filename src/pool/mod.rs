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

pub mod budget;
pub mod buffer;
pub mod capacity;
pub mod lab;
pub mod manager;
pub mod range_map;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::metric::GAUGE_FLUSH_EVENT_NUMBER;
use crate::pool::budget::MemoryBudget;
use crate::pool::buffer::{Flight, PartitionBuffer};
use crate::util::now_timestamp_as_millis;

#[derive(Debug, Clone)]
pub struct Block {
    pub block_id: i64,
    pub length: i32,
    pub uncompress_length: i32,
    pub crc: i64,
    pub seq_no: i64,
    pub task_attempt_id: i64,
    pub data: Bytes,
}

#[derive(Debug)]
pub struct PartitionedData {
    pub partition_id: i32,
    pub blocks: Vec<Block>,
}

impl PartitionedData {
    pub fn from(partition_id: i32, blocks: Vec<Block>) -> Self {
        PartitionedData {
            partition_id,
            blocks,
        }
    }

    pub fn data_size(&self) -> i64 {
        self.blocks.iter().map(|block| block.length as i64).sum()
    }
}

#[derive(Clone, Debug)]
pub struct DataSegment {
    pub block_id: i64,
    pub offset: i64,
    pub length: i32,
    pub uncompress_length: i32,
    pub crc: i64,
    pub task_attempt_id: i64,
}

#[derive(Default, Debug)]
pub struct PartitionedMemoryData {
    pub shuffle_data_block_segments: Vec<DataSegment>,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum DataDistribution {
    NORMAL,
    LOCAL_ORDER,
}

/// App lifecycle view provided by the external task manager. Appends and
/// flush dispatch hold the app lock shared, removal holds it exclusive.
pub trait TaskManager: Send + Sync {
    fn app_lock(&self, app_id: &str) -> Arc<RwLock<()>>;

    fn is_app_expired(&self, app_id: &str) -> bool;

    fn is_huge_partition(&self, app_id: &str, shuffle_id: i32, partition_id: i32) -> bool;
}

/// Sink of flush events owned by the external flush manager. The enqueue
/// must not block, the back-pressure is the pool's memory counters.
pub trait FlushQueue: Send + Sync {
    fn add_to_flush_queue(&self, event: FlushEvent);

    fn data_distribution(&self, app_id: &str) -> DataDistribution;
}

/// One batch of blocks snapshotted out of a partition buffer and handed to
/// the flush manager. Whatever the flush outcome is, `on_flush_completed`
/// settles the memory accounting exactly once.
pub struct FlushEvent {
    pub app_id: String,
    pub shuffle_id: i32,
    pub start_partition: i32,
    pub end_partition: i32,
    pub blocks: Arc<Vec<Block>>,
    pub size: i64,
    pub is_huge: bool,
    pub flight_id: u64,

    created_timestamp: u128,
    completed: AtomicBool,
    buffer: Weak<PartitionBuffer>,
    budget: MemoryBudget,
}

impl FlushEvent {
    pub(crate) fn new(
        app_id: &str,
        shuffle_id: i32,
        start_partition: i32,
        end_partition: i32,
        flight: Flight,
        is_huge: bool,
        buffer: Weak<PartitionBuffer>,
        budget: MemoryBudget,
    ) -> Self {
        FlushEvent {
            app_id: app_id.to_string(),
            shuffle_id,
            start_partition,
            end_partition,
            size: flight.size,
            blocks: flight.blocks,
            is_huge,
            flight_id: flight.id,
            created_timestamp: now_timestamp_as_millis(),
            completed: AtomicBool::new(false),
            buffer,
            budget,
        }
    }

    /// The cleanup callback invoked by the flush manager when the event has
    /// been drained, no matter whether the flush succeeded or failed.
    /// Idempotent: only the first invocation releases memory.
    pub fn on_flush_completed(&self) {
        if self.completed.swap(true, SeqCst) {
            warn!(
                "The flush event of app:[{}] shuffle:[{}] has been completed more than once.",
                &self.app_id, self.shuffle_id
            );
            return;
        }

        // The buffer settles how many bytes it still holds for this flight.
        // 0 means the buffer was removed meanwhile and has freed them itself.
        let freed = self
            .buffer
            .upgrade()
            .map(|buffer| buffer.finish_flight(self.flight_id))
            .unwrap_or(0);
        if freed > 0 {
            self.budget.release_memory(freed, true, false);
        }
        GAUGE_FLUSH_EVENT_NUMBER.dec();

        debug!(
            "[flush] the event of app:[{}] shuffle:[{}] partitions:[{}-{}] with {} bytes finished in {}(ms)",
            &self.app_id,
            self.shuffle_id,
            self.start_partition,
            self.end_partition,
            self.size,
            now_timestamp_as_millis() - self.created_timestamp
        );
    }
}

impl Drop for FlushEvent {
    fn drop(&mut self) {
        if !self.completed.load(SeqCst) {
            warn!(
                "The flush event of app:[{}] shuffle:[{}] was dropped without completion.",
                &self.app_id, self.shuffle_id
            );
            self.on_flush_completed();
        }
    }
}

/// Task manager for standalone pools and tests. Apps never expire and no
/// partition is huge unless marked explicitly.
#[derive(Default)]
pub struct StandaloneTaskManager {
    app_locks: DashMap<String, Arc<RwLock<()>>>,
    expired_apps: DashMap<String, ()>,
    huge_partitions: DashMap<(String, i32, i32), ()>,
}

impl StandaloneTaskManager {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn mark_app_expired(&self, app_id: &str) {
        self.expired_apps.insert(app_id.to_string(), ());
    }

    pub fn mark_huge_partition(&self, app_id: &str, shuffle_id: i32, partition_id: i32) {
        self.huge_partitions
            .insert((app_id.to_string(), shuffle_id, partition_id), ());
    }
}

impl TaskManager for StandaloneTaskManager {
    fn app_lock(&self, app_id: &str) -> Arc<RwLock<()>> {
        self.app_locks
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn is_app_expired(&self, app_id: &str) -> bool {
        self.expired_apps.contains_key(app_id)
    }

    fn is_huge_partition(&self, app_id: &str, shuffle_id: i32, partition_id: i32) -> bool {
        self.huge_partitions
            .contains_key(&(app_id.to_string(), shuffle_id, partition_id))
    }
}

/// Channel backed flush queue. The receiver side belongs to the external
/// flusher which completes every event it drains.
pub struct ChannelFlushQueue {
    sender: async_channel::Sender<FlushEvent>,
    distribution: DataDistribution,
}

impl ChannelFlushQueue {
    pub fn new(
        distribution: DataDistribution,
    ) -> (Arc<ChannelFlushQueue>, async_channel::Receiver<FlushEvent>) {
        let (sender, receiver) = async_channel::unbounded();
        (
            Arc::new(ChannelFlushQueue {
                sender,
                distribution,
            }),
            receiver,
        )
    }
}

impl FlushQueue for ChannelFlushQueue {
    fn add_to_flush_queue(&self, event: FlushEvent) {
        if let Err(e) = self.sender.try_send(event) {
            // the dropped event completes itself and the memory is returned
            error!("Errors on enqueuing the flush event. {:?}", e);
        }
    }

    fn data_distribution(&self, _app_id: &str) -> DataDistribution {
        self.distribution
    }
}
