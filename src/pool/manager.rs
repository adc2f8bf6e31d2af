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

use std::hash::BuildHasherDefault;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::BytesMut;
use croaring::Treemap;
use dashmap::DashMap;
use fxhash::{FxBuildHasher, FxHasher};
use parking_lot::{Mutex, RwLock};

use crate::config::{BufferPoolConfig, BufferType};
use crate::constant::StatusCode;
use crate::error::PoolError;
use crate::metric::{
    APP_BLOCK_SIZE_HISTOGRAM, GAUGE_FLUSH_EVENT_NUMBER, GAUGE_HUGE_PARTITION_NUMBER,
    MEMORY_BUFFER_FLUSH_BATCH_SIZE_HISTOGRAM, TOTAL_HUGE_PARTITION_REQUIRE_BUFFER_FAILED,
    TOTAL_MEMORY_BUFFER_FLUSH_BYTE_SIZE, TOTAL_MEMORY_USED, TOTAL_READ_DATA, TOTAL_RECEIVED_DATA,
    TOTAL_REQUIRE_BUFFER_FAILED,
};
use crate::pool::budget::MemoryBudget;
use crate::pool::buffer::{Flight, PartitionBuffer};
use crate::pool::capacity::CapacitySnapshot;
use crate::pool::lab::ChunkAllocator;
use crate::pool::range_map::{RangeEntry, RangeIndex};
use crate::pool::{
    DataSegment, FlushEvent, FlushQueue, PartitionedData, PartitionedMemoryData, TaskManager,
};
use crate::readable_size::ReadableSize;
use crate::runtime::manager::RuntimeManager;
use crate::util;

#[derive(Default)]
struct AppBufferEntry {
    shuffles: DashMap<i32, Arc<ShuffleEntry>>,
}

#[derive(Default)]
struct ShuffleEntry {
    ranges: RwLock<RangeIndex>,
    // aggregate staging size, mirrored here so the watermark picker never
    // walks the buffers
    size: AtomicI64,
}

struct PoolOptions {
    capacity: i64,
    read_capacity: i64,
    buffer_type: BufferType,
    single_buffer_flush_enabled: bool,
    single_buffer_flush_threshold: i64,
    single_buffer_flush_blocks_num_threshold: i64,
    shuffle_flush_threshold: i64,
    flush_try_lock_timeout: Duration,
    flush_when_caching_data: bool,
    lab_chunk_size: usize,
    huge_partition_size_threshold: Option<i64>,
    huge_partition_size_hard_limit: Option<i64>,
    huge_partition_split_limit: Option<i64>,
    huge_partition_memory_limit: Option<i64>,
    app_block_size_metric_enabled: bool,
    block_crc_check_enabled: bool,
}

fn parse_size(value: &str, label: &str) -> Result<i64> {
    ReadableSize::from_str(value)
        .map(|size| size.as_bytes() as i64)
        .map_err(|e| PoolError::INVALID_CONFIG(format!("{}: {}", label, e)).into())
}

fn resolve_capacity(size: &Option<String>, ratio: &Option<f64>, label: &str) -> Result<Option<i64>> {
    if let Some(value) = size {
        return Ok(Some(parse_size(value, label)?));
    }
    if let Some(ratio) = ratio {
        return Ok(Some((util::total_memory_bytes() as f64 * ratio) as i64));
    }
    Ok(None)
}

impl PoolOptions {
    fn from(conf: &BufferPoolConfig) -> Result<PoolOptions> {
        let capacity = resolve_capacity(&conf.capacity, &conf.capacity_ratio, "capacity")?.ok_or(
            PoolError::INVALID_CONFIG("Either capacity or capacity_ratio must be set.".to_string()),
        )?;
        let read_capacity =
            resolve_capacity(&conf.read_capacity, &conf.read_capacity_ratio, "read_capacity")?
                .unwrap_or(capacity);

        let huge_partition_size_threshold = conf
            .huge_partition_size_threshold
            .as_ref()
            .map(|v| parse_size(v, "huge_partition_size_threshold"))
            .transpose()?;
        let huge_partition_size_hard_limit = conf
            .huge_partition_size_hard_limit
            .as_ref()
            .map(|v| parse_size(v, "huge_partition_size_hard_limit"))
            .transpose()?;
        let huge_partition_split_limit = conf
            .huge_partition_split_limit
            .as_ref()
            .map(|v| parse_size(v, "huge_partition_split_limit"))
            .transpose()?;
        let huge_partition_memory_limit = conf
            .huge_partition_memory_limit_ratio
            .map(|ratio| (capacity as f64 * ratio) as i64);

        Ok(PoolOptions {
            capacity,
            read_capacity,
            buffer_type: conf.buffer_type,
            single_buffer_flush_enabled: conf.single_buffer_flush_enabled,
            single_buffer_flush_threshold: parse_size(
                &conf.single_buffer_flush_threshold,
                "single_buffer_flush_threshold",
            )?,
            single_buffer_flush_blocks_num_threshold: conf.single_buffer_flush_blocks_num_threshold,
            shuffle_flush_threshold: parse_size(
                &conf.shuffle_flush_threshold,
                "shuffle_flush_threshold",
            )?,
            flush_try_lock_timeout: Duration::from_millis(conf.flush_try_lock_timeout_ms),
            flush_when_caching_data: conf.flush_when_caching_data,
            lab_chunk_size: parse_size(&conf.lab_chunk_size, "lab_chunk_size")? as usize,
            huge_partition_size_threshold,
            huge_partition_size_hard_limit,
            huge_partition_split_limit,
            huge_partition_memory_limit,
            app_block_size_metric_enabled: conf.app_block_size_metric_enabled,
            block_crc_check_enabled: conf.block_crc_check_enabled,
        })
    }
}

/// The buffer pool facade: registration, appends, reads, memory admission
/// and the flush scheduling over every partition buffer this server owns.
pub struct BufferPool {
    // key: app_id
    pool: DashMap<String, Arc<AppBufferEntry>, BuildHasherDefault<FxHasher>>,
    budget: MemoryBudget,
    options: PoolOptions,
    allocator: Option<Arc<ChunkAllocator>>,
    task_manager: Arc<dyn TaskManager>,
    flush_queue: Arc<dyn FlushQueue>,
    // one watermark picker at a time, losers just move on
    picker_lock: Mutex<()>,
    flush_trigger: async_channel::Sender<()>,
    trigger_receiver: async_channel::Receiver<()>,
    marked_huge_partitions: DashMap<(String, i32, i32), ()>,
    runtime_manager: RuntimeManager,
    closed: AtomicBool,
}

impl BufferPool {
    pub fn from(
        conf: BufferPoolConfig,
        runtime_manager: RuntimeManager,
        task_manager: Arc<dyn TaskManager>,
        flush_queue: Arc<dyn FlushQueue>,
    ) -> Result<BufferPool> {
        let options = PoolOptions::from(&conf)?;
        let budget = MemoryBudget::new(
            options.capacity,
            options.read_capacity,
            conf.high_watermark,
            conf.low_watermark,
        )?;

        let allocator = if conf.lab_enabled {
            Some(Arc::new(ChunkAllocator::new(
                options.lab_chunk_size,
                (options.capacity as f64 * conf.lab_pool_ratio) as usize,
                (options.lab_chunk_size as f64 * conf.lab_max_alloc_ratio) as usize,
            )))
        } else {
            None
        };

        // the dashmap shard amount effects the lookup performance and has
        // to be a power of two
        let shard_amount = conf.dashmap_shard_amount.unwrap_or(64).next_power_of_two();
        let pool = DashMap::with_hasher_and_shard_amount(FxBuildHasher::default(), shard_amount);

        let (flush_trigger, trigger_receiver) = async_channel::bounded(1);

        Ok(BufferPool {
            pool,
            budget,
            options,
            allocator,
            task_manager,
            flush_queue,
            picker_lock: Mutex::new(()),
            flush_trigger,
            trigger_receiver,
            marked_huge_partitions: DashMap::new(),
            runtime_manager,
            closed: AtomicBool::new(false),
        })
    }

    /// Spawns the trigger handler draining the deferred watermark checks, so
    /// the append threads never run the picker themselves.
    pub fn start(self: Arc<Self>) {
        let pool = self.clone();
        let receiver = self.trigger_receiver.clone();
        self.runtime_manager.dispatch_runtime.spawn(async move {
            info!("Starting the watermark flush trigger handler...");
            while receiver.recv().await.is_ok() {
                if pool.closed.load(SeqCst) {
                    break;
                }
                pool.flush_if_necessary();
            }
        });
    }

    pub fn register_buffer(
        &self,
        app_id: &str,
        shuffle_id: i32,
        start_partition: i32,
        end_partition: i32,
    ) -> StatusCode {
        let app_entry = self
            .pool
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(AppBufferEntry::default()))
            .clone();
        let shuffle_entry = app_entry
            .shuffles
            .entry(shuffle_id)
            .or_insert_with(|| Arc::new(ShuffleEntry::default()))
            .clone();

        let mut ranges = shuffle_entry.ranges.write();
        if ranges.get_exact(start_partition, end_partition).is_some() {
            warn!(
                "The partition range has been registered, keeping the existing buffer. app: {}, shuffle: {}, range: [{}, {}]",
                app_id, shuffle_id, start_partition, end_partition
            );
            return StatusCode::DOUBLE_REGISTER;
        }

        let buffer = Arc::new(PartitionBuffer::new(
            self.options.buffer_type,
            self.allocator.clone(),
        ));
        match ranges.put(start_partition, end_partition, buffer) {
            Ok(_) => StatusCode::SUCCESS,
            Err(e) => {
                error!(
                    "Errors on registering the buffer. app: {}, shuffle: {}. {}",
                    app_id, shuffle_id, e
                );
                StatusCode::from(&e)
            }
        }
    }

    pub fn cache_shuffle_data(
        &self,
        app_id: &str,
        shuffle_id: i32,
        pre_allocated: bool,
        data: PartitionedData,
    ) -> StatusCode {
        let app_lock = self.task_manager.app_lock(app_id);
        let _guard = app_lock.read();

        match self.try_cache_shuffle_data(app_id, shuffle_id, pre_allocated, data) {
            Ok(_) => StatusCode::SUCCESS,
            Err(e) => {
                warn!(
                    "Errors on caching data of app:[{}] shuffle:[{}]. {}",
                    app_id, shuffle_id, e
                );
                StatusCode::from(&e)
            }
        }
    }

    fn try_cache_shuffle_data(
        &self,
        app_id: &str,
        shuffle_id: i32,
        pre_allocated: bool,
        data: PartitionedData,
    ) -> Result<i64, PoolError> {
        if !pre_allocated && self.budget.is_full() {
            TOTAL_REQUIRE_BUFFER_FAILED.inc();
            return Err(PoolError::NO_ENOUGH_MEMORY_TO_BE_ALLOCATED);
        }

        let entry = self.get_shuffle_entry(app_id, shuffle_id).ok_or_else(|| {
            PoolError::PARTITION_NOT_REGISTERED(format!(
                "app: {}, shuffle: {}",
                app_id, shuffle_id
            ))
        })?;
        let range = entry
            .ranges
            .read()
            .get(data.partition_id)
            .cloned()
            .ok_or_else(|| {
                PoolError::NO_COVERED_PARTITION_RANGE(format!(
                    "app: {}, shuffle: {}, partition: {}",
                    app_id, shuffle_id, data.partition_id
                ))
            })?;

        let is_huge = self.is_huge_partition(app_id, shuffle_id, data.partition_id, &range.buffer);
        if is_huge {
            self.check_huge_partition_limits(app_id, shuffle_id, data.partition_id, &range.buffer)?;
        }

        if self.options.block_crc_check_enabled {
            for block in &data.blocks {
                if crc32fast::hash(&block.data) as i64 != block.crc {
                    return Err(PoolError::ILLEGAL_BLOCK_CRC(block.block_id));
                }
            }
        }

        if self.options.app_block_size_metric_enabled {
            for block in &data.blocks {
                APP_BLOCK_SIZE_HISTOGRAM
                    .with_label_values(&[app_id])
                    .observe(block.length as f64);
            }
        }

        let size = range.buffer.append(data.blocks)?;

        if pre_allocated {
            // the reservation becomes committed bytes, `used` was already
            // bumped by the corresponding require_memory
            self.budget.release_pre_allocated(size);
        } else {
            self.budget.update_used_memory(size);
        }
        TOTAL_RECEIVED_DATA.inc_by(size as u64);
        TOTAL_MEMORY_USED.inc_by(size as u64);
        entry.size.fetch_add(size, SeqCst);

        self.flush_single_buffer_if_necessary(app_id, shuffle_id, &entry, &range, is_huge);

        if self.options.flush_when_caching_data && self.budget.need_to_flush() {
            let _ = self.flush_trigger.try_send(());
        }

        Ok(size)
    }

    fn check_huge_partition_limits(
        &self,
        app_id: &str,
        shuffle_id: i32,
        partition_id: i32,
        buffer: &PartitionBuffer,
    ) -> Result<(), PoolError> {
        let held = buffer.total_size();
        if let Some(hard_limit) = self.options.huge_partition_size_hard_limit {
            if held > hard_limit {
                TOTAL_HUGE_PARTITION_REQUIRE_BUFFER_FAILED.inc();
                return Err(PoolError::MEMORY_USAGE_LIMITED_BY_HUGE_PARTITION(format!(
                    "the hard limit: {}(bytes) is exceeded by the held: {}(bytes). app: {}, shuffle: {}, partition: {}",
                    hard_limit, held, app_id, shuffle_id, partition_id
                )));
            }
        }
        if let Some(limit) = self.options.huge_partition_memory_limit {
            if held > limit {
                TOTAL_HUGE_PARTITION_REQUIRE_BUFFER_FAILED.inc();
                return Err(PoolError::MEMORY_USAGE_LIMITED_BY_HUGE_PARTITION(format!(
                    "the writing speed is limited by the held: {}(bytes) over the limit: {}(bytes). app: {}, shuffle: {}, partition: {}",
                    held, limit, app_id, shuffle_id, partition_id
                )));
            }
        }
        Ok(())
    }

    pub fn get_shuffle_data(
        &self,
        app_id: &str,
        shuffle_id: i32,
        partition_id: i32,
        last_block_id: i64,
        read_size: i64,
        task_ids_filter: Option<&Treemap>,
    ) -> PartitionedMemoryData {
        let Some(entry) = self.get_shuffle_entry(app_id, shuffle_id) else {
            return Default::default();
        };
        let range = entry.ranges.read().get(partition_id).cloned();
        let Some(range) = range else {
            return Default::default();
        };

        let result = range.buffer.read(last_block_id, read_size, task_ids_filter);
        TOTAL_READ_DATA.inc_by(result.read_len as u64);

        let mut bytes_holder = BytesMut::with_capacity(result.read_len as usize);
        let mut segments = vec![];
        let mut offset = 0i64;
        for block in result.blocks {
            bytes_holder.extend_from_slice(&block.data);
            segments.push(DataSegment {
                block_id: block.block_id,
                offset,
                length: block.length,
                uncompress_length: block.uncompress_length,
                crc: block.crc,
                task_attempt_id: block.task_attempt_id,
            });
            offset += block.length as i64;
        }

        PartitionedMemoryData {
            shuffle_data_block_segments: segments,
            data: bytes_holder.freeze(),
        }
    }

    pub fn require_memory(&self, size: i64, pre_allocated: bool) -> bool {
        self.budget.require_write_memory(size, pre_allocated)
    }

    /// Returns a timed-out reservation: both the used and the pre-allocated
    /// counters give the bytes back.
    pub fn release_pre_allocated_size(&self, size: i64) {
        self.budget.release_memory(size, false, true);
    }

    pub fn require_read_memory(&self, size: i64) -> bool {
        self.budget.require_read_memory(size)
    }

    pub fn release_read_memory(&self, size: i64) {
        self.budget.release_read_memory(size)
    }

    /// Force-flushes every partition buffer of the shuffle. Returns the
    /// dispatched bytes.
    pub fn commit_shuffle(&self, app_id: &str, shuffle_id: i32) -> i64 {
        self.flush_shuffle(app_id, shuffle_id, true)
    }

    pub fn remove_buffer(&self, app_id: &str) -> i64 {
        let app_lock = self.task_manager.app_lock(app_id);
        let _guard = app_lock.write();

        let Some((_, app_entry)) = self.pool.remove(app_id) else {
            return 0;
        };
        let mut freed = 0i64;
        for shuffle in app_entry.shuffles.iter() {
            freed += self.release_shuffle(shuffle.value());
        }
        self.marked_huge_partitions.retain(|key, _| key.0 != app_id);
        let _ = GAUGE_HUGE_PARTITION_NUMBER.remove_label_values(&[app_id]);
        info!(
            "Removed the buffers of app:[{}]. freed: {}(bytes)",
            app_id, freed
        );
        freed
    }

    pub fn remove_buffer_by_shuffle_ids(&self, app_id: &str, shuffle_ids: &[i32]) -> i64 {
        let app_lock = self.task_manager.app_lock(app_id);
        let _guard = app_lock.write();

        let Some(app_entry) = self.pool.get(app_id).map(|entry| entry.value().clone()) else {
            return 0;
        };
        let mut freed = 0i64;
        for shuffle_id in shuffle_ids {
            if let Some((_, entry)) = app_entry.shuffles.remove(shuffle_id) {
                freed += self.release_shuffle(&entry);
            }
            self.marked_huge_partitions
                .retain(|key, _| !(key.0 == app_id && key.1 == *shuffle_id));
        }
        info!(
            "Removed the buffers of app:[{}] shuffles:{:?}. freed: {}(bytes)",
            app_id, shuffle_ids, freed
        );
        freed
    }

    /// The watermark path. No-op below the high watermark; a single picker
    /// selects the largest shuffles until the flushable bytes drop towards
    /// the low watermark.
    pub fn flush_if_necessary(&self) -> bool {
        if !self.budget.need_to_flush() {
            return false;
        }
        let Some(_picker) = self.picker_lock.try_lock() else {
            return false;
        };

        let (_, low_watermark) = self.budget.watermarks();
        let expected = self.budget.live() - low_watermark;
        if expected <= 0 {
            return false;
        }

        let mut size_list = vec![];
        for app in self.pool.iter() {
            for shuffle in app.value().shuffles.iter() {
                size_list.push((
                    app.key().clone(),
                    *shuffle.key(),
                    shuffle.value().size.load(SeqCst),
                ));
            }
        }
        size_list.sort_by(|a, b| b.2.cmp(&a.2));

        let mut picked = vec![];
        let mut picked_size = 0i64;
        for (app_id, shuffle_id, size) in size_list {
            if size <= 0 {
                break;
            }
            if size > self.options.shuffle_flush_threshold || picked_size <= expected / 2 {
                picked_size += size;
                picked.push((app_id, shuffle_id));
                if picked_size > expected {
                    break;
                }
            } else {
                break;
            }
        }
        if picked.is_empty() {
            return false;
        }

        info!(
            "[flush] the watermark flush picked {} shuffles with {}(bytes). expected: {}(bytes)",
            picked.len(),
            picked_size,
            expected
        );
        for (app_id, shuffle_id) in picked {
            self.flush_shuffle(&app_id, shuffle_id, false);
        }
        true
    }

    pub fn update_watermarks(&self, high_watermark: f64, low_watermark: f64) -> Result<()> {
        self.budget.update_watermarks(high_watermark, low_watermark)
    }

    /// Whether the partition has grown past the split limit and the client
    /// should be told to spread further writes.
    pub fn needs_partition_split(&self, app_id: &str, shuffle_id: i32, partition_id: i32) -> bool {
        let Some(limit) = self.options.huge_partition_split_limit else {
            return false;
        };
        self.get_buffer(app_id, shuffle_id, partition_id)
            .map(|buffer| buffer.total_size() > limit)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> CapacitySnapshot {
        self.budget.snapshot()
    }

    pub fn capacity(&self) -> i64 {
        self.budget.capacity()
    }

    /// Shutdown: no more admissions, every staged byte is dispatched and the
    /// in-flush data gets a bounded drain window.
    pub fn close(&self, timeout: Duration) {
        if self.closed.swap(true, SeqCst) {
            return;
        }
        self.budget.close();
        self.flush_trigger.close();

        let mut targets = vec![];
        for app in self.pool.iter() {
            for shuffle in app.value().shuffles.iter() {
                targets.push((app.key().clone(), *shuffle.key()));
            }
        }
        for (app_id, shuffle_id) in targets {
            self.commit_shuffle(&app_id, shuffle_id);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let in_flush = self.budget.snapshot().in_flush();
            if in_flush == 0 {
                break;
            }
            if Instant::now() > deadline {
                warn!(
                    "Timeout on waiting the in-flush data to drain when closing. leftover: {}(bytes)",
                    in_flush
                );
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let snapshot = self.budget.snapshot();
        info!(
            "The buffer pool has been closed. used: {}, allocated: {}, in_flush: {}",
            snapshot.used(),
            snapshot.allocated(),
            snapshot.in_flush()
        );
    }

    fn get_shuffle_entry(&self, app_id: &str, shuffle_id: i32) -> Option<Arc<ShuffleEntry>> {
        let app = self.pool.get(app_id)?;
        let entry = app.shuffles.get(&shuffle_id)?;
        Some(entry.value().clone())
    }

    fn get_buffer(
        &self,
        app_id: &str,
        shuffle_id: i32,
        partition_id: i32,
    ) -> Option<Arc<PartitionBuffer>> {
        let entry = self.get_shuffle_entry(app_id, shuffle_id)?;
        let range = entry.ranges.read().get(partition_id).cloned();
        range.map(|range| range.buffer)
    }

    fn is_huge_partition(
        &self,
        app_id: &str,
        shuffle_id: i32,
        partition_id: i32,
        buffer: &PartitionBuffer,
    ) -> bool {
        if self
            .task_manager
            .is_huge_partition(app_id, shuffle_id, partition_id)
        {
            return true;
        }
        let Some(threshold) = self.options.huge_partition_size_threshold else {
            return false;
        };
        if buffer.total_size() <= threshold {
            return false;
        }
        let key = (app_id.to_string(), shuffle_id, partition_id);
        if self.marked_huge_partitions.insert(key, ()).is_none() {
            warn!(
                "The partition is marked as huge. app: {}, shuffle: {}, partition: {}",
                app_id, shuffle_id, partition_id
            );
            GAUGE_HUGE_PARTITION_NUMBER
                .with_label_values(&[app_id])
                .inc();
        }
        true
    }

    fn flush_single_buffer_if_necessary(
        &self,
        app_id: &str,
        shuffle_id: i32,
        entry: &Arc<ShuffleEntry>,
        range: &RangeEntry,
        is_huge: bool,
    ) {
        if !self.options.single_buffer_flush_enabled && !is_huge {
            return;
        }
        // cheap pre-check, the decisive one runs under the buffer mutex
        if range.buffer.staging_size() <= self.options.single_buffer_flush_threshold
            && range.buffer.staging_block_num()
                <= self.options.single_buffer_flush_blocks_num_threshold
        {
            return;
        }

        let distribution = self.flush_queue.data_distribution(app_id);
        let flight = range.buffer.create_flight_if_exceeds(
            self.options.single_buffer_flush_threshold,
            self.options.single_buffer_flush_blocks_num_threshold,
            || !self.task_manager.is_app_expired(app_id),
            distribution,
        );
        if let Some(flight) = flight {
            debug!(
                "[flush] single buffer flush for app:[{}] shuffle:[{}] partitions:[{}-{}] with {}(bytes)",
                app_id, shuffle_id, range.start_partition, range.end_partition, flight.size
            );
            self.dispatch_flight(app_id, shuffle_id, range, flight, is_huge, entry);
        }
    }

    fn flush_shuffle(&self, app_id: &str, shuffle_id: i32, force: bool) -> i64 {
        let app_lock = self.task_manager.app_lock(app_id);
        let guard = if force {
            Some(app_lock.read())
        } else {
            app_lock.try_read_for(self.options.flush_try_lock_timeout)
        };
        let Some(_guard) = guard else {
            warn!(
                "[flush] timeout on acquiring the app lock of app:[{}]. The shuffle:[{}] is skipped.",
                app_id, shuffle_id
            );
            return 0;
        };
        if !force && self.task_manager.is_app_expired(app_id) {
            return 0;
        }

        let Some(entry) = self.get_shuffle_entry(app_id, shuffle_id) else {
            return 0;
        };
        let distribution = self.flush_queue.data_distribution(app_id);
        let ranges: Vec<RangeEntry> = entry.ranges.read().entries().to_vec();

        let mut flushed = 0i64;
        for range in ranges {
            let flight = if force {
                range.buffer.create_flight(|| true, distribution)
            } else {
                range.buffer.create_flight(
                    || !self.task_manager.is_app_expired(app_id),
                    distribution,
                )
            };
            if let Some(flight) = flight {
                flushed += flight.size;
                let is_huge = self.task_manager.is_huge_partition(
                    app_id,
                    shuffle_id,
                    range.start_partition,
                );
                self.dispatch_flight(app_id, shuffle_id, &range, flight, is_huge, &entry);
            }
        }
        flushed
    }

    fn dispatch_flight(
        &self,
        app_id: &str,
        shuffle_id: i32,
        range: &RangeEntry,
        flight: Flight,
        is_huge: bool,
        entry: &Arc<ShuffleEntry>,
    ) {
        let size = flight.size;
        self.budget.move_to_in_flush(size);
        entry.size.fetch_sub(size, SeqCst);

        MEMORY_BUFFER_FLUSH_BATCH_SIZE_HISTOGRAM.observe(size as f64);
        TOTAL_MEMORY_BUFFER_FLUSH_BYTE_SIZE.inc_by(size as u64);
        GAUGE_FLUSH_EVENT_NUMBER.inc();

        let event = FlushEvent::new(
            app_id,
            shuffle_id,
            range.start_partition,
            range.end_partition,
            flight,
            is_huge,
            Arc::downgrade(&range.buffer),
            self.budget.clone(),
        );
        self.flush_queue.add_to_flush_queue(event);
    }

    fn release_shuffle(&self, entry: &ShuffleEntry) -> i64 {
        let ranges = entry.ranges.read();
        let mut freed = 0i64;
        for range in ranges.entries() {
            let (staging, in_flight) = range.buffer.release();
            if staging > 0 {
                self.budget.release_memory(staging, false, false);
            }
            if in_flight > 0 {
                self.budget.release_memory(in_flight, true, false);
            }
            freed += staging + in_flight;
        }
        entry.size.store(0, SeqCst);
        freed
    }
}
