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

use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, register_histogram, register_histogram_vec, register_int_counter,
    register_int_gauge, register_int_gauge_vec, Histogram, HistogramVec, IntCounter, IntGauge,
    IntGaugeVec,
};

pub static TOTAL_RECEIVED_DATA: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "total_received_data",
        "Total bytes appended into partition buffers"
    )
    .unwrap()
});

pub static TOTAL_READ_DATA: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "total_read_data",
        "Total bytes served from partition buffers"
    )
    .unwrap()
});

pub static TOTAL_MEMORY_USED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "total_memory_used",
        "Accumulated bytes that were committed into the pool"
    )
    .unwrap()
});

pub static TOTAL_REQUIRE_BUFFER_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "total_require_buffer_failed",
        "Number of refused memory requirements"
    )
    .unwrap()
});

pub static TOTAL_HUGE_PARTITION_REQUIRE_BUFFER_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "total_huge_partition_require_buffer_failed",
        "Number of refused appends due to the huge partition limitation"
    )
    .unwrap()
});

pub static GAUGE_MEMORY_USED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("memory_used", "Bytes owned by the pool").unwrap()
});

pub static GAUGE_MEMORY_ALLOCATED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "memory_allocated",
        "Bytes pre-allocated but not yet delivered"
    )
    .unwrap()
});

pub static GAUGE_MEMORY_IN_FLUSH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("memory_in_flush", "Bytes snapshotted into flush events").unwrap()
});

pub static GAUGE_FLUSH_EVENT_NUMBER: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "flush_event_number",
        "Flush events dispatched but not yet completed"
    )
    .unwrap()
});

pub static GAUGE_HUGE_PARTITION_NUMBER: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "huge_partition_number",
        "Partitions marked as huge",
        &["app_id"]
    )
    .unwrap()
});

pub static MEMORY_BUFFER_FLUSH_BATCH_SIZE_HISTOGRAM: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "memory_buffer_flush_batch_size",
        "Byte size distribution of dispatched flush events",
        exponential_buckets(1024f64, 4f64, 12).unwrap()
    )
    .unwrap()
});

pub static TOTAL_MEMORY_BUFFER_FLUSH_BYTE_SIZE: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "total_memory_buffer_flush_byte_size",
        "Accumulated bytes of dispatched flush events"
    )
    .unwrap()
});

pub static APP_BLOCK_SIZE_HISTOGRAM: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "app_block_size",
        "Block size distribution per app",
        &["app_id"],
        exponential_buckets(256f64, 4f64, 10).unwrap()
    )
    .unwrap()
});
