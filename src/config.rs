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

use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum BufferType {
    LINKED_LIST,
    SKIP_LIST,
}

impl Default for BufferType {
    fn default() -> Self {
        BufferType::LINKED_LIST
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Absolute write budget like "10G". Takes precedence over the ratio.
    pub capacity: Option<String>,
    /// Fraction of the host memory used as the write budget.
    pub capacity_ratio: Option<f64>,

    pub read_capacity: Option<String>,
    pub read_capacity_ratio: Option<f64>,

    pub high_watermark: f64,
    pub low_watermark: f64,

    pub single_buffer_flush_enabled: bool,
    pub single_buffer_flush_threshold: String,
    pub single_buffer_flush_blocks_num_threshold: i64,

    /// Shuffles smaller than this are skipped by the watermark picker
    /// unless more data is needed to reach the flush target.
    pub shuffle_flush_threshold: String,
    pub flush_try_lock_timeout_ms: u64,
    /// Evaluate the watermark flush on every append, dispatched onto a
    /// dedicated task rather than the appending thread.
    pub flush_when_caching_data: bool,

    pub buffer_type: BufferType,

    pub lab_enabled: bool,
    pub lab_chunk_size: String,
    pub lab_pool_ratio: f64,
    pub lab_max_alloc_ratio: f64,

    pub huge_partition_size_threshold: Option<String>,
    pub huge_partition_size_hard_limit: Option<String>,
    pub huge_partition_split_limit: Option<String>,
    pub huge_partition_memory_limit_ratio: Option<f64>,

    pub app_block_size_metric_enabled: bool,
    pub block_crc_check_enabled: bool,

    /// the dashmap shard that will effect the lookup performance.
    pub dashmap_shard_amount: Option<usize>,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            capacity: None,
            capacity_ratio: None,
            read_capacity: None,
            read_capacity_ratio: None,
            high_watermark: 0.8,
            low_watermark: 0.2,
            single_buffer_flush_enabled: false,
            single_buffer_flush_threshold: "128M".to_string(),
            single_buffer_flush_blocks_num_threshold: 1000000,
            shuffle_flush_threshold: "0".to_string(),
            flush_try_lock_timeout_ms: 100,
            flush_when_caching_data: false,
            buffer_type: BufferType::LINKED_LIST,
            lab_enabled: false,
            lab_chunk_size: "4M".to_string(),
            lab_pool_ratio: 0.5,
            lab_max_alloc_ratio: 0.1,
            huge_partition_size_threshold: None,
            huge_partition_size_hard_limit: None,
            huge_partition_split_limit: None,
            huge_partition_memory_limit_ratio: None,
            app_block_size_metric_enabled: false,
            block_crc_check_enabled: false,
            dashmap_shard_amount: None,
        }
    }
}

impl BufferPoolConfig {
    pub fn new(capacity: String) -> Self {
        BufferPoolConfig {
            capacity: Some(capacity),
            ..Default::default()
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: BufferPoolConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default() {
        let config = BufferPoolConfig::default();
        assert_eq!(0.8, config.high_watermark);
        assert_eq!(0.2, config.low_watermark);
        assert_eq!(BufferType::LINKED_LIST, config.buffer_type);
        assert!(!config.single_buffer_flush_enabled);
    }

    #[test]
    fn test_from_toml() {
        let toml_str = r#"
        capacity = "1024M"
        high_watermark = 0.9
        low_watermark = 0.5
        buffer_type = "SKIP_LIST"
        single_buffer_flush_enabled = true
        single_buffer_flush_threshold = "64M"
        huge_partition_size_threshold = "20G"
        "#;

        let config = BufferPoolConfig::from_toml(toml_str).unwrap();
        assert_eq!(Some("1024M".to_string()), config.capacity);
        assert_eq!(0.9, config.high_watermark);
        assert_eq!(0.5, config.low_watermark);
        assert_eq!(BufferType::SKIP_LIST, config.buffer_type);
        assert!(config.single_buffer_flush_enabled);
        assert_eq!("64M", config.single_buffer_flush_threshold);
        assert_eq!(Some("20G".to_string()), config.huge_partition_size_threshold);
        // untouched options keep the defaults
        assert_eq!("0", config.shuffle_flush_threshold);
        assert_eq!(100, config.flush_try_lock_timeout_ms);
    }
}
