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

use std::sync::Arc;

use crate::error::PoolError;
use crate::pool::buffer::PartitionBuffer;

#[derive(Clone)]
pub struct RangeEntry {
    pub start_partition: i32,
    pub end_partition: i32,
    pub buffer: Arc<PartitionBuffer>,
}

/// Closed disjoint partition ranges mapped to their buffers, kept sorted by
/// the range start for binary-search point lookups. Ranges never split or
/// shrink, the external coordinator always assigns disjoint ones.
#[derive(Default)]
pub struct RangeIndex {
    entries: Vec<RangeEntry>,
}

impl RangeIndex {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn put(
        &mut self,
        start_partition: i32,
        end_partition: i32,
        buffer: Arc<PartitionBuffer>,
    ) -> Result<(), PoolError> {
        if start_partition > end_partition {
            return Err(PoolError::OVERLAPPED_PARTITION_RANGE(format!(
                "Illegal range: [{}, {}]",
                start_partition, end_partition
            )));
        }

        let idx = self
            .entries
            .partition_point(|entry| entry.start_partition < start_partition);
        let overlaps_prev = idx > 0 && self.entries[idx - 1].end_partition >= start_partition;
        let overlaps_next =
            idx < self.entries.len() && self.entries[idx].start_partition <= end_partition;
        if overlaps_prev || overlaps_next {
            return Err(PoolError::OVERLAPPED_PARTITION_RANGE(format!(
                "range: [{}, {}]",
                start_partition, end_partition
            )));
        }

        self.entries.insert(
            idx,
            RangeEntry {
                start_partition,
                end_partition,
                buffer,
            },
        );
        Ok(())
    }

    pub fn get(&self, partition_id: i32) -> Option<&RangeEntry> {
        let idx = self
            .entries
            .partition_point(|entry| entry.start_partition <= partition_id);
        if idx == 0 {
            return None;
        }
        let entry = &self.entries[idx - 1];
        if partition_id <= entry.end_partition {
            Some(entry)
        } else {
            None
        }
    }

    pub fn get_exact(&self, start_partition: i32, end_partition: i32) -> Option<&RangeEntry> {
        self.get(start_partition)
            .filter(|entry| {
                entry.start_partition == start_partition && entry.end_partition == end_partition
            })
    }

    pub fn entries(&self) -> &[RangeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::BufferType;

    fn buffer() -> Arc<PartitionBuffer> {
        Arc::new(PartitionBuffer::new(BufferType::LINKED_LIST, None))
    }

    #[test]
    fn test_put_and_point_lookup() {
        let mut index = RangeIndex::new();
        index.put(0, 3, buffer()).unwrap();
        index.put(8, 9, buffer()).unwrap();
        index.put(4, 7, buffer()).unwrap();

        assert_eq!(3, index.len());
        for pid in 0..=9 {
            let entry = index.get(pid).unwrap();
            assert!(entry.start_partition <= pid && pid <= entry.end_partition);
        }
        assert!(index.get(10).is_none());
        assert!(index.get(-1).is_none());

        // the same point always resolves to the same buffer
        let first = index.get(4).unwrap().buffer.clone();
        let second = index.get(7).unwrap().buffer.clone();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_overlap_rejected() {
        let mut index = RangeIndex::new();
        index.put(5, 10, buffer()).unwrap();

        assert!(index.put(10, 12, buffer()).is_err());
        assert!(index.put(0, 5, buffer()).is_err());
        assert!(index.put(6, 8, buffer()).is_err());
        assert!(index.put(5, 10, buffer()).is_err());
        assert!(index.put(9, 3, buffer()).is_err());

        assert!(index.put(11, 20, buffer()).is_ok());
        assert_eq!(2, index.len());
    }

    #[test]
    fn test_get_exact() {
        let mut index = RangeIndex::new();
        index.put(0, 3, buffer()).unwrap();

        assert!(index.get_exact(0, 3).is_some());
        assert!(index.get_exact(0, 2).is_none());
        assert!(index.get_exact(1, 3).is_none());
    }
}
