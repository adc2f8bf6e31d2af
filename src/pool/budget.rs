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

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;

use crate::error::PoolError;
use crate::metric::{
    GAUGE_MEMORY_ALLOCATED, GAUGE_MEMORY_IN_FLUSH, GAUGE_MEMORY_USED, TOTAL_REQUIRE_BUFFER_FAILED,
};
use crate::pool::capacity::CapacitySnapshot;

/// The memory accountant. `used` covers every byte the pool owns,
/// `allocated` the reservations not yet delivered, `in_flush` the bytes
/// snapshotted into dispatched flush events. The watermark comparisons run
/// against `live = used - allocated - in_flush`.
#[derive(Clone)]
pub struct MemoryBudget {
    inner: Arc<BudgetInner>,
}

struct BudgetInner {
    capacity: AtomicI64,
    read_capacity: AtomicI64,
    used: AtomicI64,
    allocated: AtomicI64,
    in_flush: AtomicI64,
    read_used: AtomicI64,
    // (high, low) in bytes. One record so readers never observe a torn pair.
    watermarks: RwLock<(i64, i64)>,
}

impl MemoryBudget {
    pub fn new(
        capacity: i64,
        read_capacity: i64,
        high_watermark: f64,
        low_watermark: f64,
    ) -> Result<MemoryBudget> {
        if capacity <= 0 {
            return Err(
                PoolError::INVALID_CONFIG(format!("Illegal capacity: {}", capacity)).into(),
            );
        }
        let watermarks = Self::calculate_watermarks(capacity, high_watermark, low_watermark)?;
        Ok(MemoryBudget {
            inner: Arc::new(BudgetInner {
                capacity: AtomicI64::new(capacity),
                read_capacity: AtomicI64::new(read_capacity),
                used: Default::default(),
                allocated: Default::default(),
                in_flush: Default::default(),
                read_used: Default::default(),
                watermarks: RwLock::new(watermarks),
            }),
        })
    }

    fn calculate_watermarks(
        capacity: i64,
        high_watermark: f64,
        low_watermark: f64,
    ) -> Result<(i64, i64)> {
        if !(0.0..=1.0).contains(&high_watermark)
            || !(0.0..=1.0).contains(&low_watermark)
            || high_watermark <= low_watermark
        {
            return Err(PoolError::INVALID_CONFIG(format!(
                "Illegal watermarks. high: {}, low: {}",
                high_watermark, low_watermark
            ))
            .into());
        }
        Ok((
            (capacity as f64 * high_watermark) as i64,
            (capacity as f64 * low_watermark) as i64,
        ))
    }

    pub fn capacity(&self) -> i64 {
        self.inner.capacity.load(SeqCst)
    }

    /// Admits `size` bytes against the write capacity. The capacity check and
    /// the increment are one atomic step via a CAS retry loop.
    pub fn require_write_memory(&self, size: i64, pre_allocated: bool) -> bool {
        let inner = &self.inner;
        loop {
            let capacity = inner.capacity.load(SeqCst);
            let used = inner.used.load(SeqCst);
            if capacity - used < size {
                TOTAL_REQUIRE_BUFFER_FAILED.inc();
                return false;
            }
            if inner
                .used
                .compare_exchange(used, used + size, SeqCst, SeqCst)
                .is_ok()
            {
                if pre_allocated {
                    inner.allocated.fetch_add(size, SeqCst);
                }
                self.refresh_gauges();
                return true;
            }
        }
    }

    /// Retroactive accounting for the non-pre-allocated append path.
    pub fn update_used_memory(&self, delta: i64) {
        if delta >= 0 {
            self.inner.used.fetch_add(delta, SeqCst);
        } else {
            dec_clamped(&self.inner.used, -delta, "used");
        }
        self.refresh_gauges();
    }

    pub fn release_memory(&self, size: i64, release_in_flush: bool, release_pre_allocation: bool) {
        dec_clamped(&self.inner.used, size, "used");
        if release_in_flush {
            dec_clamped(&self.inner.in_flush, size, "in_flush");
        }
        if release_pre_allocation {
            dec_clamped(&self.inner.allocated, size, "allocated");
        }
        self.refresh_gauges();
    }

    /// Converts a reservation into committed bytes after an append.
    pub fn release_pre_allocated(&self, size: i64) {
        dec_clamped(&self.inner.allocated, size, "allocated");
        self.refresh_gauges();
    }

    pub fn move_to_in_flush(&self, size: i64) {
        self.inner.in_flush.fetch_add(size, SeqCst);
        self.refresh_gauges();
    }

    pub fn require_read_memory(&self, size: i64) -> bool {
        let inner = &self.inner;
        loop {
            let capacity = inner.read_capacity.load(SeqCst);
            let used = inner.read_used.load(SeqCst);
            if capacity - used < size {
                return false;
            }
            if inner
                .read_used
                .compare_exchange(used, used + size, SeqCst, SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release_read_memory(&self, size: i64) {
        dec_clamped(&self.inner.read_used, size, "read_used");
    }

    pub fn live(&self) -> i64 {
        let inner = &self.inner;
        inner.used.load(SeqCst) - inner.allocated.load(SeqCst) - inner.in_flush.load(SeqCst)
    }

    pub fn need_to_flush(&self) -> bool {
        let (high, _) = self.watermarks();
        self.live() > high
    }

    pub fn is_full(&self) -> bool {
        self.inner.used.load(SeqCst) >= self.inner.capacity.load(SeqCst)
    }

    pub fn watermarks(&self) -> (i64, i64) {
        *self.inner.watermarks.read()
    }

    pub fn update_watermarks(&self, high_watermark: f64, low_watermark: f64) -> Result<()> {
        let watermarks = Self::calculate_watermarks(
            self.inner.capacity.load(SeqCst),
            high_watermark,
            low_watermark,
        )?;
        *self.inner.watermarks.write() = watermarks;
        info!(
            "The watermarks have been updated. high: {}(bytes), low: {}(bytes)",
            watermarks.0, watermarks.1
        );
        Ok(())
    }

    /// Clamps the capacity so every in-flight `require` fails from now on.
    pub fn close(&self) {
        self.inner.capacity.store(0, SeqCst);
    }

    pub fn snapshot(&self) -> CapacitySnapshot {
        let inner = &self.inner;
        (
            inner.capacity.load(SeqCst),
            inner.read_capacity.load(SeqCst),
            inner.used.load(SeqCst),
            inner.allocated.load(SeqCst),
            inner.in_flush.load(SeqCst),
            inner.read_used.load(SeqCst),
        )
            .into()
    }

    fn refresh_gauges(&self) {
        let inner = &self.inner;
        GAUGE_MEMORY_USED.set(inner.used.load(SeqCst));
        GAUGE_MEMORY_ALLOCATED.set(inner.allocated.load(SeqCst));
        GAUGE_MEMORY_IN_FLUSH.set(inner.in_flush.load(SeqCst));
    }
}

fn dec_clamped(counter: &AtomicI64, size: i64, label: &str) {
    loop {
        let current = counter.load(SeqCst);
        let mut next = current - size;
        if next < 0 {
            warn!(
                "Errors on decrementing the counter:[{}]. current: {}, dec: {}. Clamped to 0.",
                label, current, size
            );
            next = 0;
        }
        if counter
            .compare_exchange(current, next, SeqCst, SeqCst)
            .is_ok()
        {
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_require_and_release() {
        let budget = MemoryBudget::new(1024, 1024, 0.8, 0.2).unwrap();

        assert!(budget.require_write_memory(200, true));
        let snapshot = budget.snapshot();
        assert_eq!(200, snapshot.used());
        assert_eq!(200, snapshot.allocated());

        // the reservation converts into committed bytes on append
        budget.release_pre_allocated(200);
        assert_eq!(0, budget.snapshot().allocated());
        assert_eq!(200, budget.snapshot().used());

        budget.move_to_in_flush(200);
        assert_eq!(200, budget.snapshot().in_flush());

        budget.release_memory(200, true, false);
        let snapshot = budget.snapshot();
        assert_eq!(0, snapshot.used());
        assert_eq!(0, snapshot.in_flush());
    }

    #[test]
    fn test_admission_refused() {
        let budget = MemoryBudget::new(100, 0, 0.8, 0.2).unwrap();
        assert!(budget.require_write_memory(100, false));
        assert!(!budget.require_write_memory(1, false));
        assert!(budget.is_full());
    }

    #[test]
    fn test_underflow_clamped() {
        let budget = MemoryBudget::new(100, 0, 0.8, 0.2).unwrap();
        budget.release_memory(10, true, true);
        let snapshot = budget.snapshot();
        assert_eq!(0, snapshot.used());
        assert_eq!(0, snapshot.allocated());
        assert_eq!(0, snapshot.in_flush());
    }

    #[test]
    fn test_watermarks() {
        let budget = MemoryBudget::new(1000, 0, 0.8, 0.4).unwrap();
        assert_eq!((800, 400), budget.watermarks());

        budget.update_used_memory(801);
        assert!(budget.need_to_flush());

        // the pre-allocated part is not live
        assert!(budget.require_write_memory(100, true));
        assert_eq!(801, budget.live());

        budget.move_to_in_flush(500);
        assert_eq!(301, budget.live());
        assert!(!budget.need_to_flush());

        assert!(budget.update_watermarks(0.5, 0.6).is_err());
        budget.update_watermarks(0.3, 0.1).unwrap();
        assert_eq!((300, 100), budget.watermarks());
    }

    #[test]
    fn test_invalid_config() {
        assert!(MemoryBudget::new(0, 0, 0.8, 0.2).is_err());
        assert!(MemoryBudget::new(1024, 0, 0.2, 0.8).is_err());
        assert!(MemoryBudget::new(1024, 0, 1.2, 0.2).is_err());
    }

    #[test]
    fn test_read_budget() {
        let budget = MemoryBudget::new(1024, 100, 0.8, 0.2).unwrap();
        assert!(budget.require_read_memory(60));
        assert!(!budget.require_read_memory(60));
        budget.release_read_memory(60);
        assert!(budget.require_read_memory(100));
    }

    #[test]
    fn test_concurrent_require() {
        let budget = MemoryBudget::new(50, 0, 0.8, 0.2).unwrap();
        let succeed = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..10 {
            let budget = budget.clone();
            let succeed = succeed.clone();
            handles.push(std::thread::spawn(move || {
                if budget.require_write_memory(10, false) {
                    succeed.fetch_add(1, SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(5, succeed.load(SeqCst));
        assert_eq!(50, budget.snapshot().used());
    }
}
