/// Point-in-time view of the accountant counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacitySnapshot {
    capacity: i64,
    read_capacity: i64,
    used: i64,
    allocated: i64,
    in_flush: i64,
    read_used: i64,
}

impl CapacitySnapshot {
    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn read_capacity(&self) -> i64 {
        self.read_capacity
    }

    pub fn used(&self) -> i64 {
        self.used
    }

    pub fn allocated(&self) -> i64 {
        self.allocated
    }

    pub fn in_flush(&self) -> i64 {
        self.in_flush
    }

    pub fn read_used(&self) -> i64 {
        self.read_used
    }
}

impl From<(i64, i64, i64, i64, i64, i64)> for CapacitySnapshot {
    fn from(value: (i64, i64, i64, i64, i64, i64)) -> Self {
        CapacitySnapshot {
            capacity: value.0,
            read_capacity: value.1,
            used: value.2,
            allocated: value.3,
            in_flush: value.4,
            read_used: value.5,
        }
    }
}
