use std::time::{SystemTime, UNIX_EPOCH};

use sysinfo::System;

pub fn now_timestamp_as_sec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs()
}

pub fn now_timestamp_as_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis()
}

/// Total physical memory of the host. Used when a capacity is configured
/// as a ratio rather than an absolute size.
pub fn total_memory_bytes() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_timestamp() {
        let sec = now_timestamp_as_sec();
        let millis = now_timestamp_as_millis();
        assert!(millis as u64 / 1000 >= sec);
    }

    #[test]
    fn test_total_memory() {
        assert!(total_memory_bytes() > 0);
    }
}
