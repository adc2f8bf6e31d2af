pub const ALL_LABEL: &str = "all";

/// Sentinel for reads that start from the head of a partition buffer.
pub const INVALID_BLOCK_ID: i64 = -1;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    SUCCESS = 0,
    DOUBLE_REGISTER = 1,
    NO_BUFFER = 2,
    NO_REGISTER = 3,
    NO_PARTITION = 4,
    INTERNAL_ERROR = 5,
    NO_BUFFER_FOR_HUGE_PARTITION = 6,
}

impl Into<i32> for StatusCode {
    fn into(self) -> i32 {
        self as i32
    }
}
