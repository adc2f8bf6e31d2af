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

use thiserror::Error;

use crate::constant::StatusCode;

#[derive(Error, Debug)]
#[allow(non_camel_case_types)]
pub enum PoolError {
    #[error("There is no enough memory to be allocated.")]
    NO_ENOUGH_MEMORY_TO_BE_ALLOCATED,

    #[error("The partition buffer has been evicted.")]
    BUFFER_HAS_BEEN_EVICTED,

    #[error("The shuffle has not been registered. {0}")]
    PARTITION_NOT_REGISTERED(String),

    #[error("No registered partition range covers the data. {0}")]
    NO_COVERED_PARTITION_RANGE(String),

    #[error("Memory usage is limited by the huge partition. {0}")]
    MEMORY_USAGE_LIMITED_BY_HUGE_PARTITION(String),

    #[error("The block:[{0}] crc is inconsistent with its data.")]
    ILLEGAL_BLOCK_CRC(i64),

    #[error("The partition range is overlapped with the registered one. {0}")]
    OVERLAPPED_PARTITION_RANGE(String),

    #[error("Errors on the configuration. {0}")]
    INVALID_CONFIG(String),
}

impl From<&PoolError> for StatusCode {
    fn from(error: &PoolError) -> Self {
        match error {
            PoolError::NO_ENOUGH_MEMORY_TO_BE_ALLOCATED => StatusCode::NO_BUFFER,
            PoolError::BUFFER_HAS_BEEN_EVICTED => StatusCode::NO_REGISTER,
            PoolError::PARTITION_NOT_REGISTERED(_) => StatusCode::NO_REGISTER,
            PoolError::NO_COVERED_PARTITION_RANGE(_) => StatusCode::NO_PARTITION,
            PoolError::MEMORY_USAGE_LIMITED_BY_HUGE_PARTITION(_) => {
                StatusCode::NO_BUFFER_FOR_HUGE_PARTITION
            }
            PoolError::ILLEGAL_BLOCK_CRC(_) => StatusCode::INTERNAL_ERROR,
            PoolError::OVERLAPPED_PARTITION_RANGE(_) => StatusCode::INTERNAL_ERROR,
            PoolError::INVALID_CONFIG(_) => StatusCode::INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            StatusCode::NO_BUFFER,
            StatusCode::from(&PoolError::NO_ENOUGH_MEMORY_TO_BE_ALLOCATED)
        );
        assert_eq!(
            StatusCode::NO_REGISTER,
            StatusCode::from(&PoolError::PARTITION_NOT_REGISTERED("app".to_string()))
        );
        assert_eq!(
            StatusCode::NO_PARTITION,
            StatusCode::from(&PoolError::NO_COVERED_PARTITION_RANGE("pid: 7".to_string()))
        );
        assert_eq!(
            StatusCode::NO_BUFFER_FOR_HUGE_PARTITION,
            StatusCode::from(&PoolError::MEMORY_USAGE_LIMITED_BY_HUGE_PARTITION(
                "pid: 1".to_string()
            ))
        );
        assert_eq!(
            StatusCode::INTERNAL_ERROR,
            StatusCode::from(&PoolError::ILLEGAL_BLOCK_CRC(1))
        );
    }
}
