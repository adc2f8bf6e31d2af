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

use std::future::Future;

use crate::runtime::{create_runtime, RuntimeRef};

/// Holder of the named runtimes. `default` serves general background work
/// and test waits, `dispatch` drains the watermark flush triggers.
#[derive(Clone)]
pub struct RuntimeManager {
    pub default_runtime: RuntimeRef,
    pub dispatch_runtime: RuntimeRef,
}

impl Default for RuntimeManager {
    fn default() -> Self {
        RuntimeManager::from(2, 2)
    }
}

impl RuntimeManager {
    pub fn from(default_thread_num: usize, dispatch_thread_num: usize) -> Self {
        Self {
            default_runtime: create_runtime(default_thread_num, "default"),
            dispatch_runtime: create_runtime(dispatch_thread_num, "dispatch"),
        }
    }

    pub fn wait<F: Future>(&self, future: F) -> F::Output {
        self.default_runtime.block_on(future)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wait() {
        let manager = RuntimeManager::default();
        let value = manager.wait(async { 1 + 1 });
        assert_eq!(2, value);
    }
}
