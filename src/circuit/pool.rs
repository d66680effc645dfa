// Tencent is pleased to support the open source community by making Polaris available.
//
// Copyright (C) 2019 THL A29 Limited, a Tencent company. All rights reserved.
//
// Licensed under the BSD 3-Clause License (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://opensource.org/licenses/BSD-3-Clause
//
// Unless required by applicable law or agreed to in writing, software distributed
// under the License is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR
// CONDITIONS OF ANY KIND, either express or implied. See the License for the
// specific language governing permissions and limitations under the License.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const CONCURRENT_REQUESTS_LIMIT: usize = 5000;

/// ExecutorPool bounds concurrent executions of one command. The permits
/// are pre-filled tickets; the take is non-blocking, and a dropped permit
/// returns its ticket even when the holder panicked.
pub struct ExecutorPool {
    pub name: String,
    pub max: usize,
    tickets: Arc<Semaphore>,
}

impl ExecutorPool {
    pub fn new(name: &str, max: usize) -> Self {
        let max = max.min(CONCURRENT_REQUESTS_LIMIT).max(1);
        ExecutorPool {
            name: name.to_string(),
            max,
            tickets: Arc::new(Semaphore::new(max)),
        }
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.tickets.clone().try_acquire_owned().ok()
    }

    /// active_count is the number of tickets currently handed out.
    pub fn active_count(&self) -> usize {
        self.max - self.tickets.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tickets_bound_concurrency() {
        let pool = ExecutorPool::new("pool-test", 2);
        let first = pool.try_acquire().unwrap();
        let _second = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.active_count(), 2);

        drop(first);
        assert_eq!(pool.active_count(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_max_is_capped() {
        let pool = ExecutorPool::new("pool-test-cap", 100000);
        assert_eq!(pool.max, CONCURRENT_REQUESTS_LIMIT);
    }
}
