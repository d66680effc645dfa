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

use std::time::Duration;

use rand::Rng;

pub const BACKOFF_ZERO: &str = "zero";
pub const BACKOFF_CONSTANT: &str = "constant";
pub const BACKOFF_JITTERED: &str = "jittered";
pub const BACKOFF_EXPONENTIAL: &str = "exponential";

pub const DEFAULT_BACKOFF_KIND: &str = BACKOFF_ZERO;

/// BackOff yields the sleep before each replay; the retry loop in the
/// load-balance stage drives it.
#[derive(Debug, Clone)]
pub enum BackOff {
    Zero,
    Constant(Duration),
    Jittered { min: Duration, max: Duration },
    Exponential { min: Duration, max: Duration },
}

impl BackOff {
    /// next_back_off returns the pause before attempt number
    /// `attempt` (1-based count of failures so far).
    pub fn next_back_off(&self, attempt: u32) -> Duration {
        match self {
            BackOff::Zero => Duration::ZERO,
            BackOff::Constant(d) => *d,
            BackOff::Jittered { min, max } => {
                if max <= min {
                    return *min;
                }
                let span = (*max - *min).as_millis() as u64;
                *min + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
            }
            BackOff::Exponential { min, max } => {
                let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
                let grown = min
                    .as_millis()
                    .saturating_mul(factor as u128)
                    .min(max.as_millis());
                Duration::from_millis(grown as u64)
            }
        }
    }
}

/// get_back_off maps the configured kind and bounds to a policy; unknown
/// kinds degrade to no backoff.
pub fn get_back_off(kind: &str, min_ms: u64, max_ms: u64) -> BackOff {
    match kind {
        BACKOFF_CONSTANT => BackOff::Constant(Duration::from_millis(min_ms)),
        BACKOFF_JITTERED => BackOff::Jittered {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
        },
        BACKOFF_EXPONENTIAL => BackOff::Exponential {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
        },
        _ => BackOff::Zero,
    }
}
