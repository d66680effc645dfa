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

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use once_cell::sync::Lazy;

struct LimiterState {
    tokens: f64,
    last: Instant,
}

/// Limiter is a token bucket of size `burst` refilled at `limit` tokens
/// per second. It starts full. The runtime only uses the non-blocking
/// take: callers are rejected, never queued.
pub struct Limiter {
    limit: RwLock<f64>,
    burst: RwLock<f64>,
    state: Mutex<LimiterState>,
}

impl Limiter {
    pub fn new(limit: f64, burst: f64) -> Self {
        Limiter {
            limit: RwLock::new(limit),
            burst: RwLock::new(burst),
            state: Mutex::new(LimiterState {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> f64 {
        *self.limit.read().unwrap()
    }

    pub fn burst(&self) -> f64 {
        *self.burst.read().unwrap()
    }

    /// set_conf adjusts rate and burst without resetting accumulated
    /// tokens beyond the new burst cap.
    pub fn set_conf(&self, limit: f64, burst: f64) {
        *self.limit.write().unwrap() = limit;
        *self.burst.write().unwrap() = burst;
        let mut state = self.state.lock().unwrap();
        if state.tokens > burst {
            state.tokens = burst;
        }
    }

    /// allow consumes one token if available.
    pub fn allow(&self) -> bool {
        self.allow_n(1.0)
    }

    pub fn allow_n(&self, n: f64) -> bool {
        let limit = self.limit();
        let burst = self.burst();
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * limit).min(burst);
        state.last = now;
        if state.tokens >= n {
            state.tokens -= n;
            return true;
        }
        false
    }
}

/// RateLimiters is the keyed registry the flow-control handlers consult.
/// Buckets are created lazily and re-tuned in place when a rate changes.
#[derive(Default)]
pub struct RateLimiters {
    limiters: RwLock<HashMap<String, Limiter>>,
}

static RATE_LIMITERS: Lazy<RateLimiters> = Lazy::new(RateLimiters::default);

pub fn get_rate_limiters() -> &'static RateLimiters {
    &RATE_LIMITERS
}

impl RateLimiters {
    /// try_accept takes one token from the named bucket, creating or
    /// re-tuning it to `(rate, burst)` first.
    pub fn try_accept(&self, key: &str, rate: i64, burst: i64) -> bool {
        let burst = burst.max(1) as f64;
        {
            let limiters = self.limiters.read().unwrap();
            if let Some(limiter) = limiters.get(key) {
                if (limiter.limit() - rate as f64).abs() > f64::EPSILON
                    || (limiter.burst() - burst).abs() > f64::EPSILON
                {
                    limiter.set_conf(rate as f64, burst);
                }
                return limiter.allow();
            }
        }
        let mut limiters = self.limiters.write().unwrap();
        let limiter = limiters
            .entry(key.to_string())
            .or_insert_with(|| Limiter::new(rate as f64, burst));
        limiter.allow()
    }

    pub fn delete(&self, key: &str) {
        self.limiters.write().unwrap().remove(key);
    }
}
