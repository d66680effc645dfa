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

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::circuit::rolling::{Number, Timing};

// terminal event types of one command execution
pub const EVENT_SUCCESS: &str = "success";
pub const EVENT_FAILURE: &str = "failure";
pub const EVENT_REJECTED: &str = "rejected";
pub const EVENT_SHORT_CIRCUIT: &str = "short-circuit";
pub const EVENT_TIMEOUT: &str = "timeout";
pub const EVENT_FALLBACK_SUCCESS: &str = "fallback-success";
pub const EVENT_FALLBACK_FAILURE: &str = "fallback-failure";

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Default)]
struct Collector {
    num_requests: Number,
    errors: Number,
    successes: Number,
    failures: Number,
    rejects: Number,
    short_circuits: Number,
    timeouts: Number,
    fallback_successes: Number,
    fallback_failures: Number,
    total_duration: Timing,
    run_duration: Timing,
}

/// MetricExchange aggregates one command's execution outcomes into rolling
/// buckets. A single mutex covers the buckets; updates are recorded on the
/// reporting path so health reads observe every prior termination.
pub struct MetricExchange {
    pub name: String,
    collector: Mutex<Collector>,
}

impl MetricExchange {
    pub fn new(name: &str) -> Self {
        MetricExchange {
            name: name.to_string(),
            collector: Mutex::new(Collector::default()),
        }
    }

    /// increment records the terminal event list of one execution; the
    /// optional second entry is the fallback outcome.
    pub fn increment(&self, types: &[&str], total_duration: Duration, run_duration: Duration) {
        let mut c = self.collector.lock().unwrap();
        match types.first().copied() {
            Some(EVENT_SUCCESS) => {
                c.num_requests.increment(1.0);
                c.successes.increment(1.0);
            }
            Some(EVENT_FAILURE) => {
                c.failures.increment(1.0);
                c.num_requests.increment(1.0);
                c.errors.increment(1.0);
            }
            Some(EVENT_REJECTED) => {
                c.rejects.increment(1.0);
                c.num_requests.increment(1.0);
                c.errors.increment(1.0);
            }
            Some(EVENT_SHORT_CIRCUIT) => {
                c.short_circuits.increment(1.0);
                c.num_requests.increment(1.0);
            }
            Some(EVENT_TIMEOUT) => {
                c.timeouts.increment(1.0);
                c.num_requests.increment(1.0);
                c.errors.increment(1.0);
            }
            _ => {}
        }
        if let Some(&fallback) = types.get(1) {
            match fallback {
                EVENT_FALLBACK_SUCCESS => c.fallback_successes.increment(1.0),
                EVENT_FALLBACK_FAILURE => c.fallback_failures.increment(1.0),
                _ => {}
            }
        }
        c.total_duration.add(total_duration);
        c.run_duration.add(run_duration);
    }

    /// record_fallback counts a fallback outcome for an execution whose
    /// terminal event was already recorded (the short-circuit path).
    pub fn record_fallback(&self, event: &str) {
        let mut c = self.collector.lock().unwrap();
        match event {
            EVENT_FALLBACK_SUCCESS => c.fallback_successes.increment(1.0),
            EVENT_FALLBACK_FAILURE => c.fallback_failures.increment(1.0),
            _ => {}
        }
    }

    pub fn requests(&self, now: i64) -> f64 {
        self.collector.lock().unwrap().num_requests.sum(now)
    }

    pub fn errors(&self, now: i64) -> f64 {
        self.collector.lock().unwrap().errors.sum(now)
    }

    pub fn short_circuits(&self, now: i64) -> f64 {
        self.collector.lock().unwrap().short_circuits.sum(now)
    }

    pub fn fallback_successes(&self, now: i64) -> f64 {
        self.collector.lock().unwrap().fallback_successes.sum(now)
    }

    pub fn fallback_failures(&self, now: i64) -> f64 {
        self.collector.lock().unwrap().fallback_failures.sum(now)
    }

    pub fn mean_run_duration_ms(&self) -> u64 {
        self.collector.lock().unwrap().run_duration.mean()
    }

    /// error_percent is rounded to the nearest integer.
    pub fn error_percent(&self, now: i64) -> u32 {
        let c = self.collector.lock().unwrap();
        let reqs = c.num_requests.sum(now);
        let errs = c.errors.sum(now);
        if reqs > 0.0 {
            ((errs / reqs) * 100.0 + 0.5) as u32
        } else {
            0
        }
    }

    pub fn is_healthy(&self, now: i64, error_percent_threshold: u32) -> bool {
        self.error_percent(now) < error_percent_threshold
    }

    pub fn reset(&self) {
        let mut c = self.collector.lock().unwrap();
        *c = Collector::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_percent_counts_rejects_but_not_short_circuits() {
        let m = MetricExchange::new("metrics-test");
        for _ in 0..6 {
            m.increment(&[EVENT_SUCCESS], Duration::from_millis(1), Duration::from_millis(1));
        }
        for _ in 0..3 {
            m.increment(&[EVENT_FAILURE], Duration::from_millis(1), Duration::from_millis(1));
        }
        m.increment(&[EVENT_REJECTED], Duration::from_millis(1), Duration::from_millis(1));
        // short-circuit adds a request but no error
        m.increment(
            &[EVENT_SHORT_CIRCUIT],
            Duration::from_millis(1),
            Duration::from_millis(1),
        );
        let now = now_unix();
        assert_eq!(m.requests(now), 11.0);
        assert_eq!(m.errors(now), 4.0);
        assert_eq!(m.error_percent(now), 36);
        assert!(m.is_healthy(now, 50));
        assert!(!m.is_healthy(now, 30));
    }

    #[test]
    fn test_reset_clears_counts() {
        let m = MetricExchange::new("metrics-test-reset");
        m.increment(&[EVENT_FAILURE], Duration::ZERO, Duration::ZERO);
        m.reset();
        assert_eq!(m.requests(now_unix()), 0.0);
        assert_eq!(m.error_percent(now_unix()), 0);
    }

    #[test]
    fn test_fallback_events() {
        let m = MetricExchange::new("metrics-test-fb");
        m.increment(
            &[EVENT_FAILURE, EVENT_FALLBACK_SUCCESS],
            Duration::ZERO,
            Duration::ZERO,
        );
        m.increment(
            &[EVENT_REJECTED, EVENT_FALLBACK_FAILURE],
            Duration::ZERO,
            Duration::ZERO,
        );
        let now = now_unix();
        assert_eq!(m.fallback_successes(now), 1.0);
        assert_eq!(m.fallback_failures(now), 1.0);
    }
}
