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
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NUMBER_WINDOW_SECS: i64 = 10;
const TIMING_WINDOW_SECS: i64 = 60;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Number tracks a counter over a rolling 10 second window of one second
/// buckets. Writers prune buckets that fell out of the window.
#[derive(Debug, Default)]
pub struct Number {
    buckets: HashMap<i64, f64>,
}

impl Number {
    pub fn new() -> Self {
        Number::default()
    }

    pub fn increment(&mut self, i: f64) {
        if i == 0.0 {
            return;
        }
        let now = now_unix();
        *self.buckets.entry(now).or_insert(0.0) += i;
        self.remove_old_buckets(now);
    }

    /// update_max keeps the bucket at the maximum value seen this second.
    pub fn update_max(&mut self, n: f64) {
        let now = now_unix();
        let bucket = self.buckets.entry(now).or_insert(0.0);
        if n > *bucket {
            *bucket = n;
        }
        self.remove_old_buckets(now);
    }

    fn remove_old_buckets(&mut self, now: i64) {
        let floor = now - NUMBER_WINDOW_SECS;
        self.buckets.retain(|&ts, _| ts > floor);
    }

    /// sum over the rolling window ending at now.
    pub fn sum(&self, now: i64) -> f64 {
        self.buckets
            .iter()
            .filter(|(&ts, _)| ts > now - NUMBER_WINDOW_SECS)
            .map(|(_, v)| v)
            .sum()
    }

    pub fn max(&self, now: i64) -> f64 {
        self.buckets
            .iter()
            .filter(|(&ts, _)| ts > now - NUMBER_WINDOW_SECS)
            .map(|(_, &v)| v)
            .fold(0.0, f64::max)
    }

    pub fn avg(&self, now: i64) -> f64 {
        self.sum(now) / NUMBER_WINDOW_SECS as f64
    }
}

/// Timing keeps request durations in one second buckets over a rolling 60
/// second window, for mean and percentile reads.
#[derive(Debug, Default)]
pub struct Timing {
    buckets: HashMap<i64, Vec<Duration>>,
}

impl Timing {
    pub fn new() -> Self {
        Timing::default()
    }

    pub fn add(&mut self, duration: Duration) {
        let now = now_unix();
        self.buckets.entry(now).or_default().push(duration);
        let floor = now - TIMING_WINDOW_SECS;
        self.buckets.retain(|&ts, _| ts > floor);
    }

    fn sorted_durations(&self) -> Vec<Duration> {
        let now = now_unix();
        let mut durations: Vec<Duration> = self
            .buckets
            .iter()
            .filter(|(&ts, _)| ts >= now - TIMING_WINDOW_SECS)
            .flat_map(|(_, v)| v.iter().copied())
            .collect();
        durations.sort();
        durations
    }

    /// mean in milliseconds over the window.
    pub fn mean(&self) -> u64 {
        let durations = self.sorted_durations();
        if durations.is_empty() {
            return 0;
        }
        let sum: Duration = durations.iter().sum();
        (sum.as_millis() / durations.len() as u128) as u64
    }

    /// percentile with the ordinal method, in milliseconds.
    pub fn percentile(&self, p: f64) -> u64 {
        let durations = self.sorted_durations();
        if durations.is_empty() {
            return 0;
        }
        let pos = Self::ordinal(durations.len(), p) - 1;
        durations[pos].as_millis() as u64
    }

    fn ordinal(length: usize, percentile: f64) -> usize {
        if percentile == 0.0 && length > 0 {
            return 1;
        }
        ((percentile / 100.0) * length as f64).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_sum_within_window() {
        let mut n = Number::new();
        n.increment(1.0);
        n.increment(2.0);
        assert_eq!(n.sum(now_unix()), 3.0);
        // a sum anchored far in the future sees an empty window
        assert_eq!(n.sum(now_unix() + 100), 0.0);
    }

    #[test]
    fn test_number_max() {
        let mut n = Number::new();
        n.update_max(5.0);
        n.update_max(3.0);
        assert_eq!(n.max(now_unix()), 5.0);
    }

    #[test]
    fn test_timing_mean_and_percentile() {
        let mut t = Timing::new();
        for ms in [100u64, 200, 300, 400] {
            t.add(Duration::from_millis(ms));
        }
        assert_eq!(t.mean(), 250);
        assert_eq!(t.percentile(50.0), 200);
        assert_eq!(t.percentile(100.0), 400);
        assert_eq!(t.percentile(0.0), 100);
    }

    #[test]
    fn test_empty_timing() {
        let t = Timing::new();
        assert_eq!(t.mean(), 0);
        assert_eq!(t.percentile(99.0), 0);
    }
}
