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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::core::model::router::RouteTag;

// one pool per destination service
static POOLS: Lazy<RwLock<HashMap<String, Arc<Pool>>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Pool hands out route tags in a stable round-robin schedule whose slot
/// counts are the declared weights reduced by their greatest common factor,
/// so a full cycle reproduces the configured distribution exactly.
pub struct Pool {
    tags: Vec<RouteTag>,
    schedule: Vec<usize>,
    index: AtomicUsize,
    signature: String,
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn signature_of(tags: &[RouteTag]) -> String {
    tags.iter()
        .map(|t| format!("{}={}", t.label(), t.weight))
        .collect::<Vec<String>>()
        .join(";")
}

impl Pool {
    pub fn new(tags: Vec<RouteTag>) -> Self {
        let divisor = tags
            .iter()
            .filter(|t| t.weight > 0)
            .fold(0, |acc, t| gcd(acc, t.weight));
        let mut schedule = Vec::new();
        if divisor > 0 {
            for (idx, tag) in tags.iter().enumerate() {
                for _ in 0..(tag.weight / divisor) {
                    schedule.push(idx);
                }
            }
        }
        let signature = signature_of(&tags);
        Pool {
            tags,
            schedule,
            index: AtomicUsize::new(0),
            signature,
        }
    }

    /// pick_one returns the next tag of the cycle; None means every weight
    /// was zero and the rule expresses no preference.
    pub fn pick_one(&self) -> Option<&RouteTag> {
        if self.schedule.is_empty() {
            return None;
        }
        let i = self.index.fetch_add(1, Ordering::Relaxed);
        Some(&self.tags[self.schedule[i % self.schedule.len()]])
    }

    pub fn cycle_len(&self) -> usize {
        self.schedule.len()
    }
}

/// get keeps one pool per destination, rebuilding it when the tag set or
/// the weights changed since it was built.
pub fn get(dest: &str, tags: &[RouteTag]) -> Arc<Pool> {
    let wanted = signature_of(tags);
    {
        let pools = POOLS.read().unwrap();
        if let Some(pool) = pools.get(dest) {
            if pool.signature == wanted {
                return pool.clone();
            }
        }
    }
    let pool = Arc::new(Pool::new(tags.to_vec()));
    POOLS.write().unwrap().insert(dest.to_string(), pool.clone());
    pool
}

/// reset drops a destination's pool; rule updates call this so the next
/// request rebuilds from the fresh rule.
pub fn reset(dest: &str) {
    POOLS.write().unwrap().remove(dest);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(version: &str, weight: u32) -> RouteTag {
        let mut tags = HashMap::new();
        tags.insert("version".to_string(), version.to_string());
        RouteTag { tags, weight }
    }

    #[test]
    fn test_full_cycle_matches_weights() {
        let pool = Pool::new(vec![tag("2.0", 80), tag("1.0", 20)]);
        // gcd(80, 20) = 20 so one cycle is 5 picks: 4x 2.0, 1x 1.0
        assert_eq!(pool.cycle_len(), 5);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..pool.cycle_len() {
            let t = pool.pick_one().unwrap();
            *counts.entry(t.tags["version"].clone()).or_default() += 1;
        }
        assert_eq!(counts["2.0"], 4);
        assert_eq!(counts["1.0"], 1);
    }

    #[test]
    fn test_single_nonzero_weight_always_wins() {
        let pool = Pool::new(vec![tag("2.0", 0), tag("1.0", 30)]);
        for _ in 0..10 {
            assert_eq!(pool.pick_one().unwrap().tags["version"], "1.0");
        }
    }

    #[test]
    fn test_all_zero_weights_mean_no_preference() {
        let pool = Pool::new(vec![tag("2.0", 0), tag("1.0", 0)]);
        assert!(pool.pick_one().is_none());
    }

    #[test]
    fn test_pool_rebuilds_on_changed_weights() {
        let first = get("weightpool-test-svc", &[tag("2.0", 80), tag("1.0", 20)]);
        let same = get("weightpool-test-svc", &[tag("2.0", 80), tag("1.0", 20)]);
        assert!(Arc::ptr_eq(&first, &same));
        let changed = get("weightpool-test-svc", &[tag("2.0", 50), tag("1.0", 50)]);
        assert!(!Arc::ptr_eq(&first, &changed));
        reset("weightpool-test-svc");
    }
}
