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
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::core::loadbalancer::Strategy;
use crate::core::model::error::MeshError;
use crate::core::model::invocation::Invocation;
use crate::core::model::naming::MicroServiceInstance;

// every request builds a fresh strategy; the per-service position lives
// here. First access seeds with a random value to avoid warm-up bias.
static RR_INDEX_MAP: Lazy<RwLock<HashMap<String, usize>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub(crate) fn pick_index(key: &str) -> usize {
    let mut map = RR_INDEX_MAP.write().unwrap();
    let slot = map
        .entry(key.to_string())
        .or_insert_with(|| rand::random::<usize>() % (usize::MAX / 2));
    let current = *slot;
    *slot = slot.wrapping_add(1);
    current
}

pub struct RoundRobinStrategy {
    instances: Vec<Arc<MicroServiceInstance>>,
    key: String,
}

pub fn new_strategy() -> Box<dyn Strategy> {
    Box::new(RoundRobinStrategy {
        instances: Vec::new(),
        key: String::new(),
    })
}

impl Strategy for RoundRobinStrategy {
    fn receive_data(
        &mut self,
        _inv: &Invocation,
        instances: Vec<Arc<MicroServiceInstance>>,
        service_key: &str,
    ) {
        self.instances = instances;
        self.key = service_key.to_string();
    }

    fn pick(&mut self) -> Result<Arc<MicroServiceInstance>, MeshError> {
        if self.instances.is_empty() {
            return Err(MeshError::no_available_instance("none available instance"));
        }
        let i = pick_index(&self.key);
        Ok(self.instances[i % self.instances.len()].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::naming::Endpoint;

    fn instances(n: usize) -> Vec<Arc<MicroServiceInstance>> {
        (0..n)
            .map(|i| {
                let mut eps = HashMap::new();
                eps.insert("rest".to_string(), Endpoint::new(format!("10.0.0.{}:80", i)));
                Arc::new(MicroServiceInstance::new(
                    format!("i-{}", i),
                    "shop",
                    "1.0.0",
                    eps,
                ))
            })
            .collect()
    }

    #[test]
    fn test_even_distribution() {
        let list = instances(3);
        let inv = Invocation::new("shop");
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..600 {
            let mut s = new_strategy();
            s.receive_data(&inv, list.clone(), "rr-test-dist|");
            let picked = s.pick().unwrap();
            *counts.entry(picked.instance_id.clone()).or_default() += 1;
        }
        for count in counts.values() {
            assert!((199..=201).contains(count), "unbalanced: {:?}", counts);
        }
    }

    #[test]
    fn test_empty_list_is_error() {
        let inv = Invocation::new("shop");
        let mut s = new_strategy();
        s.receive_data(&inv, Vec::new(), "rr-test-empty|");
        assert!(s.pick().is_err());
    }
}
