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

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::common::{BUILD_IN_TAG_VERSION, LATEST_VERSION};
use crate::core::model::naming::MicroServiceInstance;

/// compare_version orders dotted version strings numerically segment by
/// segment; non-numeric segments compare lexically.
pub fn compare_version(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(xn), Ok(yn)) => xn.cmp(&yn),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// IndexCache is the read-mostly instance cache: service name -> instance
/// list, plus a per-service latest-version sidecar recomputed on `set`.
pub struct IndexCache {
    latest_v: RwLock<HashMap<String, String>>,
    simple_cache: RwLock<HashMap<String, Vec<Arc<MicroServiceInstance>>>>,
}

impl Default for IndexCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexCache {
    pub fn new() -> Self {
        IndexCache {
            latest_v: RwLock::new(HashMap::new()),
            simple_cache: RwLock::new(HashMap::new()),
        }
    }

    /// set overwrites a service's instance list wholesale and refreshes the
    /// latest-version index.
    pub fn set(&self, service: &str, instances: Vec<Arc<MicroServiceInstance>>) {
        let mut latest = String::new();
        for instance in &instances {
            if latest.is_empty()
                || compare_version(instance.version(), &latest) == Ordering::Greater
            {
                latest = instance.version().to_string();
            }
        }
        if !latest.is_empty() {
            self.latest_v
                .write()
                .unwrap()
                .insert(service.to_string(), latest);
        }
        self.simple_cache
            .write()
            .unwrap()
            .insert(service.to_string(), instances);
    }

    pub fn delete(&self, service: &str) {
        self.simple_cache.write().unwrap().remove(service);
        self.latest_v.write().unwrap().remove(service);
    }

    /// get returns the instances of a service matching the tag query; the
    /// `latest` version token is rewritten to the highest cached version
    /// before the scan. No entry and no tag match both return None.
    pub fn get(
        &self,
        service: &str,
        tags: &HashMap<String, String>,
    ) -> Option<Vec<Arc<MicroServiceInstance>>> {
        let cache = self.simple_cache.read().unwrap();
        let instances = cache.get(service)?;
        if tags.is_empty() {
            return Some(instances.clone());
        }
        let query = self.rewrite_latest(service, tags);
        let result: Vec<Arc<MicroServiceInstance>> = instances
            .iter()
            .filter(|ins| ins.has(&query))
            .cloned()
            .collect();
        if result.is_empty() {
            return None;
        }
        Some(result)
    }

    // version=latest becomes the real highest version before the query
    fn rewrite_latest(
        &self,
        service: &str,
        tags: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut query = tags.clone();
        if query.get(BUILD_IN_TAG_VERSION).map(String::as_str) == Some(LATEST_VERSION) {
            let latest = self.latest_v.read().unwrap();
            if let Some(v) = latest.get(service) {
                if !v.is_empty() {
                    query.insert(BUILD_IN_TAG_VERSION.to_string(), v.clone());
                }
            }
        }
        query
    }
}
