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

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::core::model::error::MeshError;
use crate::core::model::invocation::Invocation;
use crate::core::model::naming::{MicroServiceInstance, STATUS_UP};
use crate::core::registry;

pub const STRATEGY_ROUND_ROBIN: &str = "RoundRobin";
pub const STRATEGY_RANDOM: &str = "Random";
pub const STRATEGY_SESSION_STICKINESS: &str = "SessionStickiness";
pub const STRATEGY_LATENCY: &str = "WeightedResponse";

pub const FILTER_UP: &str = "up";

/// Strategy is one load-balancing algorithm. A fresh instance is built per
/// request, fed the candidate list, then asked to pick.
pub trait Strategy: Send {
    fn receive_data(
        &mut self,
        inv: &Invocation,
        instances: Vec<Arc<MicroServiceInstance>>,
        service_key: &str,
    );

    fn pick(&mut self) -> Result<Arc<MicroServiceInstance>, MeshError>;
}

pub type StrategyCtor = fn() -> Box<dyn Strategy>;

/// Filter narrows the candidate list before the strategy sees it.
pub type Filter = fn(&[Arc<MicroServiceInstance>]) -> Vec<Arc<MicroServiceInstance>>;

static STRATEGIES: Lazy<RwLock<HashMap<String, StrategyCtor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static FILTERS: Lazy<RwLock<HashMap<String, Filter>>> = Lazy::new(|| RwLock::new(HashMap::new()));

pub fn install_strategy(name: &str, ctor: StrategyCtor) {
    STRATEGIES.write().unwrap().insert(name.to_string(), ctor);
    tracing::debug!("[mesh][loadbalancer] installed strategy plugin: {}", name);
}

pub fn get_strategy_plugin(name: &str) -> Result<StrategyCtor, MeshError> {
    let strategies = STRATEGIES.read().unwrap();
    strategies.get(name).copied().ok_or_else(|| {
        MeshError::new(
            crate::core::model::error::ErrorCode::PluginError,
            format!("don't support strategy [{}]", name),
        )
    })
}

pub fn install_filter(name: &str, filter: Filter) {
    FILTERS.write().unwrap().insert(name.to_string(), filter);
}

fn up_filter(instances: &[Arc<MicroServiceInstance>]) -> Vec<Arc<MicroServiceInstance>> {
    instances
        .iter()
        .filter(|i| i.status == STATUS_UP)
        .cloned()
        .collect()
}

/// enable installs the built-in strategies and filters once at startup.
pub fn enable() {
    install_strategy(STRATEGY_ROUND_ROBIN, crate::plugins::loadbalance::roundrobin::new_strategy);
    install_strategy(STRATEGY_RANDOM, crate::plugins::loadbalance::random::new_strategy);
    install_strategy(
        STRATEGY_SESSION_STICKINESS,
        crate::plugins::loadbalance::session_stickiness::new_strategy,
    );
    install_strategy(STRATEGY_LATENCY, crate::plugins::loadbalance::latency::new_strategy);
    install_filter(FILTER_UP, up_filter);
}

/// build_strategy queries the instance cache, applies the invocation's
/// filter chain and hands the survivors to the strategy. Unknown filter
/// names are skipped.
pub fn build_strategy(inv: &Invocation, strategy: &mut dyn Strategy) -> Result<(), MeshError> {
    let mut instances = registry::find_micro_service_instances(
        &inv.source_service_id,
        &inv.micro_service_name,
        &inv.route_tags,
    )?;

    {
        let filters = FILTERS.read().unwrap();
        for name in &inv.filters {
            if name.is_empty() {
                continue;
            }
            if let Some(filter) = filters.get(name) {
                instances = filter(&instances);
            }
        }
    }

    if instances.is_empty() {
        let err = MeshError::no_available_instance(format!(
            "no available instance, key: {}({})",
            inv.micro_service_name,
            inv.route_tags.label()
        ));
        tracing::error!("[mesh][loadbalancer] {}", err);
        return Err(err);
    }

    let service_key = inv.service_key();
    strategy.receive_data(inv, instances, &service_key);
    Ok(())
}

// ---------------------------------------------------------------------------
// latency observatory

/// ProtocolStats keeps the 10 most recent request latencies of one
/// endpoint and their mean.
#[derive(Debug, Clone)]
pub struct ProtocolStats {
    pub addr: String,
    latencies: VecDeque<Duration>,
    pub avg_latency: Duration,
}

impl ProtocolStats {
    pub fn new(addr: impl Into<String>) -> Self {
        ProtocolStats {
            addr: addr.into(),
            latencies: VecDeque::with_capacity(10),
            avg_latency: Duration::ZERO,
        }
    }

    pub fn save_latency(&mut self, latency: Duration) {
        if self.latencies.len() >= 10 {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    pub fn calculate_average_latency(&mut self) {
        if self.latencies.is_empty() {
            return;
        }
        let sum: Duration = self.latencies.iter().sum();
        self.avg_latency = sum / self.latencies.len() as u32;
    }
}

// every endpoint's stats per (service, tags, protocol) key
static PROTOCOL_STATS_MAP: Lazy<RwLock<HashMap<String, Vec<ProtocolStats>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// build_key identifies one stats list.
pub fn build_key(micro_service_name: &str, tags: &str, protocol: &str) -> String {
    format!("{}/{}/{}", micro_service_name, tags, protocol)
}

/// set_latency records one request's duration for an endpoint; only the
/// latest 10 samples per endpoint are kept.
pub fn set_latency(
    latency: Duration,
    addr: &str,
    micro_service_name: &str,
    tags: &str,
    protocol: &str,
) {
    let key = build_key(micro_service_name, tags, protocol);
    let mut map = PROTOCOL_STATS_MAP.write().unwrap();
    let stats = map.entry(key).or_default();
    match stats.iter_mut().find(|s| s.addr == addr) {
        Some(s) => s.save_latency(latency),
        None => {
            let mut s = ProtocolStats::new(addr);
            s.save_latency(latency);
            stats.push(s);
        }
    }
}

/// calculate_avg_latency refreshes every endpoint's mean.
pub fn calculate_avg_latency() {
    let mut map = PROTOCOL_STATS_MAP.write().unwrap();
    for stats in map.values_mut() {
        for s in stats.iter_mut() {
            s.calculate_average_latency();
        }
    }
}

/// sort_latency re-ranks every stats list ascending by mean; the
/// latency-aware strategy reads the head.
pub fn sort_latency() {
    let mut map = PROTOCOL_STATS_MAP.write().unwrap();
    for stats in map.values_mut() {
        stats.sort_by_key(|s| s.avg_latency);
    }
}

/// fastest_addr returns the currently best-ranked endpoint for a key.
pub fn fastest_addr(key: &str) -> Option<String> {
    let map = PROTOCOL_STATS_MAP.read().unwrap();
    map.get(key).and_then(|v| v.first()).map(|s| s.addr.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::naming::Endpoint;

    fn instance(id: &str, status: &str) -> Arc<MicroServiceInstance> {
        let mut eps = HashMap::new();
        eps.insert("rest".to_string(), Endpoint::new("10.0.0.1:80"));
        let mut ins = MicroServiceInstance::new(id, "lb-core-test", "1.0.0", eps);
        ins.status = status.to_string();
        Arc::new(ins)
    }

    #[test]
    fn test_up_filter() {
        let list = vec![instance("i-1", STATUS_UP), instance("i-2", "DOWN")];
        let kept = up_filter(&list);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].instance_id, "i-1");
    }

    #[test]
    fn test_latency_window_keeps_ten() {
        let mut stats = ProtocolStats::new("10.0.0.1:80");
        for ms in 1..=12u64 {
            stats.save_latency(Duration::from_millis(ms));
        }
        stats.calculate_average_latency();
        // samples 3..=12 remain, mean 7.5ms
        assert_eq!(stats.avg_latency, Duration::from_micros(7500));
    }

    #[test]
    fn test_sorted_head_is_fastest() {
        let key_tags = "lb-core-sort";
        set_latency(Duration::from_millis(50), "a:80", "svc", key_tags, "rest");
        set_latency(Duration::from_millis(10), "b:80", "svc", key_tags, "rest");
        set_latency(Duration::from_millis(200), "c:80", "svc", key_tags, "rest");
        calculate_avg_latency();
        sort_latency();
        assert_eq!(
            fastest_addr(&build_key("svc", key_tags, "rest")).unwrap(),
            "b:80"
        );
    }
}
