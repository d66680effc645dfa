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

use crate::core::client;
use crate::core::common::Direction;
use crate::core::config::{self, ConfigEvent, ConfigListener, ConfigStore};
use crate::core::model::circuitbreaker::{CommandConfig, DEFAULT_TIMEOUT_MS};
use crate::core::model::governance::RateLimitingConfig;
use crate::core::model::invocation::Invocation;
use crate::core::model::loadbalance::LoadBalancingConfig;
use crate::governance;

pub const LB_PREFIX: &str = "cse.loadbalance.";
pub const FLOW_CONTROL_PREFIX: &str = "cse.flowcontrol";

/// effectively unlimited QPS when no limit key is configured
pub const DEFAULT_RATE: i64 = 2_147_483_647;

// field names directly under cse.loadbalance. that belong to the default
// scope; anything else is a service name
const LB_FIELDS: [&str; 7] = [
    "strategy",
    "retryEnabled",
    "retryOnNext",
    "retryOnSame",
    "serverListFilters",
    "backoff",
    "SessionStickinessRule",
];

/// Panel standardizes raw configuration keys into the models the pipeline
/// stages consume.
pub struct Panel {
    store: Arc<dyn ConfigStore>,
    lb_cache: RwLock<HashMap<String, LoadBalancingConfig>>,
}

static PANEL: Lazy<RwLock<Option<Arc<Panel>>>> = Lazy::new(|| RwLock::new(None));

struct PanelListener {
    panel: Arc<Panel>,
}

impl ConfigListener for PanelListener {
    fn on_event(&self, event: &ConfigEvent) {
        if event.key.starts_with(LB_PREFIX) {
            tracing::debug!("[mesh][control] lb config event, key: {}", event.key);
            self.panel.reload_lb_cache();
            return;
        }
        if event.key.starts_with("cse.isolation.") {
            tracing::debug!("[mesh][control] isolation event, key: {}", event.key);
            self.panel.push_timeouts_to_clients();
        }
    }
}

/// init_panel installs the process-wide panel over a configuration store
/// and subscribes it to governance key changes.
pub fn init_panel(store: Arc<dyn ConfigStore>) -> Arc<Panel> {
    let panel = Arc::new(Panel {
        store: store.clone(),
        lb_cache: RwLock::new(HashMap::new()),
    });
    panel.reload_lb_cache();
    store.register_listener(
        Arc::new(PanelListener {
            panel: panel.clone(),
        }),
        &[
            r"^cse\.loadbalance\.",
            r"^cse\.(isolation|circuitBreaker|fallback|fallbackpolicy)\.",
        ],
    );
    *PANEL.write().unwrap() = Some(panel.clone());
    panel
}

pub fn panel() -> Option<Arc<Panel>> {
    PANEL.read().unwrap().clone()
}

impl Panel {
    /// reload_lb_cache rebuilds the whole LB cache from the store snapshot;
    /// the wholesale replacement drops keys whose config went away, so
    /// re-installing the same document leaves the cache unchanged.
    pub fn reload_lb_cache(&self) {
        let snapshot = self.store.get_all();
        let mut services: HashMap<String, ()> = HashMap::new();
        let mut has_default = false;
        for key in snapshot.keys() {
            let rest = match key.strip_prefix(LB_PREFIX) {
                Some(r) => r,
                None => continue,
            };
            let head = rest.split('.').next().unwrap_or_default();
            if LB_FIELDS.contains(&head) {
                has_default = true;
            } else if !head.is_empty() {
                services.insert(head.to_string(), ());
            }
        }

        let mut fresh = HashMap::new();
        if has_default {
            fresh.insert(String::new(), self.read_lb_scope(""));
        }
        for service in services.keys() {
            fresh.insert(service.clone(), self.read_lb_scope(service));
        }
        let mut cache = self.lb_cache.write().unwrap();
        *cache = fresh;
        tracing::debug!("[mesh][control] lb cache reloaded: {} entries", cache.len());
    }

    // one scope is either the default ("") or a service name
    fn read_lb_scope(&self, service: &str) -> LoadBalancingConfig {
        let prefix = if service.is_empty() {
            LB_PREFIX.trim_end_matches('.').to_string()
        } else {
            format!("{}{}", LB_PREFIX, service)
        };
        let store = self.store.as_ref();
        let defaults = LoadBalancingConfig::default();
        let strategy = config::get_string(
            store,
            &format!("{}.strategy.name", prefix),
            &defaults.strategy,
        );
        let filters_raw = config::get_string(store, &format!("{}.serverListFilters", prefix), "");
        let filters: Vec<String> = filters_raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        LoadBalancingConfig {
            strategy: if strategy.is_empty() {
                defaults.strategy.clone()
            } else {
                strategy
            },
            filters,
            retry_enabled: config::get_bool(store, &format!("{}.retryEnabled", prefix), false),
            retry_on_same: config::get_int(store, &format!("{}.retryOnSame", prefix), 0) as u32,
            retry_on_next: config::get_int(store, &format!("{}.retryOnNext", prefix), 0) as u32,
            backoff_kind: config::get_string(
                store,
                &format!("{}.backoff.kind", prefix),
                &defaults.backoff_kind,
            ),
            backoff_min_ms: config::get_int(store, &format!("{}.backoff.minMs", prefix), 0) as u64,
            backoff_max_ms: config::get_int(store, &format!("{}.backoff.maxMs", prefix), 0) as u64,
            session_timeout_in_seconds: config::get_int(
                store,
                &format!("{}.SessionStickinessRule.sessionTimeoutInSeconds", prefix),
                defaults.session_timeout_in_seconds as i64,
            ) as u64,
            successive_failed_times: config::get_int(
                store,
                &format!("{}.SessionStickinessRule.successiveFailedTimes", prefix),
                defaults.successive_failed_times as i64,
            ) as u32,
        }
    }

    pub fn get_load_balancing(&self, service: &str) -> LoadBalancingConfig {
        let cache = self.lb_cache.read().unwrap();
        if let Some(c) = cache.get(service) {
            return c.clone();
        }
        if let Some(c) = cache.get("") {
            return c.clone();
        }
        LoadBalancingConfig::default()
    }

    pub fn any_service_uses_strategy(&self, strategy: &str) -> bool {
        self.lb_cache
            .read()
            .unwrap()
            .values()
            .any(|c| c.strategy == strategy)
    }

    pub fn lb_cache_len(&self) -> usize {
        self.lb_cache.read().unwrap().len()
    }

    // most specific configured key of the chain wins
    fn scoped_int(&self, chain: &[String], default: i64) -> i64 {
        config::first_int(self.store.as_ref(), chain, default)
    }

    fn scoped_bool(&self, specific: &str, global: &str, default: bool) -> bool {
        let store = self.store.as_ref();
        if store.get(specific).is_some() {
            return config::get_bool(store, specific, default);
        }
        config::get_bool(store, global, default)
    }

    fn scoped_string(&self, specific: &str, global: &str, default: &str) -> String {
        let store = self.store.as_ref();
        if let Some(v) = store.get(specific) {
            return v;
        }
        config::get_string(store, global, default)
    }

    /// get_rate_limiting resolves the flow-control verdict of one
    /// invocation. A mark-scoped limiter policy wins over the QPS keys.
    pub fn get_rate_limiting(&self, inv: &Invocation, direction: Direction) -> RateLimitingConfig {
        let mark = inv.get_mark();
        if mark != "none" {
            if let Some((name, policy)) = governance::limiter_policy_for_mark(&mark) {
                return RateLimitingConfig {
                    key: format!("{}.{}", governance::KIND_RATE_LIMITING_PREFIX, name),
                    enabled: true,
                    rate: policy.rate,
                    burst: if policy.burst > 0 {
                        Some(policy.burst)
                    } else {
                        None
                    },
                };
            }
        }

        let store = self.store.as_ref();
        let dir = direction.as_str();
        let enabled = config::get_bool(
            store,
            &format!("{}.{}.qps.enabled", FLOW_CONTROL_PREFIX, dir),
            true,
        );
        let chain = match direction {
            Direction::Consumer => {
                let service_key = format!(
                    "{}.{}.qps.limit.{}",
                    FLOW_CONTROL_PREFIX, dir, inv.micro_service_name
                );
                let schema_key = format!("{}.{}", service_key, inv.schema_id);
                let op_key = format!("{}.{}", schema_key, inv.operation_id);
                vec![op_key, schema_key, service_key]
            }
            Direction::Provider => {
                vec![format!(
                    "{}.{}.qps.limit.{}",
                    FLOW_CONTROL_PREFIX, dir, inv.source_micro_service
                )]
            }
        };
        let global_key = format!("{}.{}.qps.global.limit", FLOW_CONTROL_PREFIX, dir);
        let mut key = chain
            .iter()
            .find(|k| store.get(k.as_str()).is_some())
            .cloned()
            .unwrap_or_else(|| chain.last().cloned().unwrap_or_else(|| global_key.clone()));
        let mut rate = self.scoped_int(&chain, -1);
        if rate < 0 {
            rate = config::get_int(store, &global_key, DEFAULT_RATE);
            if store.get(&global_key).is_some() {
                key = global_key;
            }
        }
        RateLimitingConfig {
            key,
            enabled,
            rate,
            burst: None,
        }
    }

    /// get_circuit_breaker resolves one command's breaker settings,
    /// service-specific keys first, direction-global keys second.
    pub fn get_circuit_breaker(
        &self,
        inv: &Invocation,
        direction: Direction,
    ) -> (String, CommandConfig) {
        let dir = direction.as_str();
        let service = &inv.micro_service_name;
        let command = format!("{}.{}", dir, service);
        let defaults = CommandConfig::default();

        let cb = |prop: &str| -> (String, String) {
            (
                format!("cse.circuitBreaker.{}.{}.{}", dir, service, prop),
                format!("cse.circuitBreaker.{}.{}", dir, prop),
            )
        };
        let iso = |prop: &str| -> (String, String) {
            (
                format!("cse.isolation.{}.{}.{}", dir, service, prop),
                format!("cse.isolation.{}.{}", dir, prop),
            )
        };

        let (s, g) = cb("enabled");
        let enabled = self.scoped_bool(&s, &g, defaults.enabled);
        let (s, g) = cb("forceOpen");
        let force_open = self.scoped_bool(&s, &g, false);
        let (s, g) = cb("forceClose");
        let force_close = self.scoped_bool(&s, &g, false);
        let (s, g) = cb("requestVolumeThreshold");
        let request_volume_threshold =
            self.scoped_int(&[s, g], defaults.request_volume_threshold as i64) as u64;
        let (s, g) = cb("errorThresholdPercentage");
        let error_percent_threshold =
            self.scoped_int(&[s, g], defaults.error_percent_threshold as i64) as u32;
        let (s, g) = cb("sleepWindowInMilliseconds");
        let sleep_window_ms = self.scoped_int(&[s, g], defaults.sleep_window_ms as i64) as u64;
        let (s, g) = iso("maxConcurrentRequests");
        let max_concurrent_requests =
            self.scoped_int(&[s, g], defaults.max_concurrent_requests as i64) as usize;

        let fallback_enabled = self.scoped_bool(
            &format!("cse.fallback.{}.{}.enabled", dir, service),
            &format!("cse.fallback.{}.enabled", dir),
            false,
        );
        let force_fallback = self.scoped_bool(
            &format!("cse.fallback.{}.{}.force", dir, service),
            &format!("cse.fallback.{}.force", dir),
            false,
        );
        let fallback_policy = self.scoped_string(
            &format!("cse.fallbackpolicy.{}.{}.policy", dir, service),
            &format!("cse.fallbackpolicy.{}.policy", dir),
            "",
        );

        (
            command,
            CommandConfig {
                enabled,
                max_concurrent_requests,
                error_percent_threshold,
                request_volume_threshold,
                sleep_window_ms,
                force_open,
                force_close,
                fallback_enabled,
                force_fallback,
                fallback_policy,
            },
        )
    }

    /// get_timeout_ms resolves the per-call timeout for a target from the
    /// isolation keys.
    pub fn get_timeout_ms(&self, direction: Direction, service: &str) -> u64 {
        let dir = direction.as_str();
        self.scoped_int(
            &[
                format!("cse.isolation.{}.{}.timeoutInMilliseconds", dir, service),
                format!("cse.isolation.{}.timeoutInMilliseconds", dir),
            ],
            DEFAULT_TIMEOUT_MS as i64,
        ) as u64
    }

    // isolation reloads mutate live clients without reconnecting
    fn push_timeouts_to_clients(&self) {
        client::reload_client_timeouts(|service| {
            self.get_timeout_ms(Direction::Consumer, service)
        });
    }
}

// module-level accessors used by handlers; absent a panel they fall back
// to defaults so unit setups stay lightweight

pub fn get_load_balancing(inv: &Invocation) -> LoadBalancingConfig {
    match panel() {
        Some(p) => p.get_load_balancing(&inv.micro_service_name),
        None => LoadBalancingConfig::default(),
    }
}

pub fn get_rate_limiting(inv: &Invocation, direction: Direction) -> RateLimitingConfig {
    match panel() {
        Some(p) => p.get_rate_limiting(inv, direction),
        None => RateLimitingConfig {
            key: String::new(),
            enabled: false,
            rate: DEFAULT_RATE,
            burst: None,
        },
    }
}

pub fn get_circuit_breaker(inv: &Invocation, direction: Direction) -> (String, CommandConfig) {
    match panel() {
        Some(p) => p.get_circuit_breaker(inv, direction),
        None => (
            format!("{}.{}", direction.as_str(), inv.micro_service_name),
            CommandConfig::default(),
        ),
    }
}

pub fn get_timeout_ms(direction: Direction, service: &str) -> u64 {
    match panel() {
        Some(p) => p.get_timeout_ms(direction, service),
        None => DEFAULT_TIMEOUT_MS,
    }
}

pub fn any_service_uses_strategy(strategy: &str) -> bool {
    match panel() {
        Some(p) => p.any_service_uses_strategy(strategy),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MemoryConfigStore;

    fn fresh_panel(store: Arc<MemoryConfigStore>) -> Arc<Panel> {
        let panel = Arc::new(Panel {
            store: store.clone(),
            lb_cache: RwLock::new(HashMap::new()),
        });
        panel.reload_lb_cache();
        panel
    }

    #[test]
    fn test_lb_scope_resolution() {
        let store = Arc::new(MemoryConfigStore::new());
        store.set("cse.loadbalance.strategy.name", "Random");
        store.set("cse.loadbalance.shop.strategy.name", "SessionStickiness");
        store.set("cse.loadbalance.shop.retryEnabled", "true");
        store.set("cse.loadbalance.shop.retryOnSame", "2");
        store.set("cse.loadbalance.shop.retryOnNext", "1");
        let panel = fresh_panel(store);

        let shop = panel.get_load_balancing("shop");
        assert_eq!(shop.strategy, "SessionStickiness");
        assert!(shop.retry_enabled);
        assert_eq!(shop.retry_on_same, 2);
        assert_eq!(shop.retry_on_next, 1);

        let other = panel.get_load_balancing("billing");
        assert_eq!(other.strategy, "Random");
        assert!(!other.retry_enabled);
    }

    #[test]
    fn test_lb_reload_is_idempotent() {
        let store = Arc::new(MemoryConfigStore::new());
        store.set("cse.loadbalance.shop.strategy.name", "Random");
        let panel = fresh_panel(store.clone());
        assert_eq!(panel.lb_cache_len(), 1);

        // same document again: same cache state, no accumulating keys
        store.set("cse.loadbalance.shop.strategy.name", "Random");
        panel.reload_lb_cache();
        assert_eq!(panel.lb_cache_len(), 1);

        // removal drops the stale key
        store.delete("cse.loadbalance.shop.strategy.name");
        panel.reload_lb_cache();
        assert_eq!(panel.lb_cache_len(), 0);
    }

    #[test]
    fn test_rate_limit_key_chain() {
        let store = Arc::new(MemoryConfigStore::new());
        store.set("cse.flowcontrol.Consumer.qps.limit.shop", "100");
        store.set("cse.flowcontrol.Consumer.qps.limit.shop.rest", "50");
        let panel = fresh_panel(store);

        let mut inv = Invocation::new("shop");
        inv.schema_id = "rest".to_string();
        inv.operation_id = "/orders".to_string();
        let rlc = panel.get_rate_limiting(&inv, Direction::Consumer);
        assert!(rlc.enabled);
        // schema key is more specific than the service key
        assert_eq!(rlc.rate, 50);
        assert_eq!(rlc.key, "cse.flowcontrol.Consumer.qps.limit.shop.rest");
    }

    #[test]
    fn test_rate_limit_defaults_unlimited() {
        let store = Arc::new(MemoryConfigStore::new());
        let panel = fresh_panel(store);
        let inv = Invocation::new("shop");
        let rlc = panel.get_rate_limiting(&inv, Direction::Consumer);
        assert!(rlc.enabled);
        assert_eq!(rlc.rate, DEFAULT_RATE);
    }

    #[test]
    fn test_circuit_breaker_scoping() {
        let store = Arc::new(MemoryConfigStore::new());
        store.set("cse.circuitBreaker.Consumer.requestVolumeThreshold", "30");
        store.set(
            "cse.circuitBreaker.Consumer.shop.requestVolumeThreshold",
            "20",
        );
        store.set("cse.isolation.Consumer.maxConcurrentRequests", "77");
        let panel = fresh_panel(store);

        let inv = Invocation::new("shop");
        let (command, cfg) = panel.get_circuit_breaker(&inv, Direction::Consumer);
        assert_eq!(command, "Consumer.shop");
        assert_eq!(cfg.request_volume_threshold, 20);
        assert_eq!(cfg.max_concurrent_requests, 77);

        let inv = Invocation::new("billing");
        let (_, cfg) = panel.get_circuit_breaker(&inv, Direction::Consumer);
        assert_eq!(cfg.request_volume_threshold, 30);
    }
}
