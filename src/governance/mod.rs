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

use crate::core::config::{ConfigEvent, ConfigListener, ConfigStore, EventType};
use crate::core::marker;
use crate::core::model::error::MeshError;
use crate::core::model::governance::{parse_limiter_policy, LimiterPolicy};
use crate::core::model::router::{parse_service_rules, validate_rules};
use crate::core::router::{self, weightpool};

pub const KIND_MATCH_PREFIX: &str = "servicecomb.match";
pub const KIND_RATE_LIMITING_PREFIX: &str = "servicecomb.rateLimiting";
pub const KIND_ROUTE_RULE_PREFIX: &str = "servicecomb.routeRule";

const GOVERNANCE_NAMESPACE: &str = "servicecomb.";

/// ProcessFunc installs (or removes, on None) the value of one governance
/// key whose prefix it registered for.
pub type ProcessFunc = fn(key: &str, value: Option<&str>) -> Result<(), MeshError>;

static PROCESS_FUNC_MAP: Lazy<RwLock<HashMap<String, ProcessFunc>>> = Lazy::new(|| {
    let mut m: HashMap<String, ProcessFunc> = HashMap::new();
    m.insert(KIND_MATCH_PREFIX.to_string(), process_match);
    m.insert(KIND_RATE_LIMITING_PREFIX.to_string(), process_limiter);
    m.insert(KIND_ROUTE_RULE_PREFIX.to_string(), process_route_rule);
    RwLock::new(m)
});

// mark-scoped limiter policies, key suffix -> policy
static MARK_LIMITERS: Lazy<RwLock<HashMap<String, LimiterPolicy>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// install_processor adds a processor for a custom key prefix.
pub fn install_processor(key_prefix: &str, process: ProcessFunc) {
    PROCESS_FUNC_MAP
        .write()
        .unwrap()
        .insert(key_prefix.to_string(), process);
}

fn suffix_of<'a>(key: &'a str, prefix: &str) -> &'a str {
    key.strip_prefix(prefix)
        .map(|s| s.trim_start_matches('.'))
        .unwrap_or(key)
}

fn process_match(key: &str, value: Option<&str>) -> Result<(), MeshError> {
    let name = suffix_of(key, KIND_MATCH_PREFIX);
    match value {
        Some(v) => marker::save_match_policy(name, v),
        None => {
            marker::remove_match_policy(name);
            Ok(())
        }
    }
}

fn process_limiter(key: &str, value: Option<&str>) -> Result<(), MeshError> {
    let name = suffix_of(key, KIND_RATE_LIMITING_PREFIX);
    match value {
        Some(v) => {
            let policy = parse_limiter_policy(v)?;
            tracing::info!("[mesh][governance] add limiter policy [{}]", name);
            MARK_LIMITERS
                .write()
                .unwrap()
                .insert(name.to_string(), policy);
            Ok(())
        }
        None => {
            MARK_LIMITERS.write().unwrap().remove(name);
            Ok(())
        }
    }
}

fn process_route_rule(key: &str, value: Option<&str>) -> Result<(), MeshError> {
    let service = suffix_of(key, KIND_ROUTE_RULE_PREFIX);
    let router = router::ensure_default_router();
    match value {
        Some(v) => {
            let rules = parse_service_rules(v)?;
            if !validate_rules(&rules) {
                return Err(MeshError::new(
                    crate::core::model::error::ErrorCode::InvalidRule,
                    format!("route rule of [{}] rejected", service),
                ));
            }
            router.set_route_rule_by_key(service, rules);
            weightpool::reset(service);
            Ok(())
        }
        None => {
            router.delete_route_rule_by_key(service);
            weightpool::reset(service);
            Ok(())
        }
    }
}

/// limiter_policy_for_mark returns the policy throttling a given traffic
/// mark, with the key suffix it was installed under.
pub fn limiter_policy_for_mark(mark: &str) -> Option<(String, LimiterPolicy)> {
    let limiters = MARK_LIMITERS.read().unwrap();
    limiters
        .iter()
        .find(|(_, p)| p.match_name == mark)
        .map(|(name, p)| (name.clone(), p.clone()))
}

fn dispatch(key: &str, value: Option<&str>) {
    let process = {
        let processors = PROCESS_FUNC_MAP.read().unwrap();
        processors
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, f)| *f)
    };
    match process {
        Some(f) => {
            // a parse failure keeps the previously installed value in force
            if let Err(e) = f(key, value) {
                tracing::error!("[mesh][governance] can not process {}: {}", key, e);
            }
        }
        None => {
            // chain wiring lives under servicecomb.handler and is consumed
            // at bootstrap, not by governance processors
            if key.starts_with(GOVERNANCE_NAMESPACE) && !key.starts_with("servicecomb.handler.") {
                tracing::warn!("[mesh][governance] no processor for key {}", key);
            }
        }
    }
}

/// init walks the configuration snapshot and installs every governance
/// key a processor claims.
pub fn init(store: &dyn ConfigStore) {
    tracing::info!("[mesh][governance] process all governance rules");
    for (key, value) in store.get_all() {
        if key.starts_with(GOVERNANCE_NAMESPACE) {
            dispatch(&key, Some(&value));
        }
    }
}

struct GovernanceListener;

impl ConfigListener for GovernanceListener {
    fn on_event(&self, event: &ConfigEvent) {
        match event.event_type {
            EventType::Create | EventType::Update => {
                dispatch(&event.key, event.value.as_deref())
            }
            EventType::Delete => dispatch(&event.key, None),
        }
    }
}

/// watch subscribes the dispatcher to every governance-namespace change.
pub fn watch(store: &dyn ConfigStore) {
    store.register_listener(Arc::new(GovernanceListener), &[r"^servicecomb\."]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MemoryConfigStore;

    #[test]
    fn test_snapshot_init_installs_policies() {
        let store = MemoryConfigStore::new();
        store.set(
            "servicecomb.match.governance-test-mark",
            "matches:\n  - apiPath:\n      exact: \"/governance/init\"\n",
        );
        store.set(
            "servicecomb.rateLimiting.governance-test-limit",
            "match: governance-test-mark\nrate: 5\nburst: 1\n",
        );
        init(&store);

        assert!(marker::policy("governance-test-mark").is_some());
        let (name, policy) = limiter_policy_for_mark("governance-test-mark").unwrap();
        assert_eq!(name, "governance-test-limit");
        assert_eq!(policy.rate, 5);

        marker::remove_match_policy("governance-test-mark");
        MARK_LIMITERS.write().unwrap().remove("governance-test-limit");
    }

    #[test]
    fn test_events_update_and_delete() {
        let store = MemoryConfigStore::new();
        watch(&store);

        store.set(
            "servicecomb.match.governance-test-evt",
            "matches:\n  - apiPath:\n      exact: \"/governance/evt\"\n",
        );
        assert!(marker::policy("governance-test-evt").is_some());

        store.delete("servicecomb.match.governance-test-evt");
        assert!(marker::policy("governance-test-evt").is_none());
    }

    #[test]
    fn test_parse_failure_keeps_previous_value() {
        let store = MemoryConfigStore::new();
        watch(&store);
        store.set(
            "servicecomb.match.governance-test-keep",
            "matches:\n  - apiPath:\n      exact: \"/governance/keep\"\n",
        );
        store.set("servicecomb.match.governance-test-keep", "{ broken ::");
        assert!(marker::policy("governance-test-keep").is_some());
        marker::remove_match_policy("governance-test-keep");
    }

    #[test]
    fn test_route_rule_rejected_wholesale() {
        let store = MemoryConfigStore::new();
        watch(&store);
        let service = "governance-test-route";
        store.set(
            format!("servicecomb.routeRule.{}", service),
            "- precedence: 1\n  route:\n    - tags: {version: 1.0.0}\n      weight: 100\n",
        );
        let router = router::ensure_default_router();
        assert_eq!(router.fetch_route_rule_by_service_name(service).len(), 1);

        // overweight document: prior rule set stays installed
        store.set(
            format!("servicecomb.routeRule.{}", service),
            "- precedence: 2\n  route:\n    - tags: {version: 1.0.0}\n      weight: 80\n    - tags: {version: 2.0.0}\n      weight: 80\n",
        );
        let rules = router.fetch_route_rule_by_service_name(service);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].precedence, 1);
        router.delete_route_rule_by_key(service);
    }
}
