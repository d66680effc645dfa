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

pub mod weightpool;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::core::marker;
use crate::core::model::error::{ErrorCode, MeshError};
use crate::core::model::invocation::Invocation;
use crate::core::model::naming::{SourceInfo, Tags};
use crate::core::model::router::{RouteMatch, RouteRule, RouteTag};

pub const DEFAULT_ROUTER_TYPE: &str = "rule-table";

/// Router keeps the route rules of every known target service. Rule lists
/// are stored sorted by precedence descending.
pub trait Router: Send + Sync {
    fn set_route_rule(&self, rules: HashMap<String, Vec<RouteRule>>);

    fn set_route_rule_by_key(&self, service: &str, rules: Vec<RouteRule>);

    fn delete_route_rule_by_key(&self, service: &str);

    fn fetch_route_rule_by_service_name(&self, service: &str) -> Vec<RouteRule>;

    fn list_route_rule(&self) -> HashMap<String, Vec<RouteRule>>;
}

type RouterCtor = fn() -> Result<Arc<dyn Router>, MeshError>;

static ROUTER_SERVICES: Lazy<RwLock<HashMap<String, RouterCtor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static DEFAULT_ROUTER: Lazy<RwLock<Option<Arc<dyn Router>>>> = Lazy::new(|| RwLock::new(None));

pub fn install_router_plugin(name: &str, ctor: RouterCtor) {
    tracing::info!("[mesh][router] install route rule plugin: {}", name);
    ROUTER_SERVICES
        .write()
        .unwrap()
        .insert(name.to_string(), ctor);
}

/// build_router instantiates the named implementation as the process-wide
/// router.
pub fn build_router(name: &str) -> Result<(), MeshError> {
    let ctor = {
        let services = ROUTER_SERVICES.read().unwrap();
        services.get(name).copied()
    };
    let ctor = ctor.ok_or_else(|| {
        MeshError::new(
            ErrorCode::PluginError,
            format!("router [{}] not exists", name),
        )
    })?;
    let router = ctor()?;
    *DEFAULT_ROUTER.write().unwrap() = Some(router);
    Ok(())
}

pub fn default_router() -> Option<Arc<dyn Router>> {
    DEFAULT_ROUTER.read().unwrap().clone()
}

/// ensure_default_router builds the rule-table router unless one is
/// already installed, and returns the active instance.
pub fn ensure_default_router() -> Arc<dyn Router> {
    if let Some(r) = default_router() {
        return r;
    }
    install_defaults();
    let mut guarded = DEFAULT_ROUTER.write().unwrap();
    if guarded.is_none() {
        *guarded = Some(Arc::new(RuleTableRouter::default()));
    }
    guarded.clone().unwrap()
}

/// RuleTableRouter is the built-in router: a guarded service -> rules map
/// fed by the governance dispatcher.
#[derive(Default)]
pub struct RuleTableRouter {
    rules: RwLock<HashMap<String, Vec<RouteRule>>>,
}

impl RuleTableRouter {
    fn sorted(mut rules: Vec<RouteRule>) -> Vec<RouteRule> {
        rules.sort_by(|a, b| b.precedence.cmp(&a.precedence));
        rules
    }
}

impl Router for RuleTableRouter {
    fn set_route_rule(&self, rules: HashMap<String, Vec<RouteRule>>) {
        let mut guarded = self.rules.write().unwrap();
        *guarded = rules
            .into_iter()
            .map(|(k, v)| (k, Self::sorted(v)))
            .collect();
    }

    fn set_route_rule_by_key(&self, service: &str, rules: Vec<RouteRule>) {
        let mut guarded = self.rules.write().unwrap();
        guarded.insert(service.to_string(), Self::sorted(rules));
        tracing::info!("[mesh][router] update route rule of service [{}]", service);
    }

    fn delete_route_rule_by_key(&self, service: &str) {
        let mut guarded = self.rules.write().unwrap();
        guarded.remove(service);
        tracing::info!("[mesh][router] route rule of service [{}] removed", service);
    }

    fn fetch_route_rule_by_service_name(&self, service: &str) -> Vec<RouteRule> {
        self.rules
            .read()
            .unwrap()
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    fn list_route_rule(&self) -> HashMap<String, Vec<RouteRule>> {
        self.rules.read().unwrap().clone()
    }
}

pub(crate) fn install_defaults() {
    install_router_plugin(DEFAULT_ROUTER_TYPE, || {
        Ok(Arc::new(RuleTableRouter::default()))
    });
}

/// route decides the target version/app metadata of the invocation based on
/// the configured route rules. The first matching rule wins and its
/// weighted tag pick becomes the invocation's route tags. An invocation
/// already carrying tags is left alone.
pub fn route(
    headers: &HashMap<String, String>,
    source: &SourceInfo,
    inv: &mut Invocation,
) -> Result<(), MeshError> {
    // route tags may be stamped manually ahead of the router stage
    if !inv.route_tags.is_empty() {
        return Ok(());
    }
    let router = match default_router() {
        Some(r) => r,
        None => {
            tracing::debug!("[mesh][router] router not available");
            return Ok(());
        }
    };
    let rules = router.fetch_route_rule_by_service_name(&inv.micro_service_name);
    for rule in &rules {
        if matches(inv, &rule.match_policy, headers, source) {
            if let Some(tag) = fit_rate(&rule.routes, &inv.micro_service_name) {
                inv.route_tags = Tags::new(tag.tags.clone());
            }
            break;
        }
    }
    Ok(())
}

/// fit_rate resolves one tag from a rule's weighted routes: weight-100
/// fast path, otherwise the destination's weight pool.
pub fn fit_rate(tags: &[RouteTag], dest: &str) -> Option<RouteTag> {
    if tags.is_empty() {
        return None;
    }
    if tags[0].weight == 100 {
        return Some(tags[0].clone());
    }
    let pool = weightpool::get(dest, tags);
    pool.pick_one().cloned()
}

/// matches checks one rule's predicate: a `refer` delegates to the traffic
/// marker, an empty predicate always matches, the rest is source identity
/// plus header constraints.
pub fn matches(
    inv: &mut Invocation,
    m: &RouteMatch,
    headers: &HashMap<String, String>,
    source: &SourceInfo,
) -> bool {
    if !m.refer.is_empty() {
        marker::mark(inv);
        return inv.get_mark() == m.refer;
    }
    if m.source.is_empty()
        && m.source_tags.is_empty()
        && m.headers.is_empty()
        && m.http_headers.is_empty()
    {
        return true;
    }
    source_match(m, headers, source)
}

fn source_match(m: &RouteMatch, headers: &HashMap<String, String>, source: &SourceInfo) -> bool {
    if !m.source.is_empty() && m.source != source.name {
        return false;
    }
    for (k, v) in &m.source_tags {
        if source.tags.get(k) != Some(v) {
            return false;
        }
    }
    for (k, field) in m.headers.iter().chain(m.http_headers.iter()) {
        if !header_match(headers, k, field) {
            return false;
        }
    }
    true
}

fn header_match(
    headers: &HashMap<String, String>,
    key: &str,
    field: &HashMap<String, String>,
) -> bool {
    let case_insensitive = field
        .get("caseInsensitive")
        .map(|v| v == "true")
        .unwrap_or(false);
    let value = fold_case(
        case_insensitive,
        headers.get(key).map(String::as_str).unwrap_or(""),
    );
    for (op, exp) in field {
        if op == "caseInsensitive" {
            continue;
        }
        match marker::operator::match_operator(op, &value, &fold_case(case_insensitive, exp)) {
            Ok(true) => {}
            _ => return false,
        }
    }
    true
}

fn fold_case(insensitive: bool, value: &str) -> String {
    if insensitive {
        value.to_uppercase()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::router::parse_service_rules;

    fn table_with(service: &str, doc: &str) -> RuleTableRouter {
        let router = RuleTableRouter::default();
        router.set_route_rule_by_key(service, parse_service_rules(doc).unwrap());
        router
    }

    #[test]
    fn test_rules_sorted_by_precedence_desc() {
        let doc = r#"
- precedence: 1
  route:
    - tags: {version: 1.0.0}
      weight: 100
- precedence: 5
  route:
    - tags: {version: 2.0.0}
      weight: 100
"#;
        let router = table_with("router-test-shop", doc);
        let rules = router.fetch_route_rule_by_service_name("router-test-shop");
        assert_eq!(rules[0].precedence, 5);
        assert_eq!(rules[1].precedence, 1);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let doc = r#"
- precedence: 2
  match:
    source: payment
  route:
    - tags: {version: 2.0.0}
      weight: 100
- precedence: 1
  route:
    - tags: {version: 1.0.0}
      weight: 100
"#;
        let router = ensure_default_router();
        router.set_route_rule_by_key(
            "router-test-shop",
            parse_service_rules(doc).unwrap(),
        );

        let mut inv = Invocation::new("router-test-shop");
        let source = SourceInfo {
            name: "payment".to_string(),
            tags: HashMap::new(),
        };
        route(&HashMap::new(), &source, &mut inv).unwrap();
        assert_eq!(inv.route_tags.kv.get("version").unwrap(), "2.0.0");

        // a non-matching source falls through to the lower precedence rule
        let mut inv = Invocation::new("router-test-shop");
        let source = SourceInfo {
            name: "billing".to_string(),
            tags: HashMap::new(),
        };
        route(&HashMap::new(), &source, &mut inv).unwrap();
        assert_eq!(inv.route_tags.kv.get("version").unwrap(), "1.0.0");
    }

    #[test]
    fn test_existing_tags_are_kept() {
        let mut inv = Invocation::new("router-test-shop");
        let mut kv = HashMap::new();
        kv.insert("version".to_string(), "9.9.9".to_string());
        inv.route_tags = Tags::new(kv);
        route(&HashMap::new(), &SourceInfo::default(), &mut inv).unwrap();
        assert_eq!(inv.route_tags.kv.get("version").unwrap(), "9.9.9");
    }

    #[test]
    fn test_case_insensitive_header_match() {
        let m: RouteMatch = serde_yaml::from_str(
            r#"
headers:
  user:
    exact: JACK
    caseInsensitive: "true"
"#,
        )
        .unwrap();
        let mut headers = HashMap::new();
        headers.insert("user".to_string(), "jack".to_string());
        let mut inv = Invocation::new("router-test-shop");
        assert!(matches(&mut inv, &m, &headers, &SourceInfo::default()));
    }
}
