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

pub mod operator;

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::core::common::HEADER_MARK;
use crate::core::model::error::MeshError;
use crate::core::model::governance::{
    parse_match_policies, MatchPolicies, MatchPolicy, MARK_ONCE,
};
use crate::core::model::invocation::Invocation;

// installed traffic marks, name -> policies
static MATCHES: Lazy<RwLock<HashMap<String, MatchPolicies>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// save_match_policy parses and installs a mark document. On a parse
/// failure the previously installed value stays in force.
pub fn save_match_policy(name: &str, value: &str) -> Result<(), MeshError> {
    let policies = parse_match_policies(value).map_err(|e| {
        tracing::error!("[mesh][marker] invalid policy {}: {}", name, e);
        e
    })?;
    tracing::info!("[mesh][marker] add match policy [{}]", name);
    MATCHES.write().unwrap().insert(name.to_string(), policies);
    Ok(())
}

pub fn remove_match_policy(name: &str) {
    MATCHES.write().unwrap().remove(name);
}

pub fn policy(name: &str) -> Option<MatchPolicies> {
    MATCHES.read().unwrap().get(name).cloned()
}

/// mark stamps the invocation with the first mark whose policy list
/// matches. A `once` scope also writes the mark header so downstream
/// services observe the same stamp.
pub fn mark(inv: &mut Invocation) {
    let mut match_name = String::new();
    let mut scope = MARK_ONCE.to_string();
    {
        let matches = MATCHES.read().unwrap();
        'outer: for (name, policies) in matches.iter() {
            for mp in &policies.matches {
                if is_match(inv, mp) {
                    match_name = name.clone();
                    scope = mp.traffic_mark_policy.clone();
                    break 'outer;
                }
            }
        }
    }

    if !match_name.is_empty() {
        if scope == MARK_ONCE {
            inv.set_header(HEADER_MARK, match_name.clone());
        }
        inv.mark(&match_name);
    }
}

// every condition of the policy must hold
fn is_match(inv: &Invocation, policy: &MatchPolicy) -> bool {
    if !heads_match(&inv.headers, &policy.headers) {
        return false;
    }
    if !policy.api_paths.is_empty() && !api_match(&inv.args.api_path, &policy.api_paths) {
        return false;
    }
    if !policy.method.is_empty() && !method_match(&inv.args.method, &policy.method) {
        return false;
    }
    true
}

fn method_match(req_method: &str, methods: &[String]) -> bool {
    let upper = req_method.to_uppercase();
    methods.iter().any(|m| upper == *m)
}

// one passing pattern is enough
fn api_match(api_path: &str, api_policy: &HashMap<String, String>) -> bool {
    if api_policy.is_empty() {
        return true;
    }
    for (op, exp) in api_policy {
        if let Ok(true) = operator::match_operator(op, api_path, exp) {
            return true;
        }
    }
    false
}

// each constrained header must exist and pass every per-field operator
fn heads_match(
    headers: &HashMap<String, String>,
    head_policy: &HashMap<String, HashMap<String, String>>,
) -> bool {
    for (key, field_policy) in head_policy {
        let val = match headers.get(key) {
            Some(v) if !v.is_empty() => v,
            _ => return false,
        };
        for (op, exp) in field_policy {
            match operator::match_operator(op, val, exp) {
                Ok(true) => {}
                _ => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::common::MD_MARK;

    // every test works on its own api path so the shared policy table can
    // not cross-match between concurrently running tests
    fn policy_doc(path: &str) -> String {
        format!(
            r#"
matches:
  - headers:
      os:
        contains: linux
      version:
        noLess: "2"
    apiPath:
      exact: "{}"
    method:
      - GET
    trafficMarkPolicy: once
"#,
            path
        )
    }

    fn marked_invocation(path: &str) -> Invocation {
        let mut inv = Invocation::new("shop");
        inv.set_header("os", "linux-amd64");
        inv.set_header("version", "3");
        inv.args.api_path = path.to_string();
        inv.args.method = "GET".to_string();
        inv
    }

    #[test]
    fn test_mark_and_propagate() {
        save_match_policy("marker-test-linux", &policy_doc("/marker/propagate")).unwrap();
        let mut inv = marked_invocation("/marker/propagate");
        mark(&mut inv);
        assert_eq!(inv.get_mark(), "marker-test-linux");
        // once scope writes the downstream header
        assert_eq!(inv.header(HEADER_MARK).unwrap(), "marker-test-linux");
        remove_match_policy("marker-test-linux");
    }

    #[test]
    fn test_missing_header_fails_policy() {
        save_match_policy("marker-test-missing", &policy_doc("/marker/missing")).unwrap();
        let mut inv = marked_invocation("/marker/missing");
        inv.headers.remove("os");
        mark(&mut inv);
        assert_eq!(inv.get_mark(), "none");
        remove_match_policy("marker-test-missing");
    }

    #[test]
    fn test_per_service_scope_stays_local() {
        let policy = r#"
matches:
  - apiPath:
      exact: "/local/api"
    trafficMarkPolicy: perService
"#;
        save_match_policy("marker-test-local", policy).unwrap();
        let mut inv = Invocation::new("shop");
        inv.args.api_path = "/local/api".to_string();
        mark(&mut inv);
        assert_eq!(inv.get_mark(), "marker-test-local");
        assert!(inv.header(HEADER_MARK).is_none());
        remove_match_policy("marker-test-local");
    }

    #[test]
    fn test_marking_twice_is_idempotent() {
        save_match_policy("marker-test-idem", &policy_doc("/marker/idem")).unwrap();
        let mut inv = marked_invocation("/marker/idem");
        mark(&mut inv);
        let first = inv.metadata.get(MD_MARK).cloned();
        mark(&mut inv);
        assert_eq!(inv.metadata.get(MD_MARK).cloned(), first);
        remove_match_policy("marker-test-idem");
    }

    #[test]
    fn test_bad_policy_keeps_previous() {
        save_match_policy("marker-test-keep", &policy_doc("/marker/keep")).unwrap();
        assert!(save_match_policy("marker-test-keep", "{ not yaml ::").is_err());
        assert!(policy("marker-test-keep").is_some());
        remove_match_policy("marker-test-keep");
    }
}
