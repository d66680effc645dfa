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

use serde::Deserialize;

use crate::core::model::error::{ErrorCode, MeshError};

/// RouteRule is one dark-launch rule of a target service. Rules of one
/// service are kept sorted by precedence descending.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteRule {
    #[serde(default)]
    pub precedence: i32,
    #[serde(rename = "route", default)]
    pub routes: Vec<RouteTag>,
    #[serde(rename = "match", default)]
    pub match_policy: RouteMatch,
}

/// RouteTag is a weighted tag set; the picked one narrows instance lookup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteTag {
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub weight: u32,
}

impl RouteTag {
    /// label renders `k:v|k:v` with sorted keys, used as the weighted-pool
    /// signature so a rule change rebuilds the pool.
    pub fn label(&self) -> String {
        let mut keys: Vec<&String> = self.tags.keys().collect();
        keys.sort();
        keys.iter()
            .map(|k| format!("{}:{}", k, self.tags[k.as_str()]))
            .collect::<Vec<String>>()
            .join("|")
    }
}

/// RouteMatch checks the traffic mark reference, the caller identity and
/// request headers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteMatch {
    /// name of a marker policy; when set, matching delegates to the marker
    #[serde(default)]
    pub refer: String,
    /// caller service name
    #[serde(default)]
    pub source: String,
    #[serde(rename = "sourceTags", default)]
    pub source_tags: HashMap<String, String>,
    /// header -> operator -> expression; the `caseInsensitive` operator key
    /// toggles case folding for the whole field
    #[serde(default)]
    pub headers: HashMap<String, HashMap<String, String>>,
    #[serde(rename = "httpHeaders", default)]
    pub http_headers: HashMap<String, HashMap<String, String>>,
}

/// parse_service_rules deserializes one service's route-rule document.
pub fn parse_service_rules(raw: &str) -> Result<Vec<RouteRule>, MeshError> {
    serde_yaml::from_str::<Vec<RouteRule>>(raw)
        .map_err(|e| MeshError::new(ErrorCode::InvalidRule, format!("bad route rule: {}", e)))
}

/// validate_rules enforces that each rule's route weights sum to at most
/// 100. Invalid documents are rejected wholesale.
pub fn validate_rules(rules: &[RouteRule]) -> bool {
    for rule in rules {
        let total: u32 = rule.routes.iter().map(|t| t.weight).sum();
        if total > 100 {
            tracing::error!(
                "[mesh][router] invalid rule: weights sum to {} (> 100)",
                total
            );
            return false;
        }
    }
    true
}
