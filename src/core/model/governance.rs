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

pub const MARK_ONCE: &str = "once";
pub const MARK_PER_SERVICE: &str = "perService";

/// MatchPolicies is the document installed under `servicecomb.match.<name>`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchPolicies {
    #[serde(default)]
    pub matches: Vec<MatchPolicy>,
}

/// MatchPolicy is one way a request can match a traffic mark.
///
/// headers: field -> operator -> expression, every field must pass.
/// apiPath: operator -> pattern, any passing pattern is enough.
/// method:  request method must be in the set when non-empty.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchPolicy {
    #[serde(rename = "trafficMarkPolicy", default)]
    pub traffic_mark_policy: String,
    #[serde(default)]
    pub headers: HashMap<String, HashMap<String, String>>,
    #[serde(rename = "apiPath", default)]
    pub api_paths: HashMap<String, String>,
    #[serde(default)]
    pub method: Vec<String>,
}

pub fn parse_match_policies(raw: &str) -> Result<MatchPolicies, MeshError> {
    serde_yaml::from_str::<MatchPolicies>(raw)
        .map_err(|e| MeshError::new(ErrorCode::InvalidRule, format!("bad match policy: {}", e)))
}

/// LimiterPolicy is the document installed under
/// `servicecomb.rateLimiting.<name>`; it throttles requests that carry the
/// referenced traffic mark.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimiterPolicy {
    #[serde(rename = "match", default)]
    pub match_name: String,
    #[serde(default)]
    pub rate: i64,
    #[serde(default)]
    pub burst: i64,
}

pub fn parse_limiter_policy(raw: &str) -> Result<LimiterPolicy, MeshError> {
    serde_yaml::from_str::<LimiterPolicy>(raw)
        .map_err(|e| MeshError::new(ErrorCode::InvalidRule, format!("bad limiter policy: {}", e)))
}

/// RateLimitingConfig is the standardized model the rate-limiter handler
/// consumes, whichever governance source produced it.
#[derive(Debug, Clone, Default)]
pub struct RateLimitingConfig {
    pub key: String,
    pub enabled: bool,
    pub rate: i64,
    pub burst: Option<i64>,
}
