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

/// LoadBalancingConfig is the standardized per-target model the LB handler
/// resolves before each pick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancingConfig {
    pub strategy: String,
    pub filters: Vec<String>,
    pub retry_enabled: bool,
    pub retry_on_same: u32,
    pub retry_on_next: u32,
    pub backoff_kind: String,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub session_timeout_in_seconds: u64,
    pub successive_failed_times: u32,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        LoadBalancingConfig {
            strategy: super::super::loadbalancer::STRATEGY_ROUND_ROBIN.to_string(),
            filters: Vec::new(),
            retry_enabled: false,
            retry_on_same: 0,
            retry_on_next: 0,
            backoff_kind: crate::resilience::retry::BACKOFF_ZERO.to_string(),
            backoff_min_ms: 0,
            backoff_max_ms: 0,
            session_timeout_in_seconds: 30,
            successive_failed_times: 5,
        }
    }
}
