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

pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 1000;
pub const DEFAULT_ERROR_PERCENT_THRESHOLD: u32 = 50;
pub const DEFAULT_REQUEST_VOLUME_THRESHOLD: u64 = 20;
pub const DEFAULT_SLEEP_WINDOW_MS: u64 = 15000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30000;

/// CommandConfig is the standardized circuit-breaker model for one command
/// (`direction.serviceName`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandConfig {
    pub enabled: bool,
    pub max_concurrent_requests: usize,
    pub error_percent_threshold: u32,
    /// minimum requests inside the rolling window before a trip is allowed
    pub request_volume_threshold: u64,
    /// how long the breaker stays Open before admitting a probe
    pub sleep_window_ms: u64,
    pub force_open: bool,
    pub force_close: bool,
    pub fallback_enabled: bool,
    pub force_fallback: bool,
    pub fallback_policy: String,
}

impl Default for CommandConfig {
    fn default() -> Self {
        CommandConfig {
            enabled: true,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            error_percent_threshold: DEFAULT_ERROR_PERCENT_THRESHOLD,
            request_volume_threshold: DEFAULT_REQUEST_VOLUME_THRESHOLD,
            sleep_window_ms: DEFAULT_SLEEP_WINDOW_MS,
            force_open: false,
            force_close: false,
            fallback_enabled: false,
            force_fallback: false,
            fallback_policy: String::new(),
        }
    }
}
