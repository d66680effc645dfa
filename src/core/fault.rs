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
use std::sync::RwLock;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;

use crate::core::common::{Direction, PROTOCOL_REST};
use crate::core::config;
use crate::core::model::error::{ErrorCode, MeshError};
use crate::core::model::invocation::Invocation;

/// FaultRule is the injection policy resolved for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultRule {
    pub abort_percent: i64,
    pub abort_http_status: u16,
    pub delay_percent: i64,
    pub fixed_delay_ms: u64,
}

/// InjectFault validates a rule against an invocation and decides the
/// outcome: an optional transparent delay, or an abort error.
pub type InjectFault = fn(&FaultRule, &Invocation) -> Result<Option<Duration>, MeshError>;

static INJECTORS: Lazy<RwLock<HashMap<String, InjectFault>>> = Lazy::new(|| {
    let mut m: HashMap<String, InjectFault> = HashMap::new();
    m.insert(PROTOCOL_REST.to_string(), validate_and_apply_fault);
    RwLock::new(m)
});

pub fn install_fault_injection_plugin(protocol: &str, f: InjectFault) {
    INJECTORS.write().unwrap().insert(protocol.to_string(), f);
}

pub fn injector(protocol: &str) -> Option<InjectFault> {
    INJECTORS.read().unwrap().get(protocol).copied()
}

/// get_fault_config reads the injection policy for one target, the
/// service-scoped keys overriding the `_global` scope.
pub fn get_fault_config(direction: Direction, protocol: &str, service: &str) -> FaultRule {
    let store = match config::global_store() {
        Some(s) => s,
        None => return FaultRule::default(),
    };
    let dir = direction.as_str();
    let key = |scope: &str, tail: &str| {
        format!(
            "cse.governance.{}.{}.policy.fault.protocols.{}.{}",
            dir, scope, protocol, tail
        )
    };
    let read = |tail: &str, default: i64| {
        config::first_int(
            store.as_ref(),
            &[key(service, tail), key("_global", tail)],
            default,
        )
    };
    FaultRule {
        abort_percent: read("abort.percent", 0),
        abort_http_status: read("abort.httpStatus", 0) as u16,
        delay_percent: read("delay.percent", 0),
        fixed_delay_ms: read("delay.fixedDelayMs", 0) as u64,
    }
}

// percentage draw per request
fn hit(percent: i64) -> bool {
    if percent <= 0 {
        return false;
    }
    if percent >= 100 {
        return true;
    }
    rand::thread_rng().gen_range(0..100) < percent
}

fn validate_and_apply_fault(
    rule: &FaultRule,
    _inv: &Invocation,
) -> Result<Option<Duration>, MeshError> {
    if !(0..=100).contains(&rule.abort_percent) || !(0..=100).contains(&rule.delay_percent) {
        return Err(MeshError::new(
            ErrorCode::InvalidConfig,
            "fault percentage must be between 0 and 100".to_string(),
        ));
    }
    let mut delay = None;
    if rule.fixed_delay_ms > 0 && hit(rule.delay_percent) {
        delay = Some(Duration::from_millis(rule.fixed_delay_ms));
    }
    if rule.abort_http_status > 0 && hit(rule.abort_percent) {
        return Err(MeshError::new(
            ErrorCode::FaultAbort,
            format!("injecting abort with status {}", rule.abort_http_status),
        ));
    }
    Ok(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_always_fires_at_100_percent() {
        let rule = FaultRule {
            abort_percent: 100,
            abort_http_status: 503,
            ..FaultRule::default()
        };
        let inv = Invocation::new("shop");
        let err = validate_and_apply_fault(&rule, &inv).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FaultAbort);
        assert!(err.message().contains("injecting abort"));
    }

    #[test]
    fn test_zero_percent_never_fires() {
        let rule = FaultRule {
            abort_percent: 0,
            abort_http_status: 503,
            delay_percent: 0,
            fixed_delay_ms: 100,
        };
        let inv = Invocation::new("shop");
        for _ in 0..50 {
            assert!(validate_and_apply_fault(&rule, &inv).unwrap().is_none());
        }
    }

    #[test]
    fn test_delay_fires_at_100_percent() {
        let rule = FaultRule {
            delay_percent: 100,
            fixed_delay_ms: 25,
            ..FaultRule::default()
        };
        let inv = Invocation::new("shop");
        assert_eq!(
            validate_and_apply_fault(&rule, &inv).unwrap(),
            Some(Duration::from_millis(25))
        );
    }

    #[test]
    fn test_invalid_percent_rejected() {
        let rule = FaultRule {
            abort_percent: 150,
            abort_http_status: 503,
            ..FaultRule::default()
        };
        let inv = Invocation::new("shop");
        assert!(validate_and_apply_fault(&rule, &inv).is_err());
    }
}
