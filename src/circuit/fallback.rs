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

use once_cell::sync::Lazy;

use crate::core::common::{STATUS_OK, STATUS_SERVICE_UNAVAILABLE};
use crate::core::model::error::{ErrorCode, MeshError};
use crate::core::model::invocation::{Invocation, ProtocolResponse, Response};

pub const POLICY_RETURN_ERR: &str = "return-err";
pub const POLICY_RETURN_NULL: &str = "return-null";

/// Fallback converts a rejected or failed execution into the response the
/// caller will see instead.
pub type Fallback = fn(inv: &Invocation, err: &MeshError) -> Response;

static FALLBACKS: Lazy<RwLock<HashMap<String, Fallback>>> = Lazy::new(|| {
    let mut m: HashMap<String, Fallback> = HashMap::new();
    m.insert(POLICY_RETURN_ERR.to_string(), return_err);
    m.insert(POLICY_RETURN_NULL.to_string(), return_null);
    RwLock::new(m)
});

/// install_fallback adds a named user policy; built-in names stay bound.
pub fn install_fallback(name: &str, f: Fallback) -> Result<(), MeshError> {
    if name == POLICY_RETURN_ERR || name == POLICY_RETURN_NULL {
        return Err(MeshError::new(
            ErrorCode::InvalidConfig,
            format!("can not replace build-in fallback [{}]", name),
        ));
    }
    FALLBACKS.write().unwrap().insert(name.to_string(), f);
    Ok(())
}

pub fn get_fallback(name: &str) -> Result<Fallback, MeshError> {
    let name = if name.is_empty() {
        POLICY_RETURN_ERR
    } else {
        name
    };
    let fallbacks = FALLBACKS.read().unwrap();
    fallbacks.get(name).copied().ok_or_else(|| {
        MeshError::new(
            ErrorCode::PluginError,
            format!("don't have fallback policy [{}]", name),
        )
    })
}

// surface the original error unchanged
fn return_err(_inv: &Invocation, err: &MeshError) -> Response {
    Response::error(err.clone(), STATUS_SERVICE_UNAVAILABLE)
}

// swallow the error and hand back an empty success payload
fn return_null(_inv: &Invocation, _err: &MeshError) -> Response {
    Response {
        status: STATUS_OK,
        result: Some(ProtocolResponse {
            status: STATUS_OK,
            headers: HashMap::new(),
            body: Vec::new(),
        }),
        err: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_err_surfaces_error() {
        let inv = Invocation::new("shop");
        let resp = get_fallback(POLICY_RETURN_ERR).unwrap()(&inv, &MeshError::circuit_open("c"));
        assert!(resp.is_err());
        assert_eq!(resp.err.unwrap().code(), ErrorCode::CircuitBreakerOpen);
    }

    #[test]
    fn test_return_null_converts_to_success() {
        let inv = Invocation::new("shop");
        let resp = get_fallback(POLICY_RETURN_NULL).unwrap()(&inv, &MeshError::circuit_open("c"));
        assert!(!resp.is_err());
        assert_eq!(resp.status, STATUS_OK);
    }

    #[test]
    fn test_build_in_protection_and_user_install() {
        assert!(install_fallback(POLICY_RETURN_ERR, return_null).is_err());
        install_fallback("fallback-test-custom", |_, _| Response::ok_empty()).unwrap();
        assert!(get_fallback("fallback-test-custom").is_ok());
        // empty policy name falls back to return-err
        assert!(get_fallback("").is_ok());
    }
}
