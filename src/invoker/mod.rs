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

pub mod rest;

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::core::chain;
use crate::core::common::{
    Direction, DEFAULT_CHAIN_NAME, HEADER_SOURCE_NAME, LB_SESSION_ID, SESSION_NAMESPACE_DEFAULT,
    SESSION_NAMESPACE_KEY,
};
use crate::core::loadbalancer::STRATEGY_SESSION_STICKINESS;
use crate::core::model::error::MeshError;
use crate::core::model::invocation::{Invocation, Response};
use crate::core::registry;
use crate::core::runtime;
use crate::core::session;

/// InvokerOptions parameterize one invoker: which chain drives the call
/// and the per-call governance overrides.
#[derive(Debug, Clone)]
pub struct InvokerOptions {
    pub chain_name: String,
    pub filters: Vec<String>,
    pub strategy: String,
    pub metadata: HashMap<String, String>,
    pub protocol: String,
    pub port: String,
    pub cancel: CancellationToken,
}

impl Default for InvokerOptions {
    fn default() -> Self {
        InvokerOptions {
            chain_name: DEFAULT_CHAIN_NAME.to_string(),
            filters: Vec::new(),
            strategy: String::new(),
            metadata: HashMap::new(),
            protocol: String::new(),
            port: String::new(),
            cancel: CancellationToken::new(),
        }
    }
}

impl InvokerOptions {
    pub fn with_chain_name(mut self, name: impl Into<String>) -> Self {
        self.chain_name = name.into();
        self
    }

    pub fn with_filters(mut self, filters: Vec<String>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

pub(crate) fn wrap_invocation_with_options(inv: &mut Invocation, options: &InvokerOptions) {
    if !options.protocol.is_empty() {
        inv.protocol = options.protocol.clone();
    }
    inv.port = options.port.clone();
    inv.strategy = options.strategy.clone();
    for (k, v) in &options.metadata {
        inv.set_metadata(k.clone(), v.clone());
    }
    inv.cancel = options.cancel.clone();
}

fn namespace_from_metadata(metadata: &HashMap<String, String>) -> String {
    metadata
        .get(SESSION_NAMESPACE_KEY)
        .cloned()
        .unwrap_or_else(|| SESSION_NAMESPACE_DEFAULT.to_string())
}

// after a successful sticky call, remember the session the transport
// handed out so the next invocation of this namespace reuses the pin
fn set_cookie_to_cache(inv: &Invocation, namespace: &str) {
    if inv.strategy != STRATEGY_SESSION_STICKINESS {
        return;
    }
    let mut session_id = inv
        .reply
        .as_ref()
        .map(|r| session::session_id_from_set_cookie(&r.headers))
        .unwrap_or_default();
    if session_id.is_empty() {
        session_id = inv.header(LB_SESSION_ID).cloned().unwrap_or_default();
    }
    if !session_id.is_empty() {
        session::add_session_stickiness_to_cache(&session_id, namespace);
    }
}

/// invoke drives one invocation through the consumer chain and returns
/// the terminal response.
pub(crate) async fn invoke(inv: &mut Invocation, options: &InvokerOptions) -> Response {
    if inv.filters.is_empty() {
        inv.filters = options.filters.clone();
    }
    // the provider-side rate limiter keys on the caller's name
    inv.set_header(HEADER_SOURCE_NAME, runtime::service_name());
    // track the dependency so the background puller keeps it fresh
    registry::add_provider(&inv.micro_service_name);

    let chain = match chain::get_chain(Direction::Consumer, &options.chain_name) {
        Ok(c) => c,
        Err(err) => {
            tracing::error!("[mesh][invoker] handler chain init err: {}", err);
            return Response::error(
                err,
                crate::core::common::STATUS_INTERNAL_SERVER_ERROR,
            );
        }
    };

    let resp = chain.next(inv).await;
    if !resp.is_err() {
        set_cookie_to_cache(inv, &namespace_from_metadata(&inv.metadata));
    }
    resp
}

// adapt a terminal response into the Result callers work with
pub(crate) fn response_to_result(resp: Response) -> Result<Response, MeshError> {
    match &resp.err {
        Some(err) => Err(err.clone()),
        None => Ok(resp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = InvokerOptions::default()
            .with_chain_name("custom")
            .with_strategy(STRATEGY_SESSION_STICKINESS)
            .with_metadata(SESSION_NAMESPACE_KEY, "tenant-a")
            .with_port("admin");
        assert_eq!(options.chain_name, "custom");
        assert_eq!(options.strategy, STRATEGY_SESSION_STICKINESS);
        assert_eq!(options.port, "admin");
        assert_eq!(namespace_from_metadata(&options.metadata), "tenant-a");
    }

    #[test]
    fn test_default_namespace() {
        assert_eq!(
            namespace_from_metadata(&HashMap::new()),
            SESSION_NAMESPACE_DEFAULT
        );
    }
}
