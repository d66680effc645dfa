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

use async_trait::async_trait;
use once_cell::sync::Lazy;

use crate::core::common::{Direction, DEFAULT_CHAIN_NAME};
use crate::core::model::error::{ErrorCode, MeshError};
use crate::core::model::invocation::{Invocation, Response};

// built-in handler names; the default consumer chain runs them in this order
pub const TRAFFIC_MARKER: &str = "traffic-marker";
pub const ROUTER: &str = "router";
pub const RATE_LIMITER_CONSUMER: &str = "ratelimiter-consumer";
pub const RATE_LIMITER_PROVIDER: &str = "ratelimiter-provider";
pub const CIRCUIT_CONSUMER: &str = "bizkeeper-consumer";
pub const CIRCUIT_PROVIDER: &str = "bizkeeper-provider";
pub const FAULT_INJECT: &str = "fault-inject";
pub const LOADBALANCE: &str = "loadbalance";
pub const TRANSPORT: &str = "transport";

const BUILD_IN: [&str; 9] = [
    TRAFFIC_MARKER,
    ROUTER,
    RATE_LIMITER_CONSUMER,
    RATE_LIMITER_PROVIDER,
    CIRCUIT_CONSUMER,
    CIRCUIT_PROVIDER,
    FAULT_INJECT,
    LOADBALANCE,
    TRANSPORT,
];

/// Handler is one stage of a chain. It either short-circuits by returning
/// a response of its own, or forwards via `chain.next(inv)`. Handlers must
/// not block on I/O except through the transport stage.
#[async_trait]
pub trait Handler: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn handle(&self, chain: &Chain, inv: &mut Invocation) -> Response;
}

pub type HandlerCtor = fn() -> Arc<dyn Handler>;

static HANDLER_FUNC_MAP: Lazy<RwLock<HashMap<String, HandlerCtor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

// created chains, key = direction + name, concurrent-read after startup
static CHAIN_MAP: Lazy<RwLock<HashMap<String, Arc<Chain>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Chain is the ordered pipeline one invocation travels through.
#[derive(Debug)]
pub struct Chain {
    pub service_type: Direction,
    pub name: String,
    handlers: Vec<Arc<dyn Handler>>,
}

impl Chain {
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// next dispatches to the handler at the invocation's cursor and
    /// advances it. Past the end of the chain an empty success response is
    /// returned: the terminal callback position of the caller.
    pub async fn next(&self, inv: &mut Invocation) -> Response {
        let index = inv.handler_index;
        if index >= self.handlers.len() {
            return Response::ok_empty();
        }
        inv.handler_index += 1;
        let handler = self.handlers[index].clone();
        handler.handle(self, inv).await
    }
}

/// register_handler lets user code add custom stages. Built-in names can
/// not be rebound and duplicated registration is refused.
pub fn register_handler(name: &str, ctor: HandlerCtor) -> Result<(), MeshError> {
    if BUILD_IN.contains(&name) {
        return Err(MeshError::new(
            ErrorCode::InvalidConfig,
            format!("can not replace build-in handler [{}]", name),
        ));
    }
    let mut handlers = HANDLER_FUNC_MAP.write().unwrap();
    if handlers.contains_key(name) {
        return Err(MeshError::new(
            ErrorCode::InvalidConfig,
            format!("duplicated handler registration [{}]", name),
        ));
    }
    handlers.insert(name.to_string(), ctor);
    Ok(())
}

/// register_build_in installs a built-in stage at startup; re-installation
/// is a no-op so bootstrap stays idempotent.
pub(crate) fn register_build_in(name: &str, ctor: HandlerCtor) {
    HANDLER_FUNC_MAP
        .write()
        .unwrap()
        .entry(name.to_string())
        .or_insert(ctor);
}

pub fn create_handler(name: &str) -> Result<Arc<dyn Handler>, MeshError> {
    let handlers = HANDLER_FUNC_MAP.read().unwrap();
    match handlers.get(name) {
        Some(ctor) => Ok(ctor()),
        None => Err(MeshError::new(
            ErrorCode::HandlerNotFound,
            format!("don't have handler [{}]", name),
        )),
    }
}

// drop empty entries from a comma separated handler list
fn parse_handlers(handler_str: &str) -> Vec<String> {
    handler_str
        .replace(' ', "")
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// create_chains builds every chain of one direction from a
/// `chain-name -> comma-separated handler names` map. Any unknown handler
/// name fails the whole construction.
pub fn create_chains(
    direction: Direction,
    handler_name_map: &HashMap<String, String>,
) -> Result<(), MeshError> {
    for (chain_name, handler_str) in handler_name_map {
        let names = parse_handlers(handler_str);
        let chain = create_chain(direction, chain_name, &names).map_err(|e| {
            MeshError::new(
                ErrorCode::InvalidConfig,
                format!(
                    "err create chain {}.{}: {}",
                    direction.as_str(),
                    chain_name,
                    e
                ),
            )
        })?;
        CHAIN_MAP
            .write()
            .unwrap()
            .insert(format!("{}{}", direction.as_str(), chain_name), chain);
    }
    Ok(())
}

pub fn create_chain(
    direction: Direction,
    chain_name: &str,
    handler_names: &[String],
) -> Result<Arc<Chain>, MeshError> {
    tracing::debug!(
        "[mesh][chain] add [{}] handlers for chain [{}]",
        handler_names.len(),
        chain_name
    );
    let mut handlers = Vec::with_capacity(handler_names.len());
    for name in handler_names {
        handlers.push(create_handler(name)?);
    }
    if handlers.is_empty() {
        tracing::warn!("[mesh][chain] chain [{}] is empty", chain_name);
    }
    Ok(Arc::new(Chain {
        service_type: direction,
        name: chain_name.to_string(),
        handlers,
    }))
}

/// get_chain returns a chain created at startup; the empty name resolves
/// to the default chain.
pub fn get_chain(direction: Direction, name: &str) -> Result<Arc<Chain>, MeshError> {
    let name = if name.is_empty() {
        DEFAULT_CHAIN_NAME
    } else {
        name
    };
    let chains = CHAIN_MAP.read().unwrap();
    chains
        .get(&format!("{}{}", direction.as_str(), name))
        .cloned()
        .ok_or_else(|| {
            MeshError::new(
                ErrorCode::HandlerNotFound,
                format!("get chain [{}{}] failed", direction.as_str(), name),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Recording {
        id: &'static str,
    }

    #[async_trait]
    impl Handler for Recording {
        fn name(&self) -> &str {
            self.id
        }

        async fn handle(&self, chain: &Chain, inv: &mut Invocation) -> Response {
            inv.set_metadata(
                "trace",
                format!("{}>{}", inv.metadata.get("trace").cloned().unwrap_or_default(), self.id),
            );
            chain.next(inv).await
        }
    }

    #[derive(Debug)]
    struct ShortCircuit;

    #[async_trait]
    impl Handler for ShortCircuit {
        fn name(&self) -> &str {
            "short"
        }

        async fn handle(&self, _chain: &Chain, _inv: &mut Invocation) -> Response {
            Response::error(
                MeshError::too_many_requests(),
                crate::core::common::STATUS_TOO_MANY_REQUESTS,
            )
        }
    }

    #[tokio::test]
    async fn test_chain_runs_handlers_in_order() {
        register_handler("chain-test-a", || Arc::new(Recording { id: "a" })).ok();
        register_handler("chain-test-b", || Arc::new(Recording { id: "b" })).ok();
        let chain = create_chain(
            Direction::Consumer,
            "order",
            &["chain-test-a".to_string(), "chain-test-b".to_string()],
        )
        .unwrap();
        let mut inv = Invocation::new("shop");
        let resp = chain.next(&mut inv).await;
        assert!(!resp.is_err());
        assert_eq!(inv.metadata.get("trace").unwrap(), ">a>b");
        assert_eq!(inv.handler_index, 2);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_rest() {
        register_handler("chain-test-short", || Arc::new(ShortCircuit)).ok();
        register_handler("chain-test-tail", || Arc::new(Recording { id: "tail" })).ok();
        let chain = create_chain(
            Direction::Consumer,
            "short",
            &["chain-test-short".to_string(), "chain-test-tail".to_string()],
        )
        .unwrap();
        let mut inv = Invocation::new("shop");
        let resp = chain.next(&mut inv).await;
        assert!(resp.is_err());
        assert!(inv.metadata.get("trace").is_none());
    }

    #[test]
    fn test_unknown_handler_fails_chain() {
        let err = create_chain(
            Direction::Consumer,
            "broken",
            &["no-such-handler".to_string()],
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::HandlerNotFound);
    }

    #[test]
    fn test_build_in_names_protected() {
        let err = register_handler(TRANSPORT, || Arc::new(ShortCircuit)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
    }

    #[test]
    fn test_parse_handlers_drops_empty() {
        assert_eq!(
            parse_handlers(" a, ,b,,c "),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }
}
