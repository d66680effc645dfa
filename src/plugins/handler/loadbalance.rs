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

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::chain::{Chain, Handler, LOADBALANCE};
use crate::core::common::{gen_proto_endpoint, STATUS_SERVICE_UNAVAILABLE};
use crate::core::control;
use crate::core::loadbalancer;
use crate::core::model::error::MeshError;
use crate::core::model::invocation::{Invocation, Response};
use crate::core::model::loadbalance::LoadBalancingConfig;
use crate::resilience::retry;

/// LBHandler resolves a concrete endpoint for the invocation and, when
/// retry is enabled, replays the remainder of the chain within the
/// configured budgets.
#[derive(Debug)]
pub struct LBHandler;

pub fn new_handler() -> Arc<dyn Handler> {
    Arc::new(LBHandler)
}

// pick an instance and resolve its endpoint for the invocation's
// protocol-port key
fn get_endpoint(
    inv: &mut Invocation,
    lb_config: &LoadBalancingConfig,
) -> Result<(String, bool), MeshError> {
    if inv.strategy.is_empty() {
        inv.strategy = lb_config.strategy.clone();
    }
    let ctor = loadbalancer::get_strategy_plugin(&inv.strategy).map_err(|e| {
        tracing::error!(
            "[mesh][loadbalancer] get strategy [{}] failed: {}",
            inv.strategy,
            e
        );
        e
    })?;

    if inv.filters.is_empty() {
        inv.filters = lb_config.filters.clone();
    }

    let mut strategy = ctor();
    loadbalancer::build_strategy(inv, strategy.as_mut())?;
    let instance = strategy.pick()?;

    if inv.protocol.is_empty() {
        if let Some(p) = instance.endpoints.keys().next() {
            inv.protocol = p.clone();
        }
    }
    let protocol_server = gen_proto_endpoint(&inv.protocol, &inv.port);
    match instance.endpoints.get(&protocol_server) {
        Some(ep) => Ok((ep.address.clone(), ep.ssl_enabled)),
        None => {
            let err = MeshError::no_available_instance(format!(
                "no available instance for protocol server [{}], microservice: {}",
                protocol_server, inv.micro_service_name
            ));
            tracing::error!("[mesh][loadbalancer] {}", err);
            Err(err)
        }
    }
}

async fn handle_with_no_retry(
    chain: &Chain,
    inv: &mut Invocation,
    lb_config: &LoadBalancingConfig,
) -> Response {
    let (address, ssl) = match get_endpoint(inv, lb_config) {
        Ok(ep) => ep,
        Err(err) => return Response::error(err, STATUS_SERVICE_UNAVAILABLE),
    };
    inv.endpoint = address;
    inv.ssl_enable = ssl;
    chain.next(inv).await
}

async fn handle_with_retry(
    chain: &Chain,
    inv: &mut Invocation,
    lb_config: &LoadBalancingConfig,
) -> Response {
    let retry_on_same = lb_config.retry_on_same;
    let mut retry_on_next = lb_config.retry_on_next;
    // the cursor is restored before each replay; the request body is
    // already materialized into owned bytes, so replaying is free
    let handler_index = inv.handler_index;
    let backoff = retry::get_back_off(
        &lb_config.backoff_kind,
        lb_config.backoff_min_ms,
        lb_config.backoff_max_ms,
    );

    // an endpoint failure before the first attempt is not retried
    let (mut address, mut ssl) = match get_endpoint(inv, lb_config) {
        Ok(ep) => ep,
        Err(err) => return Response::error(err, STATUS_SERVICE_UNAVAILABLE),
    };

    let mut call_times: u32 = 0;
    let mut failures: u32 = 0;
    loop {
        inv.endpoint = address.clone();
        inv.ssl_enable = ssl;
        inv.handler_index = handler_index;
        call_times += 1;

        let resp = chain.next(inv).await;
        let stop = match &resp.err {
            None => true,
            Some(err) => err.is_permanent_for_retry(),
        };
        if stop {
            return resp;
        }

        if call_times >= retry_on_same + 1 {
            if retry_on_next == 0 {
                tracing::error!(
                    "[mesh][loadbalancer] stop retry, budgets exhausted: {:?}",
                    resp.err
                );
                return resp;
            }
            match get_endpoint(inv, lb_config) {
                Ok(ep) => {
                    address = ep.0;
                    ssl = ep.1;
                    call_times = 0;
                    retry_on_next -= 1;
                }
                Err(_) => return resp,
            }
        }

        failures += 1;
        let pause = backoff.next_back_off(failures);
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
}

#[async_trait]
impl Handler for LBHandler {
    fn name(&self) -> &str {
        LOADBALANCE
    }

    async fn handle(&self, chain: &Chain, inv: &mut Invocation) -> Response {
        let lb_config = control::get_load_balancing(inv);
        if !lb_config.retry_enabled {
            handle_with_no_retry(chain, inv, &lb_config).await
        } else {
            handle_with_retry(chain, inv, &lb_config).await
        }
    }
}
