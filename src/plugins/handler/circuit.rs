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

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::circuit::{self, fallback, metrics, RejectReason};
use crate::core::chain::{Chain, Handler, CIRCUIT_CONSUMER, CIRCUIT_PROVIDER};
use crate::core::common::{Direction, STATUS_SERVICE_UNAVAILABLE};
use crate::core::model::circuitbreaker::CommandConfig;
use crate::core::model::error::{ErrorCode, MeshError};
use crate::core::model::invocation::{Invocation, Response};

fn fallback_for(
    command: &str,
    config: &CommandConfig,
) -> Result<Option<fallback::Fallback>, MeshError> {
    if config.fallback_enabled || config.force_fallback {
        return Ok(Some(fallback::get_fallback(&config.fallback_policy)?));
    }
    Ok(None)
}

// wrap the command around the rest of the chain
async fn keep(chain: &Chain, inv: &mut Invocation, direction: Direction) -> Response {
    let (command, config) = crate::core::control::get_circuit_breaker(inv, direction);
    if !config.enabled {
        return chain.next(inv).await;
    }
    circuit::configure_command(&command, config.clone());

    let fallback_fn = match fallback_for(&command, &config) {
        Ok(f) => f,
        Err(e) => return Response::error(e, STATUS_SERVICE_UNAVAILABLE),
    };

    let breaker = circuit::get_circuit(&command);
    let guard = match breaker.try_acquire() {
        Ok(guard) => guard,
        Err(reason) => {
            let err = reason.into_error(&command);
            if matches!(reason, RejectReason::ShortCircuit) {
                tracing::warn!("[mesh][circuit] short-circuiting [{}]", command);
            }
            return match fallback_fn {
                Some(f) => run_fallback(f, &breaker, inv, err),
                None => Response::error(err, STATUS_SERVICE_UNAVAILABLE),
            };
        }
    };

    // panics inside downstream stages count as failures here, nowhere else
    let run = AssertUnwindSafe(chain.next(inv)).catch_unwind().await;
    let resp = match run {
        Ok(resp) => resp,
        Err(_) => Response::error(
            MeshError::new(ErrorCode::InternalError, "handler panicked".to_string()),
            STATUS_SERVICE_UNAVAILABLE,
        ),
    };

    match &resp.err {
        None => {
            guard.report_success(None);
            resp
        }
        Some(err) => {
            let err = err.clone();
            match fallback_fn {
                Some(f) => {
                    let fb = f(inv, &err);
                    let event = if fb.is_err() {
                        metrics::EVENT_FALLBACK_FAILURE
                    } else {
                        metrics::EVENT_FALLBACK_SUCCESS
                    };
                    guard.report_failure(Some(event));
                    fb
                }
                None => {
                    guard.report_failure(None);
                    resp
                }
            }
        }
    }
}

fn run_fallback(
    f: fallback::Fallback,
    breaker: &Arc<circuit::CircuitBreaker>,
    inv: &Invocation,
    err: MeshError,
) -> Response {
    let resp = f(inv, &err);
    let event = if resp.is_err() {
        metrics::EVENT_FALLBACK_FAILURE
    } else {
        metrics::EVENT_FALLBACK_SUCCESS
    };
    // the rejection itself was already counted on the admission path
    breaker.metrics.record_fallback(event);
    resp
}

/// BizKeeperConsumerHandler wraps the downstream stages of an outbound
/// call in its command's circuit breaker.
#[derive(Debug)]
pub struct BizKeeperConsumerHandler;

pub fn new_consumer_handler() -> Arc<dyn Handler> {
    Arc::new(BizKeeperConsumerHandler)
}

#[async_trait]
impl Handler for BizKeeperConsumerHandler {
    fn name(&self) -> &str {
        CIRCUIT_CONSUMER
    }

    async fn handle(&self, chain: &Chain, inv: &mut Invocation) -> Response {
        keep(chain, inv, Direction::Consumer).await
    }
}

/// BizKeeperProviderHandler is the inbound twin.
#[derive(Debug)]
pub struct BizKeeperProviderHandler;

pub fn new_provider_handler() -> Arc<dyn Handler> {
    Arc::new(BizKeeperProviderHandler)
}

#[async_trait]
impl Handler for BizKeeperProviderHandler {
    fn name(&self) -> &str {
        CIRCUIT_PROVIDER
    }

    async fn handle(&self, chain: &Chain, inv: &mut Invocation) -> Response {
        keep(chain, inv, Direction::Provider).await
    }
}
