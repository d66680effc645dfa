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

use crate::core::chain::{Chain, Handler, RATE_LIMITER_CONSUMER, RATE_LIMITER_PROVIDER};
use crate::core::common::{Direction, STATUS_TOO_MANY_REQUESTS};
use crate::core::control;
use crate::core::model::error::MeshError;
use crate::core::model::invocation::{Invocation, Response};
use crate::resilience::rate::get_rate_limiters;

fn too_many_requests() -> Response {
    Response::error(MeshError::too_many_requests(), STATUS_TOO_MANY_REQUESTS)
}

// non-blocking: over-rate invocations are rejected, never queued
async fn limit(chain: &Chain, inv: &mut Invocation, direction: Direction) -> Response {
    let rlc = control::get_rate_limiting(inv, direction);
    if !rlc.enabled {
        return chain.next(inv).await;
    }
    if rlc.rate <= 0 {
        return too_many_requests();
    }
    let burst = rlc.burst.unwrap_or_else(|| (rlc.rate / 5).max(1));
    if get_rate_limiters().try_accept(&rlc.key, rlc.rate, burst) {
        chain.next(inv).await
    } else {
        too_many_requests()
    }
}

/// ConsumerRateLimiterHandler throttles outbound calls per target scope.
#[derive(Debug)]
pub struct ConsumerRateLimiterHandler;

pub fn new_consumer_handler() -> Arc<dyn Handler> {
    Arc::new(ConsumerRateLimiterHandler)
}

#[async_trait]
impl Handler for ConsumerRateLimiterHandler {
    fn name(&self) -> &str {
        RATE_LIMITER_CONSUMER
    }

    async fn handle(&self, chain: &Chain, inv: &mut Invocation) -> Response {
        limit(chain, inv, Direction::Consumer).await
    }
}

/// ProviderRateLimiterHandler throttles inbound calls per source service.
#[derive(Debug)]
pub struct ProviderRateLimiterHandler;

pub fn new_provider_handler() -> Arc<dyn Handler> {
    Arc::new(ProviderRateLimiterHandler)
}

#[async_trait]
impl Handler for ProviderRateLimiterHandler {
    fn name(&self) -> &str {
        RATE_LIMITER_PROVIDER
    }

    async fn handle(&self, chain: &Chain, inv: &mut Invocation) -> Response {
        limit(chain, inv, Direction::Provider).await
    }
}
