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

pub mod circuit;
pub mod fault;
pub mod loadbalance;
pub mod marker;
pub mod ratelimiter;
pub mod router;
pub mod transport;

use crate::core::chain;

/// install_defaults registers every built-in pipeline stage; bootstrap
/// calls it once before chains are created.
pub fn install_defaults() {
    chain::register_build_in(chain::TRAFFIC_MARKER, marker::new_handler);
    chain::register_build_in(chain::ROUTER, router::new_handler);
    chain::register_build_in(chain::RATE_LIMITER_CONSUMER, ratelimiter::new_consumer_handler);
    chain::register_build_in(chain::RATE_LIMITER_PROVIDER, ratelimiter::new_provider_handler);
    chain::register_build_in(chain::CIRCUIT_CONSUMER, circuit::new_consumer_handler);
    chain::register_build_in(chain::CIRCUIT_PROVIDER, circuit::new_provider_handler);
    chain::register_build_in(chain::FAULT_INJECT, fault::new_handler);
    chain::register_build_in(chain::LOADBALANCE, loadbalance::new_handler);
    chain::register_build_in(chain::TRANSPORT, transport::new_handler);
}
