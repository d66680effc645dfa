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
use std::time::Duration;

use rand::Rng;

use crate::core::control;
use crate::core::loadbalancer::{
    build_key, calculate_avg_latency, fastest_addr, sort_latency, Strategy, STRATEGY_LATENCY,
};
use crate::core::model::error::MeshError;
use crate::core::model::invocation::Invocation;
use crate::core::model::naming::MicroServiceInstance;

use super::roundrobin::pick_index;

const RANK_INTERVAL: Duration = Duration::from_secs(30);

/// WeightedResponseStrategy prefers the endpoint with the lowest mean
/// latency 70% of the time and falls back to round robin otherwise, so
/// slow endpoints still receive probe traffic.
pub struct WeightedResponseStrategy {
    instances: Vec<Arc<MicroServiceInstance>>,
    key: String,
    service_name: String,
    tags: String,
    protocol: String,
}

pub fn new_strategy() -> Box<dyn Strategy> {
    Box::new(WeightedResponseStrategy {
        instances: Vec::new(),
        key: String::new(),
        service_name: String::new(),
        tags: String::new(),
        protocol: String::new(),
    })
}

impl Strategy for WeightedResponseStrategy {
    fn receive_data(
        &mut self,
        inv: &Invocation,
        instances: Vec<Arc<MicroServiceInstance>>,
        service_key: &str,
    ) {
        self.instances = instances;
        self.key = service_key.to_string();
        match service_key.split_once('|') {
            Some((service, tags)) => {
                self.service_name = service.to_string();
                self.tags = tags.to_string();
            }
            None => self.service_name = service_key.to_string(),
        }
        self.protocol = inv.protocol.clone();
    }

    fn pick(&mut self) -> Result<Arc<MicroServiceInstance>, MeshError> {
        if self.instances.is_empty() {
            return Err(MeshError::no_available_instance("none available instance"));
        }
        if rand::thread_rng().gen_range(0..100) < 70 {
            let key = build_key(&self.service_name, &self.tags, &self.protocol);
            if let Some(addr) = fastest_addr(&key) {
                for instance in &self.instances {
                    if instance
                        .endpoints
                        .values()
                        .any(|ep| ep.address.contains(&addr))
                    {
                        return Ok(instance.clone());
                    }
                }
            }
        }
        // before any latency was observed, or the ranked endpoint is gone
        let i = pick_index(&self.key);
        Ok(self.instances[i % self.instances.len()].clone())
    }
}

/// start_ranking runs the periodic mean/sort pass while any target is
/// configured with the latency-aware strategy.
pub fn start_ranking() -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RANK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if control::any_service_uses_strategy(STRATEGY_LATENCY) {
                calculate_avg_latency();
                sort_latency();
                tracing::info!("[mesh][loadbalancer] re-ranked endpoints by mean latency");
            }
        }
    })
}
