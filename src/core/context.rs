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
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

use crate::core::chain;
use crate::core::common::{Direction, DEFAULT_CHAIN_NAME};
use crate::core::config::{self, ConfigStore};
use crate::core::control;
use crate::core::loadbalancer;
use crate::core::model::error::MeshError;
use crate::core::registry::{self, health::InstanceProber, RegistryClient};
use crate::core::router;
use crate::core::runtime::{self, ServiceIdentity};
use crate::governance;
use crate::plugins;

const CHAIN_CONFIG_PREFIX: &str = "servicecomb.handler.chain";

pub const DEFAULT_CONSUMER_CHAIN: &str =
    "traffic-marker,router,ratelimiter-consumer,bizkeeper-consumer,fault-inject,loadbalance,transport";
pub const DEFAULT_PROVIDER_CHAIN: &str = "ratelimiter-provider,bizkeeper-provider";

/// ContextOptions wires the runtime to its collaborators.
pub struct ContextOptions {
    pub identity: ServiceIdentity,
    pub store: Arc<dyn ConfigStore>,
    pub registry_client: Option<Arc<dyn RegistryClient>>,
    pub instance_prober: Option<Arc<dyn InstanceProber>>,
    pub pull_interval: Duration,
}

impl ContextOptions {
    pub fn new(identity: ServiceIdentity, store: Arc<dyn ConfigStore>) -> Self {
        ContextOptions {
            identity,
            store,
            registry_client: None,
            instance_prober: None,
            pull_interval: Duration::from_secs(30),
        }
    }
}

/// MeshContext owns the bootstrapped runtime: plugin tables filled,
/// chains built, governance installed, background flows running on a
/// dedicated executor.
pub struct MeshContext {
    pub store: Arc<dyn ConfigStore>,
    runtime: Arc<Runtime>,
    flows: Vec<JoinHandle<()>>,
}

// chain-name -> comma separated handler names for one direction, read
// from `servicecomb.handler.chain.<Direction>.<chain-name>`
fn chain_config(
    store: &dyn ConfigStore,
    direction: Direction,
    default_handlers: &str,
) -> HashMap<String, String> {
    let prefix = format!("{}.{}.", CHAIN_CONFIG_PREFIX, direction.as_str());
    let mut chains: HashMap<String, String> = store
        .get_all()
        .into_iter()
        .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|name| (name.to_string(), v)))
        .collect();
    chains
        .entry(DEFAULT_CHAIN_NAME.to_string())
        .or_insert_with(|| default_handlers.to_string());
    chains
}

impl MeshContext {
    pub fn new(options: ContextOptions) -> Result<Self, MeshError> {
        let start = std::time::Instant::now();

        let executor = Builder::new_multi_thread()
            .enable_all()
            .thread_name("mesh-client-thread-pool")
            .worker_threads(4)
            .build()
            .map_err(|e| {
                MeshError::new(
                    crate::core::model::error::ErrorCode::InternalError,
                    format!("build runtime failed: {}", e),
                )
            })?;
        let executor = Arc::new(executor);

        let mut identity = options.identity.clone();
        if identity.service_id.is_empty() {
            identity.service_id = runtime::acquire_client_id();
        }
        runtime::init_identity(identity.clone());
        config::bind_global_store(options.store.clone());

        // plugin tables first, chains depend on them
        plugins::handler::install_defaults();
        loadbalancer::enable();
        router::ensure_default_router();

        control::init_panel(options.store.clone());
        governance::init(options.store.as_ref());
        governance::watch(options.store.as_ref());

        chain::create_chains(
            Direction::Consumer,
            &chain_config(
                options.store.as_ref(),
                Direction::Consumer,
                DEFAULT_CONSUMER_CHAIN,
            ),
        )?;
        chain::create_chains(
            Direction::Provider,
            &chain_config(
                options.store.as_ref(),
                Direction::Provider,
                DEFAULT_PROVIDER_CHAIN,
            ),
        )?;

        // background flows live on the owned executor
        let mut flows = Vec::new();
        {
            let _enter = executor.enter();
            flows.push(plugins::loadbalance::latency::start_ranking());
            if let Some(prober) = options.instance_prober {
                registry::enable_health_check(prober);
            }
            if let Some(client) = options.registry_client {
                flows.push(registry::start_puller(
                    client,
                    identity.service_id.clone(),
                    options.pull_interval,
                ));
            }
        }

        tracing::info!(
            "[mesh][context] runtime ready for [{}] in {:?}",
            options.identity.service_name,
            start.elapsed()
        );
        Ok(MeshContext {
            store: options.store,
            runtime: executor,
            flows,
        })
    }

    pub fn get_executor(&self) -> Arc<Runtime> {
        self.runtime.clone()
    }

    /// stop aborts the background flows; per-request state stays valid.
    pub fn stop(&mut self) {
        for flow in self.flows.drain(..) {
            flow.abort();
        }
    }
}

impl Drop for MeshContext {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MemoryConfigStore;

    #[test]
    fn test_chain_config_defaults_and_overrides() {
        let store = MemoryConfigStore::new();
        store.set(
            "servicecomb.handler.chain.Consumer.custom",
            "loadbalance,transport",
        );
        let chains = chain_config(&store, Direction::Consumer, DEFAULT_CONSUMER_CHAIN);
        assert_eq!(chains.len(), 2);
        assert_eq!(chains["custom"], "loadbalance,transport");
        assert_eq!(chains[DEFAULT_CHAIN_NAME], DEFAULT_CONSUMER_CHAIN);
    }
}
