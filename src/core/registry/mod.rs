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

pub mod cache;
pub mod health;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;

use crate::core::client;
use crate::core::model::error::{ErrorCode, MeshError};
use crate::core::model::naming::{MicroServiceInstance, Tags, STATUS_UP};
use crate::core::registry::cache::IndexCache;
use crate::core::registry::health::{HealthChecker, InstanceProber, WrapInstance};

/// RegistryClient is the service-registry collaborator. The wire protocol
/// behind it is opaque to the runtime.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn find_instances(
        &self,
        source_service_id: &str,
        service: &str,
        tags: &Tags,
    ) -> Result<Vec<Arc<MicroServiceInstance>>, MeshError>;

    async fn register(&self, instance: Arc<MicroServiceInstance>) -> Result<(), MeshError>;

    async fn heartbeat(&self, service: &str, instance_id: &str) -> Result<(), MeshError>;

    async fn unregister(&self, service: &str, instance_id: &str) -> Result<(), MeshError>;
}

// service name -> live instances, shared by every strategy
static MICROSERVICE_INSTANCE_INDEX: Lazy<IndexCache> = Lazy::new(IndexCache::new);

// providers this process depends on; the puller refreshes each of them
static PROVIDERS: Lazy<RwLock<HashSet<String>>> = Lazy::new(|| RwLock::new(HashSet::new()));

static HEALTH_CHECKER: Lazy<RwLock<Option<Arc<HealthChecker>>>> = Lazy::new(|| RwLock::new(None));

pub fn instance_index() -> &'static IndexCache {
    &MICROSERVICE_INSTANCE_INDEX
}

/// add_provider marks a service as a dependency so the background puller
/// keeps its instances fresh.
pub fn add_provider(service: &str) {
    PROVIDERS.write().unwrap().insert(service.to_string());
}

pub fn providers() -> Vec<String> {
    PROVIDERS.read().unwrap().iter().cloned().collect()
}

/// enable_health_check starts the coalescing checker; without it every
/// unknown instance is dropped on refresh.
pub fn enable_health_check(prober: Arc<dyn InstanceProber>) {
    let mut checker = HEALTH_CHECKER.write().unwrap();
    if checker.is_none() {
        *checker = Some(Arc::new(HealthChecker::run(prober)));
    }
}

async fn health_check(instance: Arc<MicroServiceInstance>) -> Result<(), MeshError> {
    let checker = HEALTH_CHECKER.read().unwrap().clone();
    match checker {
        Some(c) => {
            c.add(WrapInstance {
                app_id: instance.app_id().to_string(),
                service_name: instance.service_name.clone(),
                version: instance.version().to_string(),
                instance: instance.clone(),
            })
            .await
        }
        None => Err(MeshError::new(
            ErrorCode::NotSupport,
            "health check is disabled".to_string(),
        )),
    }
}

/// find_micro_service_instances is the lookup the load balancer performs:
/// a tag-filtered read of the local cache.
pub fn find_micro_service_instances(
    _source_service_id: &str,
    service: &str,
    tags: &Tags,
) -> Result<Vec<Arc<MicroServiceInstance>>, MeshError> {
    match MICROSERVICE_INSTANCE_INDEX.get(service, &tags.kv) {
        Some(instances) => Ok(instances),
        None => Ok(Vec::new()),
    }
}

/// refresh_cache reconciles one service's cached instances against the
/// authoritative `(ups, downs)` pulled from the registry:
/// instances in both stay; instances gone to downs are dropped and their
/// protocol clients closed; instances in neither go through the health
/// checker; new ups are appended. An empty result deletes the key, the
/// cache never holds a zero-length list for a live service.
pub async fn refresh_cache(
    service: &str,
    ups: Vec<Arc<MicroServiceInstance>>,
    downs: &HashSet<String>,
) {
    let current = MICROSERVICE_INSTANCE_INDEX.get(service, &HashMap::new());
    let current = match current {
        None => {
            tracing::debug!(
                "[mesh][registry] cached [{}] instances of service [{}]",
                ups.len(),
                service
            );
            if !ups.is_empty() {
                MICROSERVICE_INSTANCE_INDEX.set(service, ups);
            }
            return;
        }
        Some(c) => c,
    };

    let map_ups: HashMap<&str, &Arc<MicroServiceInstance>> =
        ups.iter().map(|i| (i.instance_id.as_str(), i)).collect();
    let map_exps: HashSet<&str> = current.iter().map(|i| i.instance_id.as_str()).collect();

    let mut lefts: Vec<Arc<MicroServiceInstance>> = Vec::with_capacity(ups.len());
    for exp in &current {
        if map_ups.contains_key(exp.instance_id.as_str()) {
            lefts.push(exp.clone());
            continue;
        }
        // departed endpoint, drop its live clients
        close_instance_clients(service, exp).await;
        if downs.contains(&exp.instance_id) {
            continue;
        }
        // neither up nor down: keep it while the checker verifies it; the
        // prober verdict evicts it if the probe fails
        if health_check(exp.clone()).await.is_ok() {
            lefts.push(exp.clone());
        }
    }

    for up in &ups {
        if !map_exps.contains(up.instance_id.as_str()) {
            lefts.push(up.clone());
        }
    }

    if lefts.is_empty() {
        MICROSERVICE_INSTANCE_INDEX.delete(service);
        tracing::info!("[mesh][registry] deleted service [{}] from the cache", service);
        return;
    }
    tracing::debug!(
        "[mesh][registry] cached [{}] instances of service [{}]",
        lefts.len(),
        service
    );
    MICROSERVICE_INSTANCE_INDEX.set(service, lefts);
}

async fn close_instance_clients(service: &str, instance: &Arc<MicroServiceInstance>) {
    for (protocol, ep) in &instance.endpoints {
        match client::close(protocol, service, &ep.address).await {
            Ok(()) => tracing::debug!(
                "[mesh][registry] closed [{}] client for service [{}], instance [{}]",
                protocol,
                service,
                instance.instance_id
            ),
            Err(e) if e.code() == ErrorCode::ClientNotFound => {}
            Err(e) => tracing::error!(
                "[mesh][registry] can not close [{}] client for service [{}]: {}",
                protocol,
                service,
                e
            ),
        }
    }
}

/// evict_unhealthy demotes probe-failed instances: they are removed from
/// the cache and their protocol clients closed. A service whose list
/// empties loses its key outright, the cache never holds a zero-length
/// list. The health-checker worker calls this with the prober's verdict.
pub async fn evict_unhealthy(batch: &[WrapInstance]) {
    let mut by_service: HashMap<&str, HashSet<&str>> = HashMap::new();
    for wrap in batch {
        by_service
            .entry(wrap.service_name.as_str())
            .or_default()
            .insert(wrap.instance.instance_id.as_str());
    }

    for (service, ids) in by_service {
        let current = match MICROSERVICE_INSTANCE_INDEX.get(service, &HashMap::new()) {
            Some(c) => c,
            None => continue,
        };
        let mut lefts: Vec<Arc<MicroServiceInstance>> = Vec::with_capacity(current.len());
        for ins in &current {
            if ids.contains(ins.instance_id.as_str()) {
                close_instance_clients(service, ins).await;
                tracing::info!(
                    "[mesh][registry] evicted unhealthy instance [{}] of service [{}]",
                    ins.instance_id,
                    service
                );
            } else {
                lefts.push(ins.clone());
            }
        }
        if lefts.len() == current.len() {
            continue;
        }
        if lefts.is_empty() {
            MICROSERVICE_INSTANCE_INDEX.delete(service);
            tracing::info!(
                "[mesh][registry] deleted service [{}] from the cache",
                service
            );
        } else {
            MICROSERVICE_INSTANCE_INDEX.set(service, lefts);
        }
    }
}

/// pull_service fetches a provider's instances once, splits them into
/// `(ups, downs)` by status and reconciles the cache.
pub async fn pull_service(client: &dyn RegistryClient, source_id: &str, service: &str) {
    match client.find_instances(source_id, service, &Tags::default()).await {
        Ok(instances) => {
            let mut ups = Vec::with_capacity(instances.len());
            let mut downs = HashSet::new();
            for ins in instances {
                if ins.status == STATUS_UP {
                    ups.push(ins);
                } else {
                    downs.insert(ins.instance_id.clone());
                }
            }
            refresh_cache(service, ups, &downs).await;
        }
        Err(e) => {
            tracing::error!(
                "[mesh][registry] pull instances of [{}] failed: {}",
                service,
                e
            );
        }
    }
}

/// start_puller spawns the periodic refresh loop over tracked providers.
pub fn start_puller(
    client: Arc<dyn RegistryClient>,
    source_id: String,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            for service in providers() {
                pull_service(client.as_ref(), &source_id, &service).await;
            }
            tokio::time::sleep(interval).await;
        }
    })
}
