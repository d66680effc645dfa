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

//! End-to-end scenarios driving the full consumer pipeline against a
//! scripted in-process transport.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Once, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;

use polaris_mesh::core::chain;
use polaris_mesh::core::client::{self, ClientOptions, ProtocolClient};
use polaris_mesh::core::common::Direction;
use polaris_mesh::core::config::{self, MemoryConfigStore};
use polaris_mesh::core::control;
use polaris_mesh::core::loadbalancer::{
    self, STRATEGY_SESSION_STICKINESS,
};
use polaris_mesh::core::model::error::{ErrorCode, MeshError};
use polaris_mesh::core::model::invocation::{Invocation, ProtocolRequest, ProtocolResponse};
use polaris_mesh::core::model::naming::{Endpoint, MicroServiceInstance};
use polaris_mesh::core::registry;
use polaris_mesh::core::router;
use polaris_mesh::core::session;
use polaris_mesh::invoker::rest::{RestInvoker, RestRequest};
use polaris_mesh::invoker::InvokerOptions;
use polaris_mesh::plugins;

// call outcome scripted per target service, fed the 1-based call number
type Script = Arc<dyn Fn(u32) -> Result<ProtocolResponse, MeshError> + Send + Sync>;

static SCRIPTS: Lazy<RwLock<HashMap<String, Script>>> = Lazy::new(|| RwLock::new(HashMap::new()));

// endpoints hit per service, in call order
static RECORDS: Lazy<RwLock<HashMap<String, Vec<String>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static STORE: Lazy<Arc<MemoryConfigStore>> = Lazy::new(|| Arc::new(MemoryConfigStore::new()));

#[derive(Debug)]
struct ScriptedTransport {
    options: Mutex<ClientOptions>,
}

#[async_trait]
impl ProtocolClient for ScriptedTransport {
    async fn do_request(
        &self,
        inv: &Invocation,
        _req: &ProtocolRequest,
    ) -> Result<ProtocolResponse, MeshError> {
        let calls = {
            let mut records = RECORDS.write().unwrap();
            let list = records.entry(inv.micro_service_name.clone()).or_default();
            list.push(inv.endpoint.clone());
            list.len() as u32
        };
        let script = SCRIPTS
            .read()
            .unwrap()
            .get(&inv.micro_service_name)
            .cloned();
        match script {
            Some(f) => f(calls),
            None => Ok(ok_response()),
        }
    }

    fn reload_configs(&self, options: ClientOptions) {
        *self.options.lock().unwrap() = options;
    }

    fn get_options(&self) -> ClientOptions {
        self.options.lock().unwrap().clone()
    }

    async fn close(&self) -> Result<(), MeshError> {
        Ok(())
    }
}

fn ok_response() -> ProtocolResponse {
    ProtocolResponse {
        status: 200,
        headers: HashMap::new(),
        body: b"ok".to_vec(),
    }
}

fn scripted_ctor(options: ClientOptions) -> Result<Arc<dyn ProtocolClient>, MeshError> {
    Ok(Arc::new(ScriptedTransport {
        options: Mutex::new(options),
    }))
}

fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
        plugins::handler::install_defaults();
        loadbalancer::enable();
        router::ensure_default_router();
        client::install_client_plugin("rest", scripted_ctor);
        config::bind_global_store(STORE.clone());
        control::init_panel(STORE.clone());
    });
}

fn seed_instances(service: &str, addrs: &[&str]) {
    let instances: Vec<Arc<MicroServiceInstance>> = addrs
        .iter()
        .enumerate()
        .map(|(i, addr)| {
            let mut eps = HashMap::new();
            eps.insert("rest".to_string(), Endpoint::new(*addr));
            Arc::new(MicroServiceInstance::new(
                format!("{}-{}", service, i),
                service,
                "1.0.0",
                eps,
            ))
        })
        .collect();
    registry::instance_index().set(service, instances);
}

fn script(service: &str, f: impl Fn(u32) -> Result<ProtocolResponse, MeshError> + Send + Sync + 'static) {
    SCRIPTS
        .write()
        .unwrap()
        .insert(service.to_string(), Arc::new(f));
}

fn make_chain(service: &str, handlers: &str) -> String {
    let chain_name = format!("{}-chain", service);
    let mut chains = HashMap::new();
    chains.insert(chain_name.clone(), handlers.to_string());
    chain::create_chains(Direction::Consumer, &chains).unwrap();
    chain_name
}

fn transport_calls(service: &str) -> usize {
    RECORDS
        .read()
        .unwrap()
        .get(service)
        .map(|v| v.len())
        .unwrap_or(0)
}

fn endpoint_counts(service: &str) -> HashMap<String, u32> {
    let records = RECORDS.read().unwrap();
    let mut counts = HashMap::new();
    if let Some(list) = records.get(service) {
        for ep in list {
            *counts.entry(ep.clone()).or_insert(0) += 1;
        }
    }
    counts
}

fn invoker_for(service: &str, handlers: &str) -> RestInvoker {
    let chain_name = make_chain(service, handlers);
    RestInvoker::new(InvokerOptions::default().with_chain_name(chain_name))
}

#[tokio::test]
async fn test_round_robin_distribution() {
    setup();
    let service = "pl-rr";
    seed_instances(service, &["10.30.0.1:80", "10.30.0.2:80", "10.30.0.3:80"]);
    let invoker = invoker_for(service, "loadbalance,transport");

    for _ in 0..600 {
        invoker
            .context_do(RestRequest {
                method: "GET".to_string(),
                url: format!("http://{}/ping", service),
                ..RestRequest::default()
            })
            .await
            .unwrap();
    }

    let counts = endpoint_counts(service);
    assert_eq!(counts.len(), 3);
    for (ep, count) in counts {
        assert!((199..=201).contains(&count), "{} served {}", ep, count);
    }
}

#[tokio::test]
async fn test_sticky_session_failover() {
    setup();
    let service = "pl-sticky";
    let a = "10.31.0.1:80";
    let b = "10.31.0.2:80";
    seed_instances(service, &[a, b]);

    let chain_name = make_chain(service, "loadbalance,transport");
    let invoker = RestInvoker::new(
        InvokerOptions::default()
            .with_chain_name(chain_name)
            .with_strategy(STRATEGY_SESSION_STICKINESS)
            .with_metadata(
                polaris_mesh::core::common::SESSION_NAMESPACE_KEY,
                "pl-sticky-ns",
            ),
    );
    let call = |_: u32| RestRequest {
        method: "GET".to_string(),
        url: format!("http://{}/cart", service),
        ..RestRequest::default()
    };

    invoker.context_do(call(1)).await.unwrap();
    let first = RECORDS.read().unwrap()[service].last().cloned().unwrap();
    invoker.context_do(call(2)).await.unwrap();
    let second = RECORDS.read().unwrap()[service].last().cloned().unwrap();
    assert_eq!(first, second, "session not pinned");

    let session_id = session::get_session_id("pl-sticky-ns");
    assert!(!session_id.is_empty());
    assert_eq!(session::get(&session_id).unwrap(), first);

    // the pinned instance disappears with the next refresh
    let survivor = if first == a { b } else { a };
    let survivor_idx = if survivor == a { 0 } else { 1 };
    let mut eps = HashMap::new();
    eps.insert("rest".to_string(), Endpoint::new(survivor));
    let up = Arc::new(MicroServiceInstance::new(
        format!("{}-{}", service, survivor_idx),
        service,
        "1.0.0",
        eps,
    ));
    let mut downs = HashSet::new();
    downs.insert(format!("{}-{}", service, if survivor == a { 1 } else { 0 }));
    registry::refresh_cache(service, vec![up], &downs).await;

    invoker.context_do(call(3)).await.unwrap();
    let third = RECORDS.read().unwrap()[service].last().cloned().unwrap();
    assert_eq!(third, survivor);
    // the session now points at the survivor for good
    assert_eq!(session::get(&session_id).unwrap(), survivor);
    invoker.context_do(call(4)).await.unwrap();
    let fourth = RECORDS.read().unwrap()[service].last().cloned().unwrap();
    assert_eq!(fourth, survivor);
}

#[tokio::test]
async fn test_circuit_trip_and_probe() {
    setup();
    let service = "pl-circuit";
    seed_instances(service, &["10.32.0.1:80"]);
    STORE.set(
        format!("cse.circuitBreaker.Consumer.{}.requestVolumeThreshold", service),
        "20",
    );
    STORE.set(
        format!(
            "cse.circuitBreaker.Consumer.{}.errorThresholdPercentage",
            service
        ),
        "50",
    );
    STORE.set(
        format!(
            "cse.circuitBreaker.Consumer.{}.sleepWindowInMilliseconds",
            service
        ),
        "1000",
    );
    // 12 of the first 20 calls fail
    script(service, |call| {
        if call <= 12 {
            Err(MeshError::new(
                ErrorCode::TransportError,
                "connection refused".to_string(),
            ))
        } else {
            Ok(ok_response())
        }
    });

    let invoker = invoker_for(service, "bizkeeper-consumer,loadbalance,transport");
    let request = || RestRequest {
        method: "GET".to_string(),
        url: format!("http://{}/orders", service),
        ..RestRequest::default()
    };

    for _ in 0..20 {
        let _ = invoker.context_do(request()).await;
    }
    assert_eq!(transport_calls(service), 20);

    // call 21 short-circuits without reaching the transport
    let err = invoker.context_do(request()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CircuitBreakerOpen);
    assert_eq!(transport_calls(service), 20);

    // after the sleep window one probe goes through and closes the breaker
    tokio::time::sleep(Duration::from_millis(1100)).await;
    invoker.context_do(request()).await.unwrap();
    assert_eq!(transport_calls(service), 21);
    invoker.context_do(request()).await.unwrap();
    assert_eq!(transport_calls(service), 22);
}

#[tokio::test]
async fn test_rate_limit_rejects_over_burst() {
    setup();
    let service = "pl-rate";
    seed_instances(service, &["10.33.0.1:80"]);
    STORE.set(
        format!("cse.flowcontrol.Consumer.qps.limit.{}", service),
        "10",
    );

    let invoker = invoker_for(service, "ratelimiter-consumer,loadbalance,transport");
    let mut accepted = 0;
    let mut rejected = 0;
    for _ in 0..12 {
        match invoker
            .context_do(RestRequest {
                method: "GET".to_string(),
                url: format!("http://{}/search", service),
                ..RestRequest::default()
            })
            .await
        {
            Ok(_) => accepted += 1,
            Err(err) => {
                assert_eq!(err.code(), ErrorCode::RequestLimit);
                assert_eq!(err.message(), "too many requests");
                rejected += 1;
            }
        }
    }
    // burst is rate/5 = 2
    assert_eq!(accepted, 2);
    assert_eq!(rejected, 10);
}

#[tokio::test]
async fn test_latency_aware_pick() {
    setup();
    let service = "pl-latency";
    let a = "10.34.0.1:80";
    let b = "10.34.0.2:80";
    let c = "10.34.0.3:80";
    seed_instances(service, &[a, b, c]);
    STORE.set(
        format!("cse.loadbalance.{}.strategy.name", service),
        "WeightedResponse",
    );

    // observed means: a=50ms, b=10ms, c=200ms
    for (addr, ms) in [(a, 50u64), (b, 10), (c, 200)] {
        loadbalancer::set_latency(Duration::from_millis(ms), addr, service, "", "rest");
    }
    loadbalancer::calculate_avg_latency();
    loadbalancer::sort_latency();

    let invoker = invoker_for(service, "loadbalance,transport");
    for _ in 0..1000 {
        invoker
            .context_do(RestRequest {
                method: "GET".to_string(),
                url: format!("http://{}/quote", service),
                ..RestRequest::default()
            })
            .await
            .unwrap();
    }

    let counts = endpoint_counts(service);
    assert!(counts[b] >= 650, "fastest endpoint picked {} times", counts[b]);
    assert!(
        counts.get(c).copied().unwrap_or(0) <= 120,
        "slowest endpoint picked {} times",
        counts[c]
    );
}

#[tokio::test]
async fn test_retry_budget_exhaustion() {
    setup();
    let service = "pl-retry";
    seed_instances(service, &["10.35.0.1:80", "10.35.0.2:80"]);
    STORE.set(format!("cse.loadbalance.{}.retryEnabled", service), "true");
    STORE.set(format!("cse.loadbalance.{}.retryOnSame", service), "2");
    STORE.set(format!("cse.loadbalance.{}.retryOnNext", service), "1");
    script(service, |call| {
        Err(MeshError::new(
            ErrorCode::TransportError,
            format!("transient failure #{}", call),
        ))
    });

    let invoker = invoker_for(service, "loadbalance,transport");
    let err = invoker
        .context_do(RestRequest {
            method: "POST".to_string(),
            url: format!("http://{}/pay", service),
            body: b"amount=1".to_vec(),
            ..RestRequest::default()
        })
        .await
        .unwrap_err();

    // (1 + retryOnSame) + retryOnNext * (1 + retryOnSame) attempts
    assert_eq!(transport_calls(service), 6);
    // the last transport error is the one surfaced
    assert_eq!(err.code(), ErrorCode::TransportError);
    assert_eq!(err.message(), "transient failure #6");
}

#[tokio::test]
async fn test_canceled_invocation_is_not_retried() {
    setup();
    let service = "pl-cancel";
    seed_instances(service, &["10.36.0.1:80"]);
    STORE.set(format!("cse.loadbalance.{}.retryEnabled", service), "true");
    STORE.set(format!("cse.loadbalance.{}.retryOnSame", service), "3");

    let cancel = tokio_util::sync::CancellationToken::new();
    cancel.cancel();
    let chain_name = make_chain(service, "loadbalance,transport");
    let invoker = RestInvoker::new(
        InvokerOptions::default()
            .with_chain_name(chain_name)
            .with_cancel(cancel),
    );

    let err = invoker
        .context_do(RestRequest {
            method: "GET".to_string(),
            url: format!("http://{}/slow", service),
            ..RestRequest::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Canceled);
    // canceled before dispatch completed, and never replayed
    assert!(transport_calls(service) <= 1);
}
