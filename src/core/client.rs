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
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;

use crate::core::common::Direction;
use crate::core::config;
use crate::core::control;
use crate::core::model::error::{ErrorCode, MeshError};
use crate::core::model::invocation::{Invocation, ProtocolRequest, ProtocolResponse};

/// default max idle connections per host
pub const DEFAULT_POOL_SIZE: usize = 512;

/// ClientOptions carries everything a protocol client needs at
/// construction, and the subset that can be reloaded live.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub service: String,
    pub endpoint: String,
    pub pool_size: usize,
    pub timeout: Duration,
    pub ssl_enabled: bool,
    /// http statuses that must surface as errors, e.g. "http_500"
    pub failure: HashMap<String, bool>,
}

/// ProtocolClient executes one request against one endpoint. Concrete
/// transports live outside the runtime; tests install scripted ones.
#[async_trait]
pub trait ProtocolClient: Send + Sync + std::fmt::Debug {
    async fn do_request(
        &self,
        inv: &Invocation,
        req: &ProtocolRequest,
    ) -> Result<ProtocolResponse, MeshError>;

    fn reload_configs(&self, options: ClientOptions);

    fn get_options(&self) -> ClientOptions;

    async fn close(&self) -> Result<(), MeshError>;
}

pub type ClientCtor = fn(ClientOptions) -> Result<Arc<dyn ProtocolClient>, MeshError>;

static CLIENT_FUNC_MAP: Lazy<RwLock<HashMap<String, ClientCtor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static CLIENTS: Lazy<RwLock<HashMap<String, Arc<dyn ProtocolClient>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// install_client_plugin registers the factory of one protocol.
pub fn install_client_plugin(protocol: &str, ctor: ClientCtor) {
    CLIENT_FUNC_MAP
        .write()
        .unwrap()
        .insert(protocol.to_string(), ctor);
}

fn get_client_ctor(protocol: &str) -> Result<ClientCtor, MeshError> {
    let ctors = CLIENT_FUNC_MAP.read().unwrap();
    ctors.get(protocol).copied().ok_or_else(|| {
        MeshError::new(
            ErrorCode::ClientNotFound,
            format!("do not support [{}] client", protocol),
        )
    })
}

/// get_failure_map parses the per-protocol list of statuses that convert
/// into errors, `cse.transport.failure.<protocol>` = "http_500,http_502".
pub fn get_failure_map(protocol: &str) -> HashMap<String, bool> {
    let mut failure = HashMap::new();
    if let Some(store) = config::global_store() {
        let raw = config::get_string(
            store.as_ref(),
            &format!("cse.transport.failure.{}", protocol),
            "",
        );
        for item in raw.split(',') {
            let item = item.trim();
            if !item.is_empty() {
                failure.insert(item.to_string(), true);
            }
        }
    }
    failure
}

pub fn get_max_idle_connections(protocol: &str) -> usize {
    match config::global_store() {
        Some(s) => config::get_int(
            s.as_ref(),
            &format!("cse.transport.maxIdleConnections.{}", protocol),
            DEFAULT_POOL_SIZE as i64,
        ) as usize,
        None => DEFAULT_POOL_SIZE,
    }
}

fn generate_key(protocol: &str, service: &str, endpoint: &str) -> String {
    format!("{}{}{}", protocol, service, endpoint)
}

fn create_client(
    protocol: &str,
    service: &str,
    endpoint: &str,
    ssl_enabled: bool,
) -> Result<Arc<dyn ProtocolClient>, MeshError> {
    let ctor = get_client_ctor(protocol)?;
    ctor(ClientOptions {
        service: service.to_string(),
        endpoint: endpoint.to_string(),
        pool_size: get_max_idle_connections(protocol),
        timeout: Duration::from_millis(control::get_timeout_ms(Direction::Consumer, service)),
        ssl_enabled,
        failure: get_failure_map(protocol),
    })
}

/// get_client returns the cached client of the invocation's
/// `(protocol, service, endpoint)`, constructing it lazily.
pub fn get_client(inv: &Invocation) -> Result<Arc<dyn ProtocolClient>, MeshError> {
    let key = generate_key(&inv.protocol, &inv.micro_service_name, &inv.endpoint);
    {
        let clients = CLIENTS.read().unwrap();
        if let Some(c) = clients.get(&key) {
            return Ok(c.clone());
        }
    }
    tracing::info!(
        "[mesh][client] create client for {}:{}:{}",
        inv.protocol,
        inv.micro_service_name,
        inv.endpoint
    );
    let client = create_client(
        &inv.protocol,
        &inv.micro_service_name,
        &inv.endpoint,
        inv.ssl_enable,
    )?;
    let mut clients = CLIENTS.write().unwrap();
    Ok(clients.entry(key).or_insert(client).clone())
}

/// close shuts one endpoint's client down and forgets it; instance
/// refreshes call this for departed endpoints.
pub async fn close(protocol: &str, service: &str, endpoint: &str) -> Result<(), MeshError> {
    let key = generate_key(protocol, service, endpoint);
    let client = {
        let clients = CLIENTS.read().unwrap();
        clients.get(&key).cloned()
    };
    let client = client.ok_or_else(|| {
        MeshError::new(ErrorCode::ClientNotFound, "client not exists".to_string())
    })?;
    client.close().await?;
    CLIENTS.write().unwrap().remove(&key);
    Ok(())
}

/// reload_client_timeouts pushes a fresh per-service timeout into every
/// live client without tearing connections down.
pub fn reload_client_timeouts(timeout_of: impl Fn(&str) -> u64) {
    let clients = CLIENTS.read().unwrap();
    for client in clients.values() {
        let mut options = client.get_options();
        options.timeout = Duration::from_millis(timeout_of(&options.service));
        client.reload_configs(options);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct FakeClient {
        options: Mutex<ClientOptions>,
    }

    #[async_trait]
    impl ProtocolClient for FakeClient {
        async fn do_request(
            &self,
            _inv: &Invocation,
            _req: &ProtocolRequest,
        ) -> Result<ProtocolResponse, MeshError> {
            Ok(ProtocolResponse::default())
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

    fn fake_ctor(options: ClientOptions) -> Result<Arc<dyn ProtocolClient>, MeshError> {
        Ok(Arc::new(FakeClient {
            options: Mutex::new(options),
        }))
    }

    #[tokio::test]
    async fn test_client_cache_and_close() {
        install_client_plugin("client-test-proto", fake_ctor);
        let mut inv = Invocation::new("client-test-svc");
        inv.protocol = "client-test-proto".to_string();
        inv.endpoint = "10.0.0.1:80".to_string();

        let a = get_client(&inv).unwrap();
        let b = get_client(&inv).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        close("client-test-proto", "client-test-svc", "10.0.0.1:80")
            .await
            .unwrap();
        let err = close("client-test-proto", "client-test-svc", "10.0.0.1:80")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ClientNotFound);
    }

    #[tokio::test]
    async fn test_unknown_protocol_is_error() {
        let mut inv = Invocation::new("client-test-svc");
        inv.protocol = "client-test-unknown".to_string();
        inv.endpoint = "10.0.0.1:80".to_string();
        assert_eq!(
            get_client(&inv).unwrap_err().code(),
            ErrorCode::ClientNotFound
        );
    }

    #[tokio::test]
    async fn test_timeout_reload_keeps_client_alive() {
        install_client_plugin("client-test-reload", fake_ctor);
        let mut inv = Invocation::new("client-test-reload-svc");
        inv.protocol = "client-test-reload".to_string();
        inv.endpoint = "10.0.0.2:80".to_string();
        let client = get_client(&inv).unwrap();

        reload_client_timeouts(|_| 1234);
        let same = get_client(&inv).unwrap();
        assert!(Arc::ptr_eq(&client, &same));
        assert_eq!(same.get_options().timeout, Duration::from_millis(1234));
    }
}
