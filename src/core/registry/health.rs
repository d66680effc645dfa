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
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::model::error::{ErrorCode, MeshError};
use crate::core::model::naming::MicroServiceInstance;

const TIMEOUT_TO_PENDING: Duration = Duration::from_secs(1);
const TIMEOUT_TO_PACKAGE: Duration = Duration::from_millis(100);
const CHAN_CAPACITY: usize = 1000;

/// WrapInstance carries an instance whose registry state became unknown
/// during a refresh.
#[derive(Debug, Clone)]
pub struct WrapInstance {
    pub app_id: String,
    pub service_name: String,
    pub version: String,
    pub instance: Arc<MicroServiceInstance>,
}

impl fmt::Display for WrapInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.service_name, self.version, self.app_id, self.instance.instance_id
        )
    }
}

/// InstanceProber receives coalesced batches of unknown instances and
/// probes them; how it reaches the instance is its own business. The
/// returned subset is the instances that failed the probe, and those are
/// evicted from the instance cache.
#[async_trait]
pub trait InstanceProber: Send + Sync {
    async fn probe(&self, batch: Vec<WrapInstance>) -> Vec<WrapInstance>;
}

/// HealthChecker queues unknown instances and drains them on a 100 ms
/// cadence so one slow probe round does not stall refreshes. A refresh
/// keeps an enqueued instance; the prober's verdict demotes it later.
pub struct HealthChecker {
    pending_tx: mpsc::Sender<WrapInstance>,
}

impl HealthChecker {
    pub fn run(prober: Arc<dyn InstanceProber>) -> Self {
        let (pending_tx, pending_rx) = mpsc::channel(CHAN_CAPACITY);
        tokio::spawn(Self::wait(pending_rx, prober));
        HealthChecker { pending_tx }
    }

    /// add enqueues an instance for probing. Backpressure beyond one
    /// second is an error; the caller drops the instance instead.
    pub async fn add(&self, instance: WrapInstance) -> Result<(), MeshError> {
        match tokio::time::timeout(TIMEOUT_TO_PENDING, self.pending_tx.send(instance)).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(MeshError::new(
                ErrorCode::HealthCheckBusy,
                "health checker is too busy".to_string(),
            )),
        }
    }

    // coalesce pending entries into per-key batches, flush every 100 ms,
    // and drop whatever the prober reported unhealthy from the cache
    async fn wait(mut pending_rx: mpsc::Receiver<WrapInstance>, prober: Arc<dyn InstanceProber>) {
        let mut pack: HashMap<String, WrapInstance> = HashMap::new();
        loop {
            match tokio::time::timeout(TIMEOUT_TO_PACKAGE, pending_rx.recv()).await {
                Ok(Some(instance)) => {
                    pack.insert(instance.to_string(), instance);
                }
                Ok(None) => return,
                Err(_) => {
                    if !pack.is_empty() {
                        let batch: Vec<WrapInstance> = pack.drain().map(|(_, v)| v).collect();
                        let unhealthy = prober.probe(batch).await;
                        if !unhealthy.is_empty() {
                            crate::core::registry::evict_unhealthy(&unhealthy).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::naming::Endpoint;
    use std::sync::Mutex;

    struct Collecting {
        seen: Mutex<Vec<String>>,
        notify: tokio::sync::Notify,
    }

    #[async_trait]
    impl InstanceProber for Collecting {
        async fn probe(&self, batch: Vec<WrapInstance>) -> Vec<WrapInstance> {
            let mut seen = self.seen.lock().unwrap();
            for ins in batch {
                seen.push(ins.to_string());
            }
            self.notify.notify_one();
            Vec::new()
        }
    }

    fn wrap(id: &str) -> WrapInstance {
        let mut eps = HashMap::new();
        eps.insert("rest".to_string(), Endpoint::new("10.0.0.1:80"));
        WrapInstance {
            app_id: "default".to_string(),
            service_name: "shop".to_string(),
            version: "1.0.0".to_string(),
            instance: Arc::new(MicroServiceInstance::new(id, "shop", "1.0.0", eps)),
        }
    }

    #[tokio::test]
    async fn test_batches_are_coalesced_by_key() {
        let prober = Arc::new(Collecting {
            seen: Mutex::new(Vec::new()),
            notify: tokio::sync::Notify::new(),
        });
        let checker = HealthChecker::run(prober.clone());

        checker.add(wrap("i-1")).await.unwrap();
        checker.add(wrap("i-1")).await.unwrap();
        checker.add(wrap("i-2")).await.unwrap();

        prober.notify.notified().await;
        let seen = prober.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
    }
}
