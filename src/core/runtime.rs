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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::core::common::DEFAULT_APP;

static SEQ: AtomicU64 = AtomicU64::new(1);

/// Identity of the local service, stamped into every outgoing invocation
/// and into the reserved source-service header.
#[derive(Debug, Clone, Default)]
pub struct ServiceIdentity {
    pub service_id: String,
    pub service_name: String,
    pub app: String,
}

static IDENTITY: Lazy<RwLock<ServiceIdentity>> = Lazy::new(|| {
    RwLock::new(ServiceIdentity {
        service_id: String::new(),
        service_name: String::new(),
        app: DEFAULT_APP.to_string(),
    })
});

pub fn init_identity(identity: ServiceIdentity) {
    let mut id = IDENTITY.write().unwrap();
    *id = identity;
    tracing::info!(
        "[mesh][runtime] local identity set: service={} id={} app={}",
        id.service_name,
        id.service_id,
        id.app
    );
}

pub fn service_id() -> String {
    IDENTITY.read().unwrap().service_id.clone()
}

pub fn service_name() -> String {
    IDENTITY.read().unwrap().service_name.clone()
}

pub fn app() -> String {
    IDENTITY.read().unwrap().app.clone()
}

/// acquire_client_id derives a process identity the registry can tell
/// apart: `{HOSTNAME}_{pid}_{seq}` when the hostname is known, a UUID
/// otherwise.
pub fn acquire_client_id() -> String {
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return format!("{}_{}_{}", hostname, std::process::id(), seq);
        }
    }
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ids_are_distinct() {
        let a = acquire_client_id();
        let b = acquire_client_id();
        assert_ne!(a, b);
    }
}
