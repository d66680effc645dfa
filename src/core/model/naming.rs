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

use crate::core::common::{BUILD_IN_TAG_APP, BUILD_IN_TAG_VERSION};

pub const STATUS_UP: &str = "UP";
pub const STATUS_DOWN: &str = "DOWN";

/// Endpoint is one reachable address of an instance under a specific
/// protocol-port key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub ssl_enabled: bool,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Endpoint {
            address: address.into(),
            ssl_enabled: false,
        }
    }

    pub fn with_ssl(address: impl Into<String>) -> Self {
        Endpoint {
            address: address.into(),
            ssl_enabled: true,
        }
    }

    pub fn gen_endpoint(&self) -> String {
        self.address.clone()
    }
}

/// MicroServiceInstance is immutable within one cache generation; a refresh
/// replaces a service's list wholesale.
#[derive(Debug, Clone)]
pub struct MicroServiceInstance {
    pub instance_id: String,
    pub service_name: String,
    pub host_name: String,
    pub app_id: String,
    pub version: String,
    pub status: String,
    /// protocol-port key -> endpoint, see `gen_proto_endpoint`
    pub endpoints: HashMap<String, Endpoint>,
    pub default_protocol: String,
    /// tag set used for route-tag narrowing, carries version/app as well
    pub tags: HashMap<String, String>,
}

impl MicroServiceInstance {
    pub fn new(
        instance_id: impl Into<String>,
        service_name: impl Into<String>,
        version: impl Into<String>,
        endpoints: HashMap<String, Endpoint>,
    ) -> Self {
        let version = version.into();
        let mut tags = HashMap::new();
        tags.insert(BUILD_IN_TAG_VERSION.to_string(), version.clone());
        let default_protocol = endpoints.keys().next().cloned().unwrap_or_default();
        MicroServiceInstance {
            instance_id: instance_id.into(),
            service_name: service_name.into(),
            host_name: String::new(),
            app_id: String::new(),
            version,
            status: STATUS_UP.to_string(),
            endpoints,
            default_protocol,
            tags,
        }
    }

    pub fn with_app(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self.tags
            .insert(BUILD_IN_TAG_APP.to_string(), self.app_id.clone());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// has reports whether the instance's tag set is a superset of the query.
    pub fn has(&self, tags: &HashMap<String, String>) -> bool {
        tags.iter()
            .all(|(k, v)| self.tags.get(k).map(|t| t == v).unwrap_or(false))
    }
}

/// Tags narrow instance selection; the router handler stamps them from the
/// picked route tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags {
    pub kv: HashMap<String, String>,
}

impl Tags {
    pub fn new(kv: HashMap<String, String>) -> Self {
        Tags { kv }
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }

    /// label renders the canonical `k:v|k:v` form, keys sorted so that equal
    /// tag sets always produce equal labels.
    pub fn label(&self) -> String {
        let mut keys: Vec<&String> = self.kv.keys().collect();
        keys.sort();
        keys.iter()
            .map(|k| format!("{}:{}", k, self.kv[k.as_str()]))
            .collect::<Vec<String>>()
            .join("|")
    }
}

/// SourceInfo describes the caller during route-rule matching.
#[derive(Debug, Clone, Default)]
pub struct SourceInfo {
    pub name: String,
    pub tags: HashMap<String, String>,
}
