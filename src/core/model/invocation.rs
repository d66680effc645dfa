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

use tokio_util::sync::CancellationToken;

use crate::core::common::{MD_MARK, STATUS_OK};
use crate::core::model::error::MeshError;
use crate::core::model::naming::Tags;
use crate::core::runtime;

/// ProtocolRequest is the materialized request payload. The body is owned
/// bytes so the load balancer can replay it across retry attempts.
#[derive(Debug, Clone, Default)]
pub struct ProtocolRequest {
    pub method: String,
    pub api_path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ProtocolResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Response is what the caller's terminal callback observes. The chain
/// engine never raises; errors travel in `err`.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    pub result: Option<ProtocolResponse>,
    pub err: Option<MeshError>,
}

impl Response {
    pub fn ok(result: ProtocolResponse) -> Self {
        Response {
            status: result.status,
            result: Some(result),
            err: None,
        }
    }

    pub fn ok_empty() -> Self {
        Response {
            status: STATUS_OK,
            result: None,
            err: None,
        }
    }

    pub fn error(err: MeshError, status: u16) -> Self {
        Response {
            status,
            result: None,
            err: Some(err),
        }
    }

    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }
}

/// Invocation is the per-request record every pipeline stage reads and
/// mutates. One request, one invocation; it is discarded on completion.
#[derive(Debug)]
pub struct Invocation {
    /// cursor into the chain; monotonic within one traversal, reset by the
    /// load-balance stage when it replays an attempt
    pub handler_index: usize,
    pub ssl_enable: bool,
    /// target address, decided by load balancing
    pub endpoint: String,
    pub protocol: String,
    /// name of a real service port, empty for the unnamed one
    pub port: String,
    pub source_service_id: String,
    pub source_micro_service: String,
    /// target micro service name
    pub micro_service_name: String,
    pub schema_id: String,
    /// url path of the operation
    pub operation_id: String,
    pub args: ProtocolRequest,
    pub reply: Option<ProtocolResponse>,
    /// protocol headers delivered on the wire
    pub headers: HashMap<String, String>,
    /// local scope data, never serialized
    pub metadata: HashMap<String, String>,
    /// decided in the router handler
    pub route_tags: Tags,
    /// load balancing strategy override
    pub strategy: String,
    /// instance filter names
    pub filters: Vec<String>,
    pub cancel: CancellationToken,
}

impl Invocation {
    pub fn new(micro_service_name: impl Into<String>) -> Self {
        let mut metadata = HashMap::with_capacity(1);
        metadata.insert(MD_MARK.to_string(), "none".to_string());
        Invocation {
            handler_index: 0,
            ssl_enable: false,
            endpoint: String::new(),
            protocol: String::new(),
            port: String::new(),
            source_service_id: runtime::service_id(),
            source_micro_service: runtime::service_name(),
            micro_service_name: micro_service_name.into(),
            schema_id: String::new(),
            operation_id: String::new(),
            args: ProtocolRequest::default(),
            reply: None,
            headers: HashMap::new(),
            metadata,
            route_tags: Tags::default(),
            strategy: String::new(),
            filters: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// get_mark returns the match rule name this request matched, "none"
    /// when unmarked.
    pub fn get_mark(&self) -> String {
        self.metadata
            .get(MD_MARK)
            .cloned()
            .unwrap_or_else(|| "none".to_string())
    }

    /// mark records that this invocation matched a rule, so downstream
    /// governance can target it by name.
    pub fn mark(&mut self, match_rule_name: &str) {
        self.metadata
            .insert(MD_MARK.to_string(), match_rule_name.to_string());
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&String> {
        self.headers.get(name)
    }

    /// service_key identifies this target for strategy-shared state, the
    /// round-robin counters and the latency observatory.
    pub fn service_key(&self) -> String {
        format!("{}|{}", self.micro_service_name, self.route_tags.label())
    }
}
