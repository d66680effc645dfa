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

use crate::core::common::{MD_REST_METHOD, PROTOCOL_REST};
use crate::core::model::error::{ErrorCode, MeshError};
use crate::core::model::invocation::{Invocation, ProtocolRequest, ProtocolResponse};

use super::{invoke, response_to_result, wrap_invocation_with_options, InvokerOptions};

/// RestRequest addresses a logical service, not a host: the URL authority
/// is `service[:port-name]` and load balancing fills the real endpoint.
#[derive(Debug, Clone, Default)]
pub struct RestRequest {
    pub method: String,
    /// scheme://service[:port-name]/path
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// RestInvoker is the consumer-side entry point for HTTP-shaped calls.
/// One invoker per target microservice; it is cheap and thread safe.
#[derive(Default)]
pub struct RestInvoker {
    options: InvokerOptions,
}

fn parse_service_and_port(authority: &str) -> (String, String) {
    match authority.split_once(':') {
        Some((service, port)) => (service.to_string(), port.to_string()),
        None => (authority.to_string(), String::new()),
    }
}

fn parse_url(url: &str) -> Result<(String, String, String), MeshError> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| {
            MeshError::new(
                ErrorCode::InvalidConfig,
                format!("scheme invalid: {}, only support http(s)://", url),
            )
        })?;
    let (authority, path) = match rest.split_once('/') {
        Some((a, p)) => (a, format!("/{}", p)),
        None => (rest, "/".to_string()),
    };
    let (service, port) = parse_service_and_port(authority);
    Ok((service, port, path))
}

impl RestInvoker {
    pub fn new(options: InvokerOptions) -> Self {
        RestInvoker { options }
    }

    /// context_do sends one request through the governance pipeline and
    /// returns the protocol response, or the typed error of whichever
    /// stage rejected the call.
    pub async fn context_do(&self, req: RestRequest) -> Result<ProtocolResponse, MeshError> {
        let (service, port, path) = parse_url(&req.url)?;

        let mut options = self.options.clone();
        options.protocol = PROTOCOL_REST.to_string();
        if options.port.is_empty() {
            options.port = port;
        }

        let mut inv = Invocation::new(service);
        wrap_invocation_with_options(&mut inv, &options);
        inv.schema_id = if inv.port.is_empty() {
            PROTOCOL_REST.to_string()
        } else {
            inv.port.clone()
        };
        inv.operation_id = path.clone();
        inv.headers = req.headers.clone();
        inv.args = ProtocolRequest {
            method: req.method.clone(),
            api_path: path,
            headers: req.headers,
            body: req.body,
        };
        inv.set_metadata(MD_REST_METHOD, req.method);

        let resp = invoke(&mut inv, &options).await;
        let resp = response_to_result(resp)?;
        Ok(resp.result.unwrap_or_default())
    }
}
