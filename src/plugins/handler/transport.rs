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
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::core::chain::{Chain, Handler, TRANSPORT};
use crate::core::client;
use crate::core::common::{LB_SESSION_ID, STATUS_SERVICE_UNAVAILABLE};
use crate::core::control;
use crate::core::loadbalancer::{self, STRATEGY_SESSION_STICKINESS};
use crate::core::model::error::MeshError;
use crate::core::model::invocation::{Invocation, ProtocolResponse, Response};
use crate::core::session;

/// TransportHandler is the terminal stage: it dispatches the materialized
/// request through the protocol client and synthesizes the response.
#[derive(Debug)]
pub struct TransportHandler;

pub fn new_handler() -> Arc<dyn Handler> {
    Arc::new(TransportHandler)
}

fn namespace_of(inv: &Invocation) -> String {
    inv.metadata
        .get(crate::core::common::SESSION_NAMESPACE_KEY)
        .cloned()
        .unwrap_or_default()
}

// session id the caller presented: cookie first, raw context key second,
// the namespace's known session last
fn request_session_id(inv: &Invocation) -> String {
    let from_cookie = session::session_id_from_cookie_header(&inv.headers);
    if !from_cookie.is_empty() {
        return from_cookie;
    }
    if let Some(raw) = inv.header(LB_SESSION_ID) {
        if !raw.is_empty() {
            return raw.clone();
        }
    }
    session::get_session_id(&namespace_of(inv))
}

// pin (or re-pin) the session to the endpoint that served it
fn save_session(inv: &mut Invocation, resp: &mut ProtocolResponse, timeout_secs: u64) {
    let ttl = Duration::from_secs(timeout_secs);
    let endpoint = inv.endpoint.clone();

    let from_provider = session::session_id_from_set_cookie(&resp.headers);
    if !from_provider.is_empty() {
        session::save(&from_provider, &endpoint, ttl);
        inv.set_header(LB_SESSION_ID, from_provider);
        return;
    }

    let presented = request_session_id(inv);
    if !presented.is_empty() && session::get(&presented).is_some() {
        session::set_session_cookie(&mut resp.headers, &presented);
        session::save(&presented, &endpoint, ttl);
        inv.set_header(LB_SESSION_ID, presented);
        return;
    }

    let fresh = session::generate_session_id();
    session::set_session_cookie(&mut resp.headers, &fresh);
    session::save(&fresh, &endpoint, ttl);
    inv.set_header(LB_SESSION_ID, fresh);
}

// repeated upstream errors evict the pin so the next pick reassigns
fn count_session_failure(inv: &Invocation, threshold: u32) {
    let session_id = request_session_id(inv);
    if session_id.is_empty() {
        return;
    }
    session::increase_successive_failure_count(&session_id);
    if threshold > 0 && session::get_successive_failure_count(&session_id) >= threshold {
        tracing::info!(
            "[mesh][transport] session [{}] evicted after successive failures",
            session_id
        );
        session::delete(&session_id);
    }
}

#[async_trait]
impl Handler for TransportHandler {
    fn name(&self) -> &str {
        TRANSPORT
    }

    async fn handle(&self, _chain: &Chain, inv: &mut Invocation) -> Response {
        let protocol_client = match client::get_client(inv) {
            Ok(c) => c,
            Err(err) => return Response::error(err, STATUS_SERVICE_UNAVAILABLE),
        };

        let timeout = protocol_client.get_options().timeout;
        let cancel = inv.cancel.clone();
        let start = Instant::now();
        let result = {
            let call = protocol_client.do_request(inv, &inv.args);
            tokio::select! {
                // cancellation wins over a simultaneously completed call
                biased;
                _ = cancel.cancelled() => Err(MeshError::canceled()),
                r = async {
                    if timeout.is_zero() {
                        call.await
                    } else {
                        match tokio::time::timeout(timeout, call).await {
                            Ok(r) => r,
                            Err(_) => Err(MeshError::deadline_exceeded()),
                        }
                    }
                } => r,
            }
        };

        let lb_config = control::get_load_balancing(inv);
        let sticky = inv.strategy == STRATEGY_SESSION_STICKINESS;

        match result {
            Ok(mut resp) => {
                loadbalancer::set_latency(
                    start.elapsed(),
                    &inv.endpoint,
                    &inv.micro_service_name,
                    &inv.route_tags.label(),
                    &inv.protocol,
                );
                if sticky {
                    save_session(inv, &mut resp, lb_config.session_timeout_in_seconds);
                }

                let status = resp.status;
                let failure_key = format!("http_{}", status);
                if *protocol_client
                    .get_options()
                    .failure
                    .get(&failure_key)
                    .unwrap_or(&false)
                {
                    inv.reply = Some(resp.clone());
                    return Response {
                        status,
                        result: Some(resp),
                        err: Some(MeshError::http_status(status)),
                    };
                }
                inv.reply = Some(resp.clone());
                Response::ok(resp)
            }
            Err(err) => {
                if sticky {
                    count_session_failure(inv, lb_config.successive_failed_times);
                }
                tracing::error!(
                    "[mesh][transport] request to [{}] failed: {}",
                    inv.endpoint,
                    err
                );
                Response::error(err, STATUS_SERVICE_UNAVAILABLE)
            }
        }
    }
}
