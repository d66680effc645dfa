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

use async_trait::async_trait;

use crate::core::chain::{Chain, Handler, FAULT_INJECT};
use crate::core::common::{Direction, STATUS_BAD_REQUEST};
use crate::core::fault;
use crate::core::model::error::{ErrorCode, MeshError};
use crate::core::model::invocation::{Invocation, Response};

/// FaultHandler injects configured delays and aborts ahead of the load
/// balancer; the delay is transparent, the abort short-circuits with the
/// configured status.
#[derive(Debug)]
pub struct FaultHandler;

pub fn new_handler() -> Arc<dyn Handler> {
    Arc::new(FaultHandler)
}

#[async_trait]
impl Handler for FaultHandler {
    fn name(&self) -> &str {
        FAULT_INJECT
    }

    async fn handle(&self, chain: &Chain, inv: &mut Invocation) -> Response {
        let rule = fault::get_fault_config(Direction::Consumer, &inv.protocol, &inv.micro_service_name);

        let inject = match fault::injector(&inv.protocol) {
            Some(f) => f,
            None => {
                let msg = format!(
                    "fault injection doesn't support protocol [{}]",
                    inv.protocol
                );
                tracing::error!("[mesh][fault] {}", msg);
                return Response::error(
                    MeshError::new(ErrorCode::NotSupport, msg),
                    STATUS_BAD_REQUEST,
                );
            }
        };

        match inject(&rule, inv) {
            Ok(delay) => {
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                chain.next(inv).await
            }
            Err(err) => {
                let status = if err.code() == ErrorCode::FaultAbort {
                    rule.abort_http_status
                } else {
                    STATUS_BAD_REQUEST
                };
                Response::error(err, status)
            }
        }
    }
}
