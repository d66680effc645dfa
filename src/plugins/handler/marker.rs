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

use crate::core::chain::{Chain, Handler, TRAFFIC_MARKER};
use crate::core::marker;
use crate::core::model::invocation::{Invocation, Response};

/// TrafficMarkerHandler stamps the invocation with the first matching
/// traffic mark so later stages can govern by name.
#[derive(Debug)]
pub struct TrafficMarkerHandler;

pub fn new_handler() -> Arc<dyn Handler> {
    Arc::new(TrafficMarkerHandler)
}

#[async_trait]
impl Handler for TrafficMarkerHandler {
    fn name(&self) -> &str {
        TRAFFIC_MARKER
    }

    async fn handle(&self, chain: &Chain, inv: &mut Invocation) -> Response {
        marker::mark(inv);
        chain.next(inv).await
    }
}
