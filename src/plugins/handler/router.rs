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
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::chain::{Chain, Handler, ROUTER};
use crate::core::common::{BUILD_IN_TAG_APP, STATUS_SERVICE_UNAVAILABLE};
use crate::core::model::invocation::{Invocation, Response};
use crate::core::model::naming::SourceInfo;
use crate::core::router;
use crate::core::runtime;

/// RouterHandler matches the configured route rules and narrows instance
/// selection with the picked tag set.
#[derive(Debug)]
pub struct RouterHandler;

pub fn new_handler() -> Arc<dyn Handler> {
    Arc::new(RouterHandler)
}

#[async_trait]
impl Handler for RouterHandler {
    fn name(&self) -> &str {
        ROUTER
    }

    async fn handle(&self, chain: &Chain, inv: &mut Invocation) -> Response {
        if !inv.route_tags.is_empty() {
            return chain.next(inv).await;
        }

        let mut tags: HashMap<String, String> = inv.metadata.clone();
        tags.insert(BUILD_IN_TAG_APP.to_string(), runtime::app());
        let source = SourceInfo {
            name: inv.source_micro_service.clone(),
            tags,
        };
        let headers = inv.headers.clone();

        if let Err(err) = router::route(&headers, &source, inv) {
            return Response::error(err, STATUS_SERVICE_UNAVAILABLE);
        }
        chain.next(inv).await
    }
}
