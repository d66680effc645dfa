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

use crate::core::common::{gen_proto_endpoint, SESSION_NAMESPACE_KEY};
use crate::core::loadbalancer::Strategy;
use crate::core::model::error::MeshError;
use crate::core::model::invocation::Invocation;
use crate::core::model::naming::MicroServiceInstance;
use crate::core::session;

use super::roundrobin::pick_index;

/// SessionStickinessStrategy pins a session to the endpoint it last used.
/// When the pinned address left the candidate set the pick falls through
/// to round robin and the transport re-pins on the next response.
pub struct SessionStickinessStrategy {
    instances: Vec<Arc<MicroServiceInstance>>,
    key: String,
    session_id: String,
    protocol_key: String,
}

pub fn new_strategy() -> Box<dyn Strategy> {
    Box::new(SessionStickinessStrategy {
        instances: Vec::new(),
        key: String::new(),
        session_id: String::new(),
        protocol_key: String::new(),
    })
}

fn namespace_of(inv: &Invocation) -> String {
    inv.metadata
        .get(SESSION_NAMESPACE_KEY)
        .cloned()
        .unwrap_or_default()
}

impl SessionStickinessStrategy {
    // the session-mapped address is first compared under the invocation's
    // protocol-port key; an instance serving the same address under any
    // other protocol still counts
    fn find_pinned(&self, addr: &str) -> Option<Arc<MicroServiceInstance>> {
        for instance in &self.instances {
            if let Some(ep) = instance.endpoints.get(&self.protocol_key) {
                if ep.address == addr {
                    return Some(instance.clone());
                }
            }
        }
        for instance in &self.instances {
            if instance.endpoints.values().any(|ep| ep.address == addr) {
                return Some(instance.clone());
            }
        }
        None
    }

    fn round_robin(&self) -> Result<Arc<MicroServiceInstance>, MeshError> {
        if self.instances.is_empty() {
            return Err(MeshError::no_available_instance("none available instance"));
        }
        let i = pick_index(&self.key);
        Ok(self.instances[i % self.instances.len()].clone())
    }
}

impl Strategy for SessionStickinessStrategy {
    fn receive_data(
        &mut self,
        inv: &Invocation,
        instances: Vec<Arc<MicroServiceInstance>>,
        service_key: &str,
    ) {
        self.instances = instances;
        self.key = service_key.to_string();
        self.session_id = session::get_session_id(&namespace_of(inv));
        self.protocol_key = gen_proto_endpoint(&inv.protocol, &inv.port);
    }

    fn pick(&mut self) -> Result<Arc<MicroServiceInstance>, MeshError> {
        if self.session_id.is_empty() {
            return self.round_robin();
        }
        match session::get(&self.session_id) {
            Some(addr) => {
                if self.instances.is_empty() {
                    return Err(MeshError::no_available_instance("none available instance"));
                }
                match self.find_pinned(&addr) {
                    Some(instance) => Ok(instance),
                    // the pinned endpoint went away; a fresh pick re-pins
                    None => self.round_robin(),
                }
            }
            None => self.round_robin(),
        }
    }
}
