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

use std::fmt;
use std::fmt::Display;

/// Direction tells which half of the mesh a chain or a governance rule
/// belongs to. Consumer is the outbound side, provider the inbound one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Consumer,
    Provider,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Consumer => "Consumer",
            Direction::Provider => "Provider",
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub const DEFAULT_CHAIN_NAME: &str = "default";
pub const DEFAULT_APP: &str = "default";

// reserved wire keys
pub const HEADER_SOURCE_NAME: &str = "x-mesh-src-service";
pub const HEADER_MARK: &str = "x-mesh-mark";
pub const LB_SESSION_ID: &str = "mesh-session-id";

// built-in instance tags
pub const BUILD_IN_TAG_VERSION: &str = "version";
pub const BUILD_IN_TAG_APP: &str = "app";
pub const LATEST_VERSION: &str = "latest";

// invocation metadata keys
pub const MD_MARK: &str = "mark";
pub const MD_REST_METHOD: &str = "method";
pub const SESSION_NAMESPACE_KEY: &str = "session-namespace";
pub const SESSION_NAMESPACE_DEFAULT: &str = "default";

pub const PROTOCOL_REST: &str = "rest";

// http statuses the runtime reports itself
pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
pub const STATUS_INTERNAL_SERVER_ERROR: u16 = 500;
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

/// Protocol-port key used to look an `Endpoint` up inside an instance's
/// endpoint map: `rest` serves the unnamed port, `rest-admin` a named one.
pub fn gen_proto_endpoint(protocol: &str, port: &str) -> String {
    if port.is_empty() {
        protocol.to_string()
    } else {
        format!("{}-{}", protocol, port)
    }
}
