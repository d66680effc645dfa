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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success = 0,
    InvalidConfig = 1001,
    PluginError = 1002,
    InvalidRule = 1003,
    HandlerNotFound = 1004,
    ClientNotFound = 1005,
    NoAvailableInstance = 1006,
    RequestLimit = 1007,
    CircuitBreakerOpen = 1008,
    PoolRejected = 1009,
    FaultAbort = 1010,
    HealthCheckBusy = 1011,
    Canceled = 2001,
    DeadlineExceeded = 2002,
    TransportError = 2003,
    HttpStatus = 2004,
    InternalError = 3001,
    NotSupport = 3002,
}

impl Default for ErrorCode {
    fn default() -> Self {
        Self::InternalError
    }
}

/// MeshError is the single error type flowing through handler chains and
/// plugin boundaries. Pipeline stages surface it through `Response.err`.
#[derive(Debug, Clone)]
pub struct MeshError {
    err_code: ErrorCode,
    err_msg: String,
}

impl Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.err_code, self.err_msg)
    }
}

impl std::error::Error for MeshError {}

impl MeshError {
    pub fn new(code: ErrorCode, err_msg: String) -> Self {
        MeshError {
            err_msg,
            err_code: code,
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.err_code
    }

    pub fn message(&self) -> &str {
        &self.err_msg
    }

    pub fn no_available_instance(msg: impl Into<String>) -> Self {
        MeshError::new(ErrorCode::NoAvailableInstance, msg.into())
    }

    pub fn canceled() -> Self {
        MeshError::new(ErrorCode::Canceled, "invocation canceled".to_string())
    }

    pub fn deadline_exceeded() -> Self {
        MeshError::new(ErrorCode::DeadlineExceeded, "request timed out".to_string())
    }

    pub fn too_many_requests() -> Self {
        MeshError::new(ErrorCode::RequestLimit, "too many requests".to_string())
    }

    pub fn circuit_open(command: &str) -> Self {
        MeshError::new(
            ErrorCode::CircuitBreakerOpen,
            format!("circuit open: {}", command),
        )
    }

    pub fn http_status(status: u16) -> Self {
        MeshError::new(ErrorCode::HttpStatus, format!("http-status-{}", status))
    }

    /// Errors that the load balancer must never replay on another attempt.
    pub fn is_permanent_for_retry(&self) -> bool {
        matches!(
            self.err_code,
            ErrorCode::Canceled | ErrorCode::DeadlineExceeded
        )
    }
}
