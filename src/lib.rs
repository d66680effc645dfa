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

//! polaris-mesh is the client-side service-mesh runtime of a microservice
//! framework: every outgoing call travels an ordered handler chain that
//! applies traffic marking, routing, rate limiting, circuit breaking and
//! fault injection, then resolves a live endpoint through the discovery
//! cache and a load-balancing strategy, and finally executes the request
//! with retry and session affinity.
//!
//! The same machinery drives the provider side; the two directions differ
//! only in which stages their chains install.

pub mod circuit;
pub mod core;
pub mod governance;
pub mod invoker;
pub mod plugins;
pub mod resilience;
