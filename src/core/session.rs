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
use std::sync::RwLock;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use once_cell::sync::Lazy;
use rand::RngCore;

use crate::core::common::{LB_SESSION_ID, SESSION_NAMESPACE_DEFAULT};

struct ExpiringEntry {
    value: String,
    deadline: Option<Instant>,
}

/// ExpiringCache is a TTL map with opportunistic cleanup: expired entries
/// are purged whenever the cache is touched.
#[derive(Default)]
struct ExpiringCache {
    entries: RwLock<HashMap<String, ExpiringEntry>>,
}

impl ExpiringCache {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(key)?;
        if let Some(deadline) = entry.deadline {
            if Instant::now() >= deadline {
                return None;
            }
        }
        Some(entry.value.clone())
    }

    // ttl zero means no expiry; expiry is absolute from the last write
    fn set(&self, key: &str, value: &str, ttl: Duration) {
        let deadline = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            key.to_string(),
            ExpiringEntry {
                value: value.to_string(),
                deadline,
            },
        );
    }

    fn delete(&self, key: &str) {
        self.entries.write().unwrap().remove(key);
    }

    fn clear_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, e| e.deadline.map(|d| now < d).unwrap_or(true));
    }
}

// session id -> pinned endpoint address
static SESSION_CACHE: Lazy<ExpiringCache> = Lazy::new(ExpiringCache::default);

// namespace -> session id, written after a successful sticky call
static STICKINESS_CACHE: Lazy<ExpiringCache> = Lazy::new(ExpiringCache::default);

// session id -> successive upstream failures
static SUCCESSIVE_FAILURES: Lazy<RwLock<HashMap<String, u32>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// generate_session_id returns a URL-safe token of 32 random bytes.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

pub fn get(session_id: &str) -> Option<String> {
    SESSION_CACHE.clear_expired();
    SESSION_CACHE.get(session_id)
}

/// save pins a session id to an endpoint; every save restarts the TTL.
pub fn save(session_id: &str, endpoint: &str, ttl: Duration) {
    SESSION_CACHE.set(session_id, endpoint, ttl);
}

pub fn delete(session_id: &str) {
    SESSION_CACHE.delete(session_id);
    delete_successive_failure_count(session_id);
}

fn stickiness_cache_key(namespace: &str) -> String {
    let namespace = if namespace.is_empty() {
        SESSION_NAMESPACE_DEFAULT
    } else {
        namespace
    };
    format!("{}|{}", LB_SESSION_ID, namespace)
}

/// add_session_stickiness_to_cache links a namespace to its session id so
/// later invocations of the same caller reuse the pin.
pub fn add_session_stickiness_to_cache(session_id: &str, namespace: &str) {
    if session_id.is_empty() {
        return;
    }
    let key = stickiness_cache_key(namespace);
    match STICKINESS_CACHE.get(&key) {
        Some(existing) if existing == session_id => {}
        _ => STICKINESS_CACHE.set(&key, session_id, Duration::ZERO),
    }
}

/// get_session_id resolves the namespace's current session id, empty when
/// none is known yet.
pub fn get_session_id(namespace: &str) -> String {
    STICKINESS_CACHE
        .get(&stickiness_cache_key(namespace))
        .unwrap_or_default()
}

pub fn increase_successive_failure_count(session_id: &str) {
    let mut counts = SUCCESSIVE_FAILURES.write().unwrap();
    *counts.entry(session_id.to_string()).or_insert(0) += 1;
}

pub fn get_successive_failure_count(session_id: &str) -> u32 {
    SUCCESSIVE_FAILURES
        .read()
        .unwrap()
        .get(session_id)
        .copied()
        .unwrap_or(0)
}

pub fn delete_successive_failure_count(session_id: &str) {
    SUCCESSIVE_FAILURES.write().unwrap().remove(session_id);
}

/// cookie helpers: for HTTP-shaped invocations the session id travels in a
/// reserved cookie; for everything else the same key rides the context
/// header map.
pub fn session_id_from_cookie_header(headers: &HashMap<String, String>) -> String {
    let cookie = match headers.get("cookie").or_else(|| headers.get("Cookie")) {
        Some(c) => c,
        None => return String::new(),
    };
    for part in cookie.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix(&format!("{}=", LB_SESSION_ID)) {
            return value.to_string();
        }
    }
    String::new()
}

pub fn set_session_cookie(headers: &mut HashMap<String, String>, session_id: &str) {
    headers.insert(
        "Set-Cookie".to_string(),
        format!("{}={}", LB_SESSION_ID, session_id),
    );
}

pub fn session_id_from_set_cookie(headers: &HashMap<String, String>) -> String {
    let cookie = match headers.get("Set-Cookie").or_else(|| headers.get("set-cookie")) {
        Some(c) => c,
        None => return String::new(),
    };
    for part in cookie.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix(&format!("{}=", LB_SESSION_ID)) {
            return value.to_string();
        }
    }
    String::new()
}
