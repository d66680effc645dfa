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
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use regex::Regex;

/// Change kinds delivered to configuration listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct ConfigEvent {
    pub event_type: EventType,
    pub key: String,
    pub value: Option<String>,
}

pub trait ConfigListener: Send + Sync {
    fn on_event(&self, event: &ConfigEvent);
}

/// ConfigStore is the configuration collaborator: a snapshot of the
/// current keyspace plus change subscription by key regex. The runtime
/// never persists configuration itself.
pub trait ConfigStore: Send + Sync {
    fn get_all(&self) -> HashMap<String, String>;

    fn get(&self, key: &str) -> Option<String>;

    /// register a listener for keys matching any of the given regex
    /// patterns.
    fn register_listener(&self, listener: Arc<dyn ConfigListener>, patterns: &[&str]);
}

pub fn get_string(store: &dyn ConfigStore, key: &str, default: &str) -> String {
    store.get(key).unwrap_or_else(|| default.to_string())
}

pub fn get_int(store: &dyn ConfigStore, key: &str, default: i64) -> i64 {
    match store.get(key) {
        Some(v) => v.trim().parse::<i64>().unwrap_or(default),
        None => default,
    }
}

pub fn get_bool(store: &dyn ConfigStore, key: &str, default: bool) -> bool {
    match store.get(key) {
        Some(v) => v.trim().parse::<bool>().unwrap_or(default),
        None => default,
    }
}

/// first_int resolves the first configured key of a fallback chain,
/// most specific first.
pub fn first_int(store: &dyn ConfigStore, keys: &[String], default: i64) -> i64 {
    for key in keys {
        if let Some(v) = store.get(key) {
            if let Ok(parsed) = v.trim().parse::<i64>() {
                return parsed;
            }
        }
    }
    default
}

// the store the runtime was bootstrapped with; modules that read plain
// keys outside the panel (transport, fault) resolve it here
static GLOBAL_STORE: Lazy<RwLock<Option<Arc<dyn ConfigStore>>>> = Lazy::new(|| RwLock::new(None));

pub fn bind_global_store(store: Arc<dyn ConfigStore>) {
    *GLOBAL_STORE.write().unwrap() = Some(store);
}

pub fn global_store() -> Option<Arc<dyn ConfigStore>> {
    GLOBAL_STORE.read().unwrap().clone()
}

struct PatternListener {
    patterns: Vec<Regex>,
    listener: Arc<dyn ConfigListener>,
}

/// MemoryConfigStore backs tests and local bootstrap; `set`/`delete`
/// dispatch events synchronously to matching listeners.
#[derive(Default)]
pub struct MemoryConfigStore {
    data: RwLock<HashMap<String, String>>,
    listeners: RwLock<Vec<PatternListener>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        MemoryConfigStore::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let created = {
            let mut data = self.data.write().unwrap();
            data.insert(key.clone(), value.clone()).is_none()
        };
        let event = ConfigEvent {
            event_type: if created {
                EventType::Create
            } else {
                EventType::Update
            },
            key,
            value: Some(value),
        };
        self.dispatch(&event);
    }

    pub fn delete(&self, key: &str) {
        let existed = {
            let mut data = self.data.write().unwrap();
            data.remove(key).is_some()
        };
        if !existed {
            return;
        }
        self.dispatch(&ConfigEvent {
            event_type: EventType::Delete,
            key: key.to_string(),
            value: None,
        });
    }

    fn dispatch(&self, event: &ConfigEvent) {
        let listeners = self.listeners.read().unwrap();
        for entry in listeners.iter() {
            if entry.patterns.iter().any(|p| p.is_match(&event.key)) {
                entry.listener.on_event(event);
            }
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_all(&self) -> HashMap<String, String> {
        self.data.read().unwrap().clone()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.data.read().unwrap().get(key).cloned()
    }

    fn register_listener(&self, listener: Arc<dyn ConfigListener>, patterns: &[&str]) {
        let mut compiled = Vec::with_capacity(patterns.len());
        for p in patterns {
            match Regex::new(p) {
                Ok(r) => compiled.push(r),
                Err(e) => {
                    tracing::warn!("[mesh][config] bad listener pattern {}: {}", p, e);
                }
            }
        }
        self.listeners.write().unwrap().push(PatternListener {
            patterns: compiled,
            listener,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        events: Mutex<Vec<(EventType, String)>>,
    }

    impl ConfigListener for Recorder {
        fn on_event(&self, event: &ConfigEvent) {
            self.events
                .lock()
                .unwrap()
                .push((event.event_type, event.key.clone()));
        }
    }

    #[test]
    fn test_listener_pattern_dispatch() {
        let store = MemoryConfigStore::new();
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        store.register_listener(recorder.clone(), &[r"^cse\.loadbalance\."]);

        store.set("cse.loadbalance.shop.strategy.name", "Random");
        store.set("servicecomb.match.foo", "matches: []");
        store.set("cse.loadbalance.shop.strategy.name", "RoundRobin");
        store.delete("cse.loadbalance.shop.strategy.name");

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].0, EventType::Create);
        assert_eq!(events[1].0, EventType::Update);
        assert_eq!(events[2].0, EventType::Delete);
    }

    #[test]
    fn test_typed_getters() {
        let store = MemoryConfigStore::new();
        store.set("a.number", "42");
        store.set("a.flag", "true");
        assert_eq!(get_int(&store, "a.number", 0), 42);
        assert_eq!(get_int(&store, "a.missing", 7), 7);
        assert!(get_bool(&store, "a.flag", false));
        assert_eq!(
            first_int(
                &store,
                &["a.missing".to_string(), "a.number".to_string()],
                0
            ),
            42
        );
    }
}
