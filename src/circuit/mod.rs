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

pub mod fallback;
pub mod metrics;
pub mod pool;
pub mod rolling;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use tokio::sync::OwnedSemaphorePermit;

use crate::circuit::metrics::{
    MetricExchange, EVENT_REJECTED, EVENT_SHORT_CIRCUIT, EVENT_SUCCESS,
};
use crate::circuit::pool::ExecutorPool;
use crate::core::model::circuitbreaker::CommandConfig;
use crate::core::model::error::MeshError;

static SETTINGS: Lazy<RwLock<HashMap<String, CommandConfig>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static CIRCUIT_BREAKERS: Lazy<RwLock<HashMap<String, Arc<CircuitBreaker>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// configure_command installs the settings one command runs under. The
/// handler calls this before every admission so config reloads take
/// effect without recreating breakers.
pub fn configure_command(name: &str, config: CommandConfig) {
    SETTINGS.write().unwrap().insert(name.to_string(), config);
}

pub fn get_settings(name: &str) -> CommandConfig {
    SETTINGS
        .read()
        .unwrap()
        .get(name)
        .cloned()
        .unwrap_or_default()
}

/// get_circuit returns the breaker of a command, creating it on first
/// use. The ticket pool is sized from the settings at creation time.
pub fn get_circuit(name: &str) -> Arc<CircuitBreaker> {
    {
        let breakers = CIRCUIT_BREAKERS.read().unwrap();
        if let Some(cb) = breakers.get(name) {
            return cb.clone();
        }
    }
    let mut breakers = CIRCUIT_BREAKERS.write().unwrap();
    breakers
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(CircuitBreaker::new(name)))
        .clone()
}

/// flush drops every breaker and its accumulated state.
pub fn flush() {
    CIRCUIT_BREAKERS.write().unwrap().clear();
}

/// Reasons an execution is refused before the guarded run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// breaker Open, sleep window not elapsed
    ShortCircuit,
    /// ticket pool exhausted
    MaxConcurrency,
}

/// ExecutionGuard is a held ticket plus the run timer; exactly one report
/// call consumes it, and dropping it returns the ticket in every path.
pub struct ExecutionGuard {
    breaker: Arc<CircuitBreaker>,
    start: Instant,
    _ticket: OwnedSemaphorePermit,
}

impl ExecutionGuard {
    /// report_success feeds telemetry and closes the breaker when this was
    /// the half-open probe.
    pub fn report_success(self, fallback_event: Option<&str>) {
        self.report(EVENT_SUCCESS, fallback_event);
    }

    pub fn report_failure(self, fallback_event: Option<&str>) {
        self.report(metrics::EVENT_FAILURE, fallback_event);
    }

    fn report(self, event: &str, fallback_event: Option<&str>) {
        let run_duration = self.start.elapsed();
        if event == EVENT_SUCCESS && self.breaker.is_open() {
            // the half-open probe came back healthy
            self.breaker.set_close();
        }
        let mut events = vec![event];
        if let Some(f) = fallback_event {
            events.push(f);
        }
        self.breaker
            .metrics
            .increment(&events, run_duration, run_duration);
    }
}

/// CircuitBreaker is the per-command state machine: Closed counts
/// outcomes, Open short-circuits until the sleep window elapsed, Half-Open
/// admits a single probe whose success resets everything.
pub struct CircuitBreaker {
    pub name: String,
    open: AtomicBool,
    force_open: AtomicBool,
    opened_or_last_tested: AtomicI64,
    pub metrics: MetricExchange,
    pool: ExecutorPool,
}

impl CircuitBreaker {
    fn new(name: &str) -> Self {
        let settings = get_settings(name);
        CircuitBreaker {
            name: name.to_string(),
            open: AtomicBool::new(false),
            force_open: AtomicBool::new(false),
            opened_or_last_tested: AtomicI64::new(0),
            metrics: MetricExchange::new(name),
            pool: ExecutorPool::new(name, settings.max_concurrent_requests),
        }
    }

    /// is_open also evaluates the trip condition, so the first admission
    /// past the volume threshold observes the freshly tripped state.
    pub fn is_open(&self) -> bool {
        let settings = get_settings(&self.name);
        if settings.force_open || self.force_open.load(Ordering::Relaxed) {
            return true;
        }
        if settings.force_close {
            return false;
        }
        if self.open.load(Ordering::Relaxed) {
            return true;
        }
        let now = metrics::now_unix();
        if (self.metrics.requests(now) as u64) < settings.request_volume_threshold {
            return false;
        }
        if !self
            .metrics
            .is_healthy(now, settings.error_percent_threshold)
        {
            // too many failures, trip the breaker
            self.set_open();
            return true;
        }
        false
    }

    fn allow_single_test(&self) -> bool {
        let settings = get_settings(&self.name);
        let now = now_millis();
        let opened_or_last_tested = self.opened_or_last_tested.load(Ordering::SeqCst);
        if self.open.load(Ordering::Relaxed)
            && now > opened_or_last_tested + settings.sleep_window_ms as i64
        {
            let swapped = self
                .opened_or_last_tested
                .compare_exchange(opened_or_last_tested, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            if swapped {
                tracing::info!(
                    "[mesh][circuit] breaker [{}] allowing one probe request",
                    self.name
                );
            }
            return swapped;
        }
        false
    }

    pub fn allow_request(&self) -> bool {
        !self.is_open() || self.allow_single_test()
    }

    fn set_open(&self) {
        if self
            .open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tracing::warn!("[mesh][circuit] opening circuit [{}]", self.name);
        self.opened_or_last_tested.store(now_millis(), Ordering::SeqCst);
    }

    fn set_close(&self) {
        if self
            .open
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tracing::info!("[mesh][circuit] closing circuit [{}]", self.name);
        self.metrics.reset();
    }

    pub fn force_open(&self, force: bool) {
        self.force_open.store(force, Ordering::Relaxed);
    }

    /// try_acquire admits one execution: state check first, then a
    /// non-blocking ticket take.
    pub fn try_acquire(self: &Arc<Self>) -> Result<ExecutionGuard, RejectReason> {
        if !self.allow_request() {
            self.metrics.increment(
                &[EVENT_SHORT_CIRCUIT],
                Duration::ZERO,
                Duration::ZERO,
            );
            return Err(RejectReason::ShortCircuit);
        }
        match self.pool.try_acquire() {
            Some(ticket) => Ok(ExecutionGuard {
                breaker: self.clone(),
                start: Instant::now(),
                _ticket: ticket,
            }),
            None => {
                self.metrics
                    .increment(&[EVENT_REJECTED], Duration::ZERO, Duration::ZERO);
                Err(RejectReason::MaxConcurrency)
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.pool.active_count()
    }
}

impl RejectReason {
    pub fn into_error(self, command: &str) -> MeshError {
        match self {
            RejectReason::ShortCircuit => MeshError::circuit_open(command),
            RejectReason::MaxConcurrency => MeshError::new(
                crate::core::model::error::ErrorCode::PoolRejected,
                format!("max concurrency reached: {}", command),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(volume: u64, error_percent: u32, sleep_ms: u64) -> CommandConfig {
        CommandConfig {
            request_volume_threshold: volume,
            error_percent_threshold: error_percent,
            sleep_window_ms: sleep_ms,
            max_concurrent_requests: 10,
            ..CommandConfig::default()
        }
    }

    #[tokio::test]
    async fn test_trip_after_volume_and_error_threshold() {
        let name = "circuit-test-trip";
        configure_command(name, config(20, 50, 60000));
        let cb = get_circuit(name);

        for i in 0..20 {
            let guard = cb.try_acquire().unwrap();
            if i < 12 {
                guard.report_failure(None);
            } else {
                guard.report_success(None);
            }
        }
        // call 21 must short-circuit without running
        assert!(matches!(
            cb.try_acquire(),
            Err(RejectReason::ShortCircuit)
        ));
        assert_eq!(cb.metrics.short_circuits(metrics::now_unix()), 1.0);
        flush();
    }

    #[tokio::test]
    async fn test_below_volume_threshold_never_trips() {
        let name = "circuit-test-volume";
        configure_command(name, config(20, 50, 60000));
        let cb = get_circuit(name);
        for _ in 0..10 {
            let guard = cb.try_acquire().unwrap();
            guard.report_failure(None);
        }
        assert!(cb.try_acquire().is_ok());
        flush();
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_breaker() {
        let name = "circuit-test-probe";
        configure_command(name, config(5, 50, 50));
        let cb = get_circuit(name);
        for _ in 0..5 {
            let guard = cb.try_acquire().unwrap();
            guard.report_failure(None);
        }
        assert!(matches!(cb.try_acquire(), Err(RejectReason::ShortCircuit)));

        tokio::time::sleep(Duration::from_millis(70)).await;
        // exactly one probe is admitted after the sleep window
        let probe = cb.try_acquire().expect("probe should be admitted");
        assert!(matches!(cb.try_acquire(), Err(RejectReason::ShortCircuit)));
        probe.report_success(None);

        assert!(!cb.is_open());
        assert!(cb.try_acquire().is_ok());
        flush();
    }

    #[tokio::test]
    async fn test_concurrency_tickets() {
        let name = "circuit-test-tickets";
        configure_command(
            name,
            CommandConfig {
                max_concurrent_requests: 2,
                ..CommandConfig::default()
            },
        );
        let cb = get_circuit(name);
        let g1 = cb.try_acquire().unwrap();
        let _g2 = cb.try_acquire().unwrap();
        assert!(matches!(
            cb.try_acquire(),
            Err(RejectReason::MaxConcurrency)
        ));
        g1.report_success(None);
        assert!(cb.try_acquire().is_ok());
        flush();
    }

    #[tokio::test]
    async fn test_force_open_and_force_close() {
        let name = "circuit-test-force";
        configure_command(
            name,
            CommandConfig {
                force_open: true,
                ..CommandConfig::default()
            },
        );
        let cb = get_circuit(name);
        assert!(matches!(cb.try_acquire(), Err(RejectReason::ShortCircuit)));

        configure_command(
            name,
            CommandConfig {
                force_close: true,
                request_volume_threshold: 1,
                error_percent_threshold: 1,
                ..CommandConfig::default()
            },
        );
        let guard = cb.try_acquire().unwrap();
        guard.report_failure(None);
        // force-close disables the trip
        assert!(cb.try_acquire().is_ok());
        flush();
    }
}
