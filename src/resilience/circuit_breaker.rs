//! Per-service circuit breaker.
//!
//! CLOSED lets every call through and counts consecutive failures. At the
//! threshold it trips to OPEN, which rejects calls until the timeout
//! elapses. The first check after that moves to HALF_OPEN, where one probe
//! call at a time is admitted: enough consecutive successes close the
//! breaker, any failure re-opens it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// A call was rejected by an open breaker.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Circuit breaker for {service} is {state}, retry in {retry_after:?}")]
pub struct CircuitOpen {
    pub service: String,
    pub state: CircuitState,
    pub retry_after: Duration,
}

/// Circuit breaker guarding one downstream service.
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    probe_in_flight: AtomicBool,
    /// Milliseconds since `epoch` at which an open breaker may probe.
    next_retry_ms: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            probe_in_flight: AtomicBool::new(false),
            next_retry_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Consecutive failures recorded while closed.
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Decide whether a call may proceed.
    ///
    /// An admitted call in HALF_OPEN holds the single probe slot until
    /// `record_success` or `record_failure` is called.
    pub fn check_state(&self) -> Result<CircuitState, CircuitOpen> {
        match self.state() {
            CircuitState::Closed => Ok(CircuitState::Closed),
            CircuitState::Open => {
                let now = self.now_ms();
                let next_retry = self.next_retry_ms.load(Ordering::Acquire);
                if now < next_retry {
                    return Err(self.rejection(CircuitState::Open, next_retry - now));
                }
                if self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.success_count.store(0, Ordering::Release);
                    self.probe_in_flight.store(false, Ordering::Release);
                    info!(service = %self.service, "Circuit breaker half-open, probing");
                }
                self.try_probe()
            }
            CircuitState::HalfOpen => self.try_probe(),
        }
    }

    fn try_probe(&self) -> Result<CircuitState, CircuitOpen> {
        if self.state() != CircuitState::HalfOpen {
            // Resolved by a concurrent probe between the two loads.
            return self.check_state();
        }
        match self.probe_in_flight.compare_exchange(
            false,
            true,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(CircuitState::HalfOpen),
            Err(_) => Err(self.rejection(CircuitState::HalfOpen, 0)),
        }
    }

    fn rejection(&self, state: CircuitState, retry_after_ms: u64) -> CircuitOpen {
        CircuitOpen {
            service: self.service.clone(),
            state,
            retry_after: Duration::from_millis(retry_after_ms),
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                self.probe_in_flight.store(false, Ordering::Release);
                if successes >= self.config.success_threshold {
                    self.close();
                } else {
                    debug!(service = %self.service, successes, "Half-open probe succeeded");
                }
            }
            CircuitState::Open => {
                debug!(service = %self.service, "Late success ignored while open");
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.trip(failures);
                }
            }
            CircuitState::HalfOpen => {
                self.trip(self.failure_count());
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, failures: u32) {
        let next_retry = self.now_ms() + self.config.timeout.as_millis() as u64;
        self.next_retry_ms.store(next_retry, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.probe_in_flight.store(false, Ordering::Release);
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        warn!(
            service = %self.service,
            failures,
            timeout_secs = self.config.timeout.as_secs(),
            "Circuit breaker opened"
        );
    }

    fn close(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.probe_in_flight.store(false, Ordering::Release);
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        info!(service = %self.service, "Circuit breaker closed");
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
}

/// Lazily created breakers, one per downstream service.
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for `service`.
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        if let Some(breaker) = breakers.get(service) {
            return Arc::clone(breaker);
        }
        let breaker = Arc::new(CircuitBreaker::new(service, self.config.clone()));
        breakers.insert(service.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .lock()
            .values()
            .map(|b| BreakerSnapshot {
                service: b.service().to_string(),
                state: b.state(),
                failure_count: b.failure_count(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }
}
