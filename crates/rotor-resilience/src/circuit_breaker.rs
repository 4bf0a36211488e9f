//! Closed/open/half-open failure gate.
//!
//! Closed counts consecutive failures and opens at `failure_threshold`.
//! Open rejects with [`RotorError::CircuitOpen`] until `cooldown` has passed
//! since the last failure, then admits a single half-open trial at a time.
//! `success_threshold` consecutive trial successes close the circuit; any
//! trial failure reopens it.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use rotor_config::CircuitBreakerConfig;
use rotor_core::RotorError;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Point-in-time view for health reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure_at: Option<Instant>,
    trial_in_flight: bool,
    times_opened: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

/// Admission ticket for one call. A trial that is dropped without being
/// settled (the caller's future was cancelled) frees the half-open slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            cooldown: config.cooldown(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                last_failure_at: None,
                trial_in_flight: false,
                times_opened: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            times_opened: inner.times_opened,
        }
    }

    /// Force the circuit closed and clear counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.trial_in_flight = false;
    }

    /// Run `task` through the breaker. Every `Err` from the task counts as a
    /// failure.
    pub async fn execute<F, Fut, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.admit()?;
        let result = task().await;
        permit.settled = true;
        match &result {
            Ok(_) => self.on_success(permit.trial),
            Err(err) => self.on_failure(permit.trial, err),
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // A poisoned breaker still holds consistent counters.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn admit(&self) -> Result<Permit<'_>, RotorError> {
        let mut inner = self.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = inner
                    .last_failure_at
                    .is_none_or(|at| at.elapsed() >= self.cooldown);
                if !cooled {
                    return Err(self.open_error());
                }
                info!(breaker = %self.name, "Circuit half-open, admitting trial");
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.open_error());
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Ok(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
            if inner.state != CircuitState::HalfOpen {
                return;
            }
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.success_threshold {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.half_open_successes = 0;
                info!(breaker = %self.name, "Circuit closed");
            }
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, trial: bool, err: &anyhow::Error) {
        let mut inner = self.lock();
        inner.last_failure_at = Some(Instant::now());
        if trial {
            inner.trial_in_flight = false;
            inner.state = CircuitState::Open;
            inner.half_open_successes = 0;
            inner.times_opened += 1;
            warn!(breaker = %self.name, error = %err, "Half-open trial failed, circuit reopened");
            return;
        }
        if inner.state != CircuitState::Closed {
            return;
        }
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.failure_threshold {
            inner.state = CircuitState::Open;
            inner.times_opened += 1;
            warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                error = %err,
                "Circuit opened"
            );
        }
    }

    fn open_error(&self) -> RotorError {
        RotorError::CircuitOpen {
            name: self.name.clone(),
        }
    }
}
