// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-endpoint circuit breaker.
//!
//! ```text
//!            failure_threshold consecutive failures
//!   CLOSED ─────────────────────────────────────────▶ OPEN
//!     ▲                                                │ reset_timeout elapsed,
//!     │ trial success                                  │ next call
//!     │                                                ▼
//!     └──────────────────────────────────────────── HALF_OPEN
//!                 trial failure: back to OPEN ◀───────┘
//! ```
//!
//! Every call takes a [`BreakerPermit`] under one lock. The permit remembers
//! the generation it was issued in; each state transition bumps the
//! generation, so an outcome reported after the breaker has already moved on
//! is ignored instead of counted twice. The lock is never held across an
//! `.await`.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// A limited number of trial calls pass through.
    HalfOpen,
}

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial.
    pub reset_timeout: Duration,
    /// Concurrent trial calls allowed while half-open.
    pub half_open_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_trials: 1,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    /// Endpoint name.
    pub name: String,
    /// Current state.
    pub state: BreakerState,
    /// Consecutive failures counted in the current generation.
    pub failure_count: u32,
    /// When the breaker last opened.
    pub opened_at: Option<DateTime<Utc>>,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without running it.
    #[error("circuit breaker '{name}' is open")]
    Open {
        /// Endpoint name.
        name: String,
    },
    /// The call ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Whether the call was rejected by the breaker.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    generation: u64,
    trials_in_flight: u32,
}

/// Circuit breaker guarding one remote endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                opened_at_wall: None,
                generation: 0,
                trials_in_flight: 0,
            }),
        }
    }

    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state without triggering the OPEN to HALF_OPEN transition.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Whether a call made now would be rejected.
    pub fn is_open(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => !self.reset_elapsed(&inner),
            BreakerState::HalfOpen => inner.trials_in_flight >= self.config.half_open_trials,
        }
    }

    fn reset_elapsed(&self, inner: &Inner) -> bool {
        inner
            .opened_at
            .is_none_or(|at| at.elapsed() >= self.config.reset_timeout)
    }

    /// Ask for permission to make one call.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, BreakerError<std::convert::Infallible>> {
        let mut inner = self.lock();

        if inner.state == BreakerState::Open && self.reset_elapsed(&inner) {
            inner.state = BreakerState::HalfOpen;
            inner.generation += 1;
            inner.trials_in_flight = 0;
            info!(breaker = %self.name, "Circuit breaker half-open");
        }

        match inner.state {
            BreakerState::Closed => Ok(BreakerPermit {
                breaker: self,
                generation: inner.generation,
                trial: false,
                settled: false,
            }),
            BreakerState::HalfOpen if inner.trials_in_flight < self.config.half_open_trials => {
                inner.trials_in_flight += 1;
                Ok(BreakerPermit {
                    breaker: self,
                    generation: inner.generation,
                    trial: true,
                    settled: false,
                })
            }
            _ => Err(BreakerError::Open {
                name: self.name.clone(),
            }),
        }
    }

    /// Run `call` through the breaker.
    ///
    /// `counts_as_failure` decides whether an error reflects endpoint health.
    /// Errors it rejects are recorded as successes but still returned.
    pub async fn call<T, E, Fut>(
        &self,
        call: Fut,
        counts_as_failure: impl FnOnce(&E) -> bool,
    ) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(|_| BreakerError::Open {
            name: self.name.clone(),
        })?;

        match call.await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                if counts_as_failure(&err) {
                    permit.failure();
                } else {
                    permit.success();
                }
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.generation += 1;
        inner.trials_in_flight = 0;
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Snapshot for status reporting.
    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            opened_at: inner.opened_at_wall,
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.opened_at_wall = Some(Utc::now());
        inner.generation += 1;
        inner.trials_in_flight = 0;
    }

    fn record(&self, generation: u64, trial: bool, success: bool) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        if trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }

        match (inner.state, success) {
            (BreakerState::Closed, true) => inner.failure_count = 0,
            (BreakerState::Closed, false) => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.open(&mut inner);
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        reset_timeout_secs = self.config.reset_timeout.as_secs(),
                        "Circuit breaker opened"
                    );
                }
            }
            (BreakerState::HalfOpen, true) => {
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.opened_at_wall = None;
                inner.generation += 1;
                inner.trials_in_flight = 0;
                info!(breaker = %self.name, "Circuit breaker closed after trial");
            }
            (BreakerState::HalfOpen, false) => {
                inner.failure_count += 1;
                self.open(&mut inner);
                warn!(breaker = %self.name, "Circuit breaker trial failed, reopened");
            }
            (BreakerState::Open, _) => {}
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }
}

/// Permission to make one call. Report the outcome with
/// [`success`](Self::success) or [`failure`](Self::failure); dropping an
/// unreported trial permit frees its half-open slot without changing state.
#[derive(Debug)]
#[must_use = "report the call outcome on the permit"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this permit is a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The call succeeded (or failed in a way that proves the endpoint is up).
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record(self.generation, self.trial, true);
    }

    /// The call failed in a way that counts against endpoint health.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record(self.generation, self.trial, false);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}
