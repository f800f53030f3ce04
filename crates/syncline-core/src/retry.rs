use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{BreakerConfig, RetryConfig, RetryStrategy};
use crate::error::SyncError;
use crate::time_utils::now_iso;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn label(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Pollable breaker snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub state: String,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub last_failure: Option<String>,
}

/// Per-dependency circuit breaker.
///
/// Closed passes everything; Open rejects everything until the recovery
/// timeout elapses; HalfOpen admits a bounded number of probe calls and
/// closes again only after that many consecutive successes.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure: Option<(Instant, String)>,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(config.recovery_timeout_secs),
            half_open_max_calls: config.half_open_max_calls.max(1),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            last_failure: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Admission check; mutates state on the Open → HalfOpen transition and
    /// consumes one probe slot while HalfOpen.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = self
                    .last_failure
                    .as_ref()
                    .is_some_and(|(at, _)| at.elapsed() >= self.recovery_timeout);
                if recovered {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_calls = 1;
                    self.success_count = 0;
                    debug!("circuit breaker open -> half_open");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.half_open_max_calls {
                    self.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.success_count += 1;
            if self.success_count >= self.half_open_max_calls {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.success_count = 0;
                debug!("circuit breaker half_open -> closed");
            }
        } else {
            self.failure_count = 0;
        }
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some((Instant::now(), now_iso()));
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                warn!("circuit breaker half_open -> open");
            }
            CircuitState::Closed if self.failure_count >= self.failure_threshold => {
                self.state = CircuitState::Open;
                warn!(
                    failures = self.failure_count,
                    "circuit breaker closed -> open"
                );
            }
            _ => {}
        }
    }

    pub fn status(&self) -> CircuitStatus {
        CircuitStatus {
            state: self.state.label().to_string(),
            failure_count: self.failure_count,
            failure_threshold: self.failure_threshold,
            last_failure: self.last_failure.as_ref().map(|(_, iso)| iso.clone()),
        }
    }
}

/// Retry-with-backoff wrapper around per-dependency circuit breakers.
///
/// Every external call the engine makes goes through [`RetryCircuit::run`];
/// only retryable error kinds are attempted again.
pub struct RetryCircuit {
    retry: RetryConfig,
    breaker_config: BreakerConfig,
    breakers: Mutex<BTreeMap<String, CircuitBreaker>>,
}

impl RetryCircuit {
    pub fn new(retry: RetryConfig, breaker_config: BreakerConfig) -> Self {
        Self {
            retry,
            breaker_config,
            breakers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Runs `operation` under the named dependency's breaker and the retry
    /// policy. Rejects immediately with `CircuitOpen` when the breaker does
    /// not admit the call; no transport attempt is made in that case.
    pub async fn run<T, F, Fut>(&self, dependency: &str, operation: F) -> Result<T, SyncError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        if self.breaker_config.enabled && !self.admit(dependency) {
            return Err(SyncError::CircuitOpen(dependency.to_string()));
        }

        let max_attempts = if self.retry.enabled {
            self.retry.max_attempts.max(1)
        } else {
            1
        };
        let mut delay = Duration::from_millis(self.retry.initial_delay_ms);

        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    self.record(dependency, true);
                    return Ok(value);
                }
                Err(err) => {
                    self.record(dependency, false);
                    if attempt >= max_attempts || !err.is_retryable() {
                        return Err(err);
                    }
                    warn!(
                        dependency,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    delay = self.next_delay(delay);
                    attempt += 1;
                }
            }
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let max = Duration::from_millis(self.retry.max_delay_ms);
        let grown = match self.retry.strategy {
            RetryStrategy::Exponential => {
                current.saturating_mul(self.retry.backoff_multiplier.max(1) as u32)
            }
            RetryStrategy::Linear => {
                current.saturating_add(Duration::from_millis(self.retry.initial_delay_ms))
            }
        };
        grown.min(max)
    }

    fn admit(&self, dependency: &str) -> bool {
        let mut breakers = self.breakers.lock().unwrap_or_else(|err| err.into_inner());
        breakers
            .entry(dependency.to_string())
            .or_insert_with(|| CircuitBreaker::new(&self.breaker_config))
            .can_execute()
    }

    fn record(&self, dependency: &str, success: bool) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|err| err.into_inner());
        let breaker = breakers
            .entry(dependency.to_string())
            .or_insert_with(|| CircuitBreaker::new(&self.breaker_config));
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    /// Breaker state for one dependency, if any call has gone through it.
    pub fn breaker_state(&self, dependency: &str) -> Option<CircuitState> {
        let breakers = self.breakers.lock().unwrap_or_else(|err| err.into_inner());
        breakers.get(dependency).map(CircuitBreaker::state)
    }

    /// Snapshot of every breaker, keyed by dependency name.
    pub fn status(&self) -> BTreeMap<String, CircuitStatus> {
        let breakers = self.breakers.lock().unwrap_or_else(|err| err.into_inner());
        breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.status()))
            .collect()
    }
}
