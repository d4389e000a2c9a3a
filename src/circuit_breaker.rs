// Per-dependency circuit breaker guarding calls to the users and rooms services

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{clock::Clock, config::CircuitConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

// Raised instead of calling the dependency
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Circuit breaker {state} for {service_name}")]
pub struct CircuitOpenError {
    pub service_name: String,
    pub state: CircuitState,
    pub retry_after: Option<Duration>,
}

#[derive(Error, Debug)]
pub enum CallError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    #[error("{service_name} call timed out after {}ms", .after.as_millis())]
    Timeout {
        service_name: String,
        after: Duration,
    },

    #[error("{0}")]
    Failed(E),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTransition {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub rejections: u64,
    pub time_until_recovery_ms: Option<u64>,
}

enum State {
    Closed { failures: u32 },
    Open { opened_at: Instant, failures: u32 },
    // entered only by the caller that became the probe, so a probe is always in flight here
    HalfOpen { failures: u32 },
}

impl State {
    fn kind(&self) -> CircuitState {
        match self {
            State::Closed { .. } => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn failures(&self) -> u32 {
        match self {
            State::Closed { failures }
            | State::Open { failures, .. }
            | State::HalfOpen { failures } => *failures,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Pass,
    Probe,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    rejections: AtomicU64,
    transitions: Option<broadcast::Sender<CircuitTransition>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(State::Closed { failures: 0 }),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            transitions: None,
        }
    }

    pub fn with_transitions(mut self, sender: broadcast::Sender<CircuitTransition>) -> Self {
        self.transitions = Some(sender);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().kind()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().failures()
    }

    // Errors and timeouts both count as failures
    pub async fn call<T, E, F, Fut>(&self, timeout: Duration, invocation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire().map_err(|e| {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            e
        })?;
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let mut outcome = Outcome {
            breaker: self,
            permit,
            settled: false,
        };

        match tokio::time::timeout(timeout, invocation()).await {
            Ok(Ok(value)) => {
                outcome.success();
                Ok(value)
            }
            Ok(Err(e)) => {
                outcome.failure();
                Err(CallError::Failed(e))
            }
            Err(_) => {
                warn!(circuit = %self.name, timeout_ms = timeout.as_millis() as u64, "dependency call timed out");
                outcome.failure();
                Err(CallError::Timeout {
                    service_name: self.name.clone(),
                    after: timeout,
                })
            }
        }
    }

    // Emergency use only
    pub fn reset(&self) {
        let mut state = self.state.lock();
        self.transition(&mut state, State::Closed { failures: 0 });
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock();
        let time_until_recovery_ms = match *state {
            State::Open { opened_at, .. } => {
                let elapsed = self.clock.now().saturating_duration_since(opened_at);
                Some(
                    self.config
                        .recovery_timeout()
                        .saturating_sub(elapsed)
                        .as_millis() as u64,
                )
            }
            _ => None,
        };

        CircuitSnapshot {
            name: self.name.clone(),
            state: state.kind(),
            consecutive_failures: state.failures(),
            failure_threshold: self.config.failure_threshold,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            time_until_recovery_ms,
        }
    }

    fn acquire(&self) -> Result<Permit, CircuitOpenError> {
        let mut state = self.state.lock();
        match *state {
            State::Closed { .. } => Ok(Permit::Pass),
            State::Open {
                opened_at,
                failures,
            } => {
                let elapsed = self.clock.now().saturating_duration_since(opened_at);
                let recovery = self.config.recovery_timeout();
                if elapsed >= recovery {
                    self.transition(&mut state, State::HalfOpen { failures });
                    Ok(Permit::Probe)
                } else {
                    Err(self.open_error(CircuitState::Open, Some(recovery - elapsed)))
                }
            }
            State::HalfOpen { .. } => {
                debug!(circuit = %self.name, "probe in flight, rejecting call");
                Err(self.open_error(CircuitState::HalfOpen, None))
            }
        }
    }

    fn record_success(&self, permit: Permit) {
        let mut state = self.state.lock();
        match (&*state, permit) {
            (State::Closed { .. }, _) => *state = State::Closed { failures: 0 },
            (State::HalfOpen { .. }, Permit::Probe) => {
                self.transition(&mut state, State::Closed { failures: 0 })
            }
            // late result of a call admitted before the circuit moved on
            _ => {}
        }
    }

    fn record_failure(&self, permit: Permit) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        match (&*state, permit) {
            (State::Closed { failures }, _) => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    let opened_at = self.clock.now();
                    self.transition(
                        &mut state,
                        State::Open {
                            opened_at,
                            failures,
                        },
                    );
                } else {
                    *state = State::Closed { failures };
                }
            }
            (State::HalfOpen { failures }, Permit::Probe) => {
                let failures = failures + 1;
                let opened_at = self.clock.now();
                self.transition(
                    &mut state,
                    State::Open {
                        opened_at,
                        failures,
                    },
                );
            }
            _ => {}
        }
    }

    fn transition(&self, state: &mut State, next: State) {
        let from = state.kind();
        let to = next.kind();
        *state = next;
        if from == to {
            return;
        }

        match to {
            CircuitState::Open => warn!(
                circuit = %self.name,
                %from,
                failures = state.failures(),
                "circuit opened"
            ),
            CircuitState::HalfOpen => info!(circuit = %self.name, "circuit half-open, probing"),
            CircuitState::Closed => info!(circuit = %self.name, %from, "circuit closed"),
        }

        if let Some(tx) = &self.transitions {
            // no subscribers is fine
            let _ = tx.send(CircuitTransition {
                name: self.name.clone(),
                from,
                to,
            });
        }
    }

    fn open_error(&self, state: CircuitState, retry_after: Option<Duration>) -> CircuitOpenError {
        CircuitOpenError {
            service_name: self.name.clone(),
            state,
            retry_after,
        }
    }
}

// Settles a call exactly once. A probe dropped mid-flight counts as failed so
// the circuit cannot stay half-open forever.
struct Outcome<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
    settled: bool,
}

impl Outcome<'_> {
    fn success(&mut self) {
        self.settled = true;
        self.breaker.record_success(self.permit);
    }

    fn failure(&mut self) {
        self.settled = true;
        self.breaker.record_failure(self.permit);
    }
}

impl Drop for Outcome<'_> {
    fn drop(&mut self) {
        if !self.settled && self.permit == Permit::Probe {
            warn!(circuit = %self.breaker.name, "probe abandoned, reopening circuit");
            self.breaker.record_failure(self.permit);
        }
    }
}
