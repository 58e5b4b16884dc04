//! Circuit breaker for the LLM transport.
//!
//! Wraps any [`LlmClient`] and fails fast once the backend has failed
//! repeatedly, instead of piling more requests onto a struggling local
//! server.
//!
//! State machine:
//!
//! ```text
//!   Closed --(max_failures consecutive failures)--> Open
//!   Open   --(timeout since last failure)---------> HalfOpen (one probe)
//!   HalfOpen --(half_open_max successes)----------> Closed
//!   HalfOpen --(any failure)----------------------> Open
//! ```

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::{BreakerConfig, Tier};
use crate::error::{AgentError, Result};
use crate::llm::client::LlmClient;
use crate::llm::types::{ChatRequest, ChatResponse, ChunkStream};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Breaker state, exposed for diagnostics and `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected without touching the backend.
    Open,
    /// One probe at a time is admitted to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    probe_in_flight: bool,
    last_failure: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            probe_in_flight: false,
            last_failure: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

/// Decorator that enforces the circuit on every request.
pub struct CircuitBreaker {
    inner: Arc<dyn LlmClient>,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Wrap a client.
    pub fn new(inner: Arc<dyn LlmClient>, config: BreakerConfig) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    /// Current circuit state (Open lazily becomes HalfOpen on the next
    /// admission check, not here).
    pub fn state(&self) -> CircuitState {
        self.state.lock().expect("breaker mutex poisoned").state
    }

    /// Admission check. Returns the cooldown remaining when rejected.
    fn try_admit(&self) -> std::result::Result<(), Duration> {
        let mut guard = self.state.lock().expect("breaker mutex poisoned");
        match guard.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = guard
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.timeout);
                if elapsed >= self.config.timeout {
                    tracing::info!("circuit breaker half-open; admitting probe");
                    guard.state = CircuitState::HalfOpen;
                    guard.half_open_successes = 0;
                    guard.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(self.config.timeout - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if guard.probe_in_flight {
                    // At most one concurrent probe while half-open.
                    Err(self.config.timeout)
                } else {
                    guard.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn record_success(&self) {
        let mut guard = self.state.lock().expect("breaker mutex poisoned");
        match guard.state {
            CircuitState::Closed => {
                guard.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                guard.probe_in_flight = false;
                guard.half_open_successes += 1;
                if guard.half_open_successes >= self.config.half_open_max {
                    tracing::info!("circuit breaker closed after successful probes");
                    *guard = BreakerState::new();
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut guard = self.state.lock().expect("breaker mutex poisoned");
        guard.last_failure = Some(Instant::now());
        match guard.state {
            CircuitState::Closed => {
                guard.consecutive_failures += 1;
                if guard.consecutive_failures >= self.config.max_failures {
                    tracing::warn!(
                        failures = guard.consecutive_failures,
                        "circuit breaker opened"
                    );
                    guard.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("probe failed; circuit breaker reopened");
                guard.state = CircuitState::Open;
                guard.probe_in_flight = false;
                guard.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}

#[async_trait]
impl LlmClient for CircuitBreaker {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        if let Err(cooldown) = self.try_admit() {
            return Err(AgentError::CircuitOpen { cooldown });
        }
        match self.inner.chat(request).await {
            Ok(response) => {
                self.record_success();
                Ok(response)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        if let Err(cooldown) = self.try_admit() {
            return Err(AgentError::CircuitOpen { cooldown });
        }
        // Stream acquisition is the observable success/failure point; chunk
        // errors after that are surfaced to the loop, not counted here.
        match self.inner.chat_stream(request).await {
            Ok(stream) => {
                self.record_success();
                Ok(stream)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn set_model(&self, model: &str) {
        self.inner.set_model(model);
    }

    fn model(&self) -> String {
        self.inner.model()
    }

    fn set_tier(&self, tier: Tier) {
        self.inner.set_tier(tier);
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
