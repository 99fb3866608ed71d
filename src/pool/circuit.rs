use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, requests flow through
    Closed,
    /// Too many failures, requests are rejected
    Open,
    /// Testing whether the server has recovered
    HalfOpen,
}

impl BreakerState {
    pub fn name(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Whether the breaker is enabled at all
    pub enabled: bool,
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// How long to stay open before probing
    pub recovery_timeout: Duration,
    /// Consecutive successes needed to close from half-open
    pub success_threshold: u32,
    /// Trial calls admitted while half-open
    pub half_open_max_calls: u32,
    /// Per-call timeout applied by callers holding a connection
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_calls: 3,
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure: Option<Instant>,
    last_transition: Instant,
}

impl BreakerInner {
    fn transition_to_open(&mut self, server: &str) {
        warn!(
            %server,
            failures = self.failure_count,
            "circuit breaker opened"
        );
        self.state = BreakerState::Open;
        self.success_count = 0;
        self.half_open_calls = 0;
        self.last_transition = Instant::now();
    }

    fn transition_to_closed(&mut self, server: &str) {
        info!(%server, "circuit breaker closed, server recovered");
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_calls = 0;
        self.last_transition = Instant::now();
    }
}

/// Per-pool circuit breaker.
///
/// Counts consecutive connection and call failures. When the failure
/// threshold is hit the breaker opens and acquisitions fail fast. After the
/// recovery timeout a bounded number of trial calls is admitted; enough
/// successes close the breaker, any failure reopens it.
pub struct CircuitBreaker {
    server: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(server: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            server: server.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                last_failure: None,
                last_transition: Instant::now(),
            }),
        }
    }

    /// Whether the breaker currently rejects requests. Performs the
    /// open-to-half-open transition when the recovery timeout has elapsed,
    /// and admits (and counts) trial calls while half-open.
    pub async fn is_open(&self) -> bool {
        if !self.config.enabled {
            return false;
        }

        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or_else(|| inner.last_transition.elapsed());

                if elapsed >= self.config.recovery_timeout {
                    info!(server = %self.server, "circuit breaker half-open, probing server");
                    inner.state = BreakerState::HalfOpen;
                    inner.success_count = 0;
                    inner.half_open_calls = 1;
                    inner.last_transition = Instant::now();
                    false
                } else {
                    true
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    true
                } else {
                    inner.half_open_calls += 1;
                    false
                }
            }
        }
    }

    /// Hand back a half-open trial slot that never produced an outcome.
    ///
    /// A caller admitted by [`is_open`](Self::is_open) may fail before it
    /// ever reaches the server (pool exhausted, pool stopping). Without
    /// returning the slot the breaker would run out of trial calls with no
    /// success or failure ever recorded and sit in half-open forever.
    pub async fn release_trial_slot(&self) {
        if !self.config.enabled {
            return;
        }

        let mut inner = self.inner.lock().await;
        if inner.state == BreakerState::HalfOpen && inner.half_open_calls > 0 {
            inner.half_open_calls -= 1;
        }
    }

    /// Record a successful connection or call.
    pub async fn record_success(&self) {
        if !self.config.enabled {
            return;
        }

        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::Open => {
                // Success while open means a call raced the opening; ignore.
                debug!(server = %self.server, "success recorded while circuit open");
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.transition_to_closed(&self.server);
                }
            }
        }
    }

    /// Record a failed connection or call.
    pub async fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }

        let mut inner = self.inner.lock().await;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.transition_to_open(&self.server);
                }
            }
            BreakerState::Open => {}
            BreakerState::HalfOpen => {
                inner.failure_count += 1;
                inner.transition_to_open(&self.server);
            }
        }
    }

    /// Force the breaker open (administrative).
    pub async fn force_open(&self) {
        let mut inner = self.inner.lock().await;
        warn!(server = %self.server, "circuit breaker forced open");
        inner.state = BreakerState::Open;
        inner.last_failure = Some(Instant::now());
        inner.last_transition = Instant::now();
    }

    /// Force the breaker closed (administrative).
    pub async fn force_close(&self) {
        let mut inner = self.inner.lock().await;
        inner.transition_to_closed(&self.server);
    }

    /// Reset all counters and close the breaker.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_calls = 0;
        inner.last_failure = None;
        inner.last_transition = Instant::now();
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock().await;
        CircuitStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            time_since_last_failure: inner.last_failure.map(|t| t.elapsed()),
            time_in_state: inner.last_transition.elapsed(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

/// Snapshot of breaker state for status reporting
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub time_since_last_failure: Option<Duration>,
    pub time_in_state: Duration,
}
