use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::circuit::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
use crate::metrics::{MetricsCollector, PoolStatus};
use crate::transport::{Connector, ToolTransport, TransportError};

/// Grace period for a connection to close cleanly before it is abandoned
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Grace period for background tasks to stop before they are aborted
const TASK_STOP_GRACE: Duration = Duration::from_secs(5);

/// Pool-level errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Configuration error for server '{server}': {reason}")]
    Configuration { server: String, reason: String },

    #[error("Failed to connect to server '{server}': {reason}")]
    ConnectionFailed { server: String, reason: String },

    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Circuit breaker open for server '{0}'")]
    CircuitOpen(String),

    #[error("Unknown server '{0}'")]
    ServerNotFound(String),

    #[error("Pool is shutting down: {0}")]
    ShuttingDown(String),

    #[error("Call to tool '{tool}' on server '{server}' failed: {reason}")]
    CallFailed {
        server: String,
        tool: String,
        reason: String,
    },
}

/// Lifecycle state of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Sitting in the pool, ready to be handed out
    Idle,
    /// Held by a caller
    Active,
    /// Being probed by a health check
    Maintenance,
    /// Marked for destruction
    Failed,
}

pub type ConnectionId = u64;

/// A live connection plus its bookkeeping
pub struct PooledConnection {
    pub id: ConnectionId,
    pub server: String,
    pub transport: Box<dyn ToolTransport>,
    pub state: ConnectionState,
    pub created_at: Instant,
    pub last_used: Instant,
    pub use_count: u64,
    /// Held for its Drop: frees a slot against the global connection limit
    _global_permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    pub fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.use_count += 1;
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Runtime pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub acquire_timeout: Duration,
    pub idle_eviction_age: Duration,
    pub validate_on_acquire: bool,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub max_retry_delay: Duration,
    pub health_check_enabled: bool,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    /// Recent error rate (percent) at which the pool reports Warning
    pub warning_error_rate: f64,
    /// Recent error rate (percent) at which the pool reports Critical
    pub critical_error_rate: f64,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 4,
            connect_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(30),
            idle_eviction_age: Duration::from_secs(300),
            validate_on_acquire: true,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(10),
            health_check_enabled: true,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            warning_error_rate: 20.0,
            critical_error_rate: 50.0,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Connection counts for status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    pub idle: usize,
    pub total: usize,
}

impl PoolCounts {
    pub fn active(&self) -> usize {
        self.total - self.idle
    }
}

struct PoolInner {
    idle: VecDeque<PooledConnection>,
    total: usize,
    stopping: bool,
}

enum Acquired {
    Idle(PooledConnection),
    Slot(Option<OwnedSemaphorePermit>),
    Wait,
    Stopping,
}

/// Connection pool for one tool server.
///
/// Connections are created lazily up to `max_connections`, prewarmed to
/// `min_connections` on start, validated before reuse, and evicted after
/// sitting idle too long. All failures feed the per-pool circuit breaker.
pub struct ConnectionPool {
    server: String,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    breaker: CircuitBreaker,
    metrics: Arc<MetricsCollector>,
    inner: Mutex<PoolInner>,
    available: Notify,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    global_limit: Option<Arc<Semaphore>>,
}

impl ConnectionPool {
    pub fn new(
        server: impl Into<String>,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        metrics: Arc<MetricsCollector>,
        global_limit: Option<Arc<Semaphore>>,
    ) -> Self {
        let server = server.into();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            breaker: CircuitBreaker::new(server.clone(), config.circuit_breaker.clone()),
            server,
            config,
            connector,
            metrics,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                total: 0,
                stopping: false,
            }),
            available: Notify::new(),
            next_id: AtomicU64::new(1),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            global_limit,
        }
    }

    /// Prewarm the pool to its minimum size and spawn the background
    /// health-check and idle-eviction loops. Prewarm failures are logged,
    /// not fatal; connections will be retried on demand.
    pub async fn start(self: &Arc<Self>) {
        for _ in 0..self.config.min_connections {
            let permit = {
                let mut inner = self.inner.lock().await;
                if inner.total >= self.config.max_connections {
                    break;
                }
                match self.claim_global_permit() {
                    Ok(permit) => {
                        inner.total += 1;
                        permit
                    }
                    Err(()) => {
                        warn!(server = %self.server, "global connection limit reached during prewarm");
                        break;
                    }
                }
            };

            match self.create_connection().await {
                Ok(transport) => {
                    let conn = self.wrap_connection(transport, ConnectionState::Idle, permit);
                    let mut inner = self.inner.lock().await;
                    inner.idle.push_back(conn);
                }
                Err(e) => {
                    let mut inner = self.inner.lock().await;
                    inner.total -= 1;
                    drop(inner);
                    warn!(server = %self.server, error = %e, "failed to prewarm connection");
                    break;
                }
            }
        }

        let mut tasks = self.tasks.lock().await;

        if self.config.health_check_enabled {
            let pool = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(pool.config.health_check_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => pool.run_health_checks().await,
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let reap_period = (self.config.idle_eviction_age / 2).max(Duration::from_secs(1));
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reap_period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.reap_expired_idle().await,
                    _ = shutdown.changed() => break,
                }
            }
        }));

        let counts = self.counts().await;
        info!(
            server = %self.server,
            idle = counts.idle,
            max = self.config.max_connections,
            "connection pool started"
        );
    }

    /// Acquire a connection, waiting up to `acquire_timeout` for one to
    /// become available. Fails fast when the circuit breaker is open.
    pub async fn acquire(
        self: &Arc<Self>,
        acquire_timeout: Duration,
    ) -> Result<ConnectionLease, PoolError> {
        // Subscribe before any checks so a concurrent stop cannot slip past.
        let mut shutdown = self.shutdown_tx.subscribe();

        if self.breaker.is_open().await {
            return Err(PoolError::CircuitOpen(self.server.clone()));
        }

        let deadline = Instant::now() + acquire_timeout;

        loop {
            let acquired = {
                let mut inner = self.inner.lock().await;
                if inner.stopping {
                    Acquired::Stopping
                } else if let Some(conn) = inner.idle.pop_front() {
                    Acquired::Idle(conn)
                } else if inner.total < self.config.max_connections {
                    match self.claim_global_permit() {
                        Ok(permit) => {
                            inner.total += 1;
                            Acquired::Slot(permit)
                        }
                        Err(()) => Acquired::Wait,
                    }
                } else {
                    Acquired::Wait
                }
            };

            match acquired {
                Acquired::Idle(mut conn) => {
                    // Pass the wake along if more idle connections remain.
                    {
                        let inner = self.inner.lock().await;
                        if !inner.idle.is_empty() {
                            self.available.notify_one();
                        }
                    }

                    if self.config.validate_on_acquire && !self.validate(&mut conn).await {
                        self.destroy(conn, "failed validation on acquire").await;
                        continue;
                    }

                    conn.state = ConnectionState::Active;
                    conn.mark_used();
                    self.metrics.record_cache_hit(&self.server).await;
                    self.metrics.record_acquired(&self.server).await;
                    return Ok(ConnectionLease::new(Arc::clone(self), conn));
                }
                Acquired::Slot(permit) => match self.create_connection().await {
                    Ok(transport) => {
                        let mut conn =
                            self.wrap_connection(transport, ConnectionState::Active, permit);
                        conn.mark_used();
                        self.metrics.record_cache_miss(&self.server).await;
                        self.metrics.record_acquired(&self.server).await;
                        return Ok(ConnectionLease::new(Arc::clone(self), conn));
                    }
                    Err(e) => {
                        {
                            let mut inner = self.inner.lock().await;
                            inner.total -= 1;
                        }
                        // The slot is free again, let another waiter try.
                        self.available.notify_one();
                        return Err(e);
                    }
                },
                Acquired::Wait => {
                    let remaining = match deadline.checked_duration_since(Instant::now()) {
                        Some(remaining) => remaining,
                        None => {
                            // Never reached the server, so an admitted trial
                            // call must not stay counted against the breaker.
                            self.breaker.release_trial_slot().await;
                            return Err(PoolError::PoolExhausted(format!(
                                "timed out after {:?} waiting for a connection to '{}'",
                                acquire_timeout, self.server
                            )));
                        }
                    };

                    tokio::select! {
                        _ = self.available.notified() => {
                            // The breaker may have opened while this caller
                            // was parked; state() does not consume a trial
                            // slot the way is_open() does.
                            if self.breaker.state().await == BreakerState::Open {
                                return Err(PoolError::CircuitOpen(self.server.clone()));
                            }
                        }
                        _ = shutdown.changed() => {
                            self.breaker.release_trial_slot().await;
                            return Err(PoolError::ShuttingDown(self.server.clone()));
                        }
                        _ = tokio::time::sleep(remaining) => {
                            self.breaker.release_trial_slot().await;
                            return Err(PoolError::PoolExhausted(format!(
                                "timed out after {:?} waiting for a connection to '{}'",
                                acquire_timeout, self.server
                            )));
                        }
                    }
                }
                Acquired::Stopping => {
                    self.breaker.release_trial_slot().await;
                    return Err(PoolError::ShuttingDown(self.server.clone()));
                }
            }
        }
    }

    /// Return a healthy connection to the pool.
    pub async fn release(&self, mut conn: PooledConnection) {
        self.breaker.record_success().await;
        self.metrics.record_returned(&self.server).await;

        // Check and park under one lock: a stop() racing between a separate
        // check and push would drain idle first and strand this connection.
        {
            let mut inner = self.inner.lock().await;
            if !inner.stopping {
                conn.state = ConnectionState::Idle;
                conn.last_used = Instant::now();
                inner.idle.push_back(conn);
                drop(inner);
                self.available.notify_one();
                return;
            }
        }

        self.destroy(conn, "pool stopping").await;
    }

    /// Return a connection whose last call failed. The connection is
    /// destroyed and the failure feeds the circuit breaker.
    pub async fn release_failed(&self, conn: PooledConnection, reason: &str) {
        self.breaker.record_failure().await;
        self.metrics.record_returned(&self.server).await;
        self.destroy(conn, reason).await;
    }

    /// Probe every idle connection and destroy the ones that fail, then
    /// refresh the reported pool status.
    pub async fn run_health_checks(&self) {
        let idle = {
            let mut inner = self.inner.lock().await;
            if inner.stopping {
                return;
            }
            std::mem::take(&mut inner.idle)
        };

        if !idle.is_empty() {
            let mut healthy = VecDeque::new();
            for mut conn in idle {
                if self.validate(&mut conn).await {
                    conn.state = ConnectionState::Idle;
                    healthy.push_back(conn);
                } else {
                    self.breaker.record_failure().await;
                    self.destroy(conn, "failed health check").await;
                }
            }

            let restored = healthy.len();
            {
                let mut inner = self.inner.lock().await;
                // Connections released during the probe pass sit in front.
                inner.idle.extend(healthy);
            }
            for _ in 0..restored {
                self.available.notify_one();
            }
        }

        self.report_status().await;
    }

    /// Destroy idle connections past the eviction age, never shrinking the
    /// pool below its minimum size.
    pub async fn reap_expired_idle(&self) {
        loop {
            let expired = {
                let mut inner = self.inner.lock().await;
                if inner.stopping || inner.total <= self.config.min_connections {
                    return;
                }
                let position = inner
                    .idle
                    .iter()
                    .position(|c| c.idle_for() > self.config.idle_eviction_age);
                match position {
                    Some(i) => inner.idle.remove(i),
                    None => return,
                }
            };

            match expired {
                Some(conn) => self.destroy(conn, "idle past eviction age").await,
                None => return,
            }
        }
    }

    /// Stop the pool: wake waiters, stop background loops, close idle
    /// connections. Active connections are destroyed as they come back.
    pub async fn stop(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.stopping {
                debug!(server = %self.server, "pool already stopping");
                return;
            }
            inner.stopping = true;
        }

        let _ = self.shutdown_tx.send(true);
        self.available.notify_waiters();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for mut task in tasks {
            if timeout(TASK_STOP_GRACE, &mut task).await.is_err() {
                warn!(server = %self.server, "background task did not stop in time, aborting");
                task.abort();
            }
        }

        let idle = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.idle)
        };
        for conn in idle {
            self.destroy(conn, "pool stopping").await;
        }

        info!(server = %self.server, "connection pool stopped");
    }

    /// Derive the pool's health status from breaker state and the recent
    /// error rate, and push it to the metrics collector.
    pub async fn report_status(&self) {
        let stats = self.breaker.stats().await;
        let counts = self.counts().await;
        let error_rate = self.metrics.recent_error_rate(&self.server).await;

        let status = if stats.state == BreakerState::Open {
            PoolStatus::Unavailable
        } else if error_rate >= self.config.critical_error_rate {
            PoolStatus::Critical
        } else if error_rate >= self.config.warning_error_rate
            || stats.state == BreakerState::HalfOpen
        {
            PoolStatus::Warning
        } else {
            PoolStatus::Healthy
        };

        self.metrics
            .record_pool_counts(&self.server, counts.idle, counts.active())
            .await;
        self.metrics
            .update_pool_status(&self.server, status, stats.state.name(), stats.failure_count)
            .await;
    }

    pub async fn counts(&self) -> PoolCounts {
        let inner = self.inner.lock().await;
        PoolCounts {
            idle: inner.idle.len(),
            total: inner.total,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn wrap_connection(
        &self,
        transport: Box<dyn ToolTransport>,
        state: ConnectionState,
        global_permit: Option<OwnedSemaphorePermit>,
    ) -> PooledConnection {
        let now = Instant::now();
        PooledConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            server: self.server.clone(),
            transport,
            state,
            created_at: now,
            last_used: now,
            use_count: 0,
            _global_permit: global_permit,
        }
    }

    /// Claim a slot against the global connection limit. `Ok(None)` means no
    /// limit is configured, `Err(())` means the limit is reached.
    fn claim_global_permit(&self) -> Result<Option<OwnedSemaphorePermit>, ()> {
        match &self.global_limit {
            None => Ok(None),
            Some(limit) => match Arc::clone(limit).try_acquire_owned() {
                Ok(permit) => Ok(Some(permit)),
                Err(_) => Err(()),
            },
        }
    }

    /// Establish a new transport, retrying with exponential backoff. The
    /// outcome feeds the circuit breaker either way.
    async fn create_connection(&self) -> Result<Box<dyn ToolTransport>, PoolError> {
        let mut delay = self.config.retry_backoff;
        let mut last_error: Option<TransportError> = None;

        for attempt in 0..=self.config.retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.config.max_retry_delay);
            }

            match timeout(self.config.connect_timeout, self.connector.connect()).await {
                Ok(Ok(transport)) => {
                    self.breaker.record_success().await;
                    self.metrics.record_connection_created(&self.server).await;
                    info!(server = %self.server, attempt, "connection established");
                    return Ok(transport);
                }
                Ok(Err(e)) => {
                    warn!(server = %self.server, attempt, error = %e, "connection attempt failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(server = %self.server, attempt, "connection attempt timed out");
                    last_error = Some(TransportError::Timeout(self.config.connect_timeout));
                }
            }
        }

        self.breaker.record_failure().await;
        Err(PoolError::ConnectionFailed {
            server: self.server.clone(),
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Probe a connection with a bounded ping.
    async fn validate(&self, conn: &mut PooledConnection) -> bool {
        conn.state = ConnectionState::Maintenance;
        matches!(
            timeout(self.config.health_check_timeout, conn.transport.ping()).await,
            Ok(Ok(()))
        )
    }

    /// Tear down a connection and free its slot.
    async fn destroy(&self, mut conn: PooledConnection, reason: &str) {
        conn.state = ConnectionState::Failed;
        {
            let mut inner = self.inner.lock().await;
            inner.total = inner.total.saturating_sub(1);
        }

        debug!(server = %self.server, id = conn.id, reason, "destroying connection");

        match timeout(CLOSE_GRACE, conn.transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(server = %self.server, id = conn.id, error = %e, "error closing connection");
            }
            Err(_) => {
                warn!(server = %self.server, id = conn.id, "connection did not close in time");
            }
        }

        self.metrics.record_connection_destroyed(&self.server).await;
        // The freed slot may unblock a waiter.
        self.available.notify_one();
    }
}

/// A connection on loan from a pool.
///
/// Callers should hand it back with [`release`](ConnectionLease::release) on
/// success or [`discard`](ConnectionLease::discard) after a failure. Dropping
/// the lease returns the connection as healthy.
pub struct ConnectionLease {
    pool: Arc<ConnectionPool>,
    id: ConnectionId,
    conn: Option<PooledConnection>,
}

impl ConnectionLease {
    fn new(pool: Arc<ConnectionPool>, conn: PooledConnection) -> Self {
        Self {
            id: conn.id,
            conn: Some(conn),
            pool,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn transport(&mut self) -> &mut dyn ToolTransport {
        self.conn
            .as_mut()
            .map(|c| c.transport.as_mut())
            .expect("connection lease used after release")
    }

    /// Return the connection to the pool as healthy.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn).await;
        }
    }

    /// Destroy the connection after a failure.
    pub async fn discard(mut self, reason: &str) {
        if let Some(conn) = self.conn.take() {
            self.pool.release_failed(conn, reason).await;
        }
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("id", &self.id)
            .field("server", &self.pool.server())
            .finish()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = Arc::clone(&self.pool);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        pool.release(conn).await;
                    });
                }
                Err(_) => {
                    warn!(
                        server = %pool.server(),
                        id = conn.id,
                        "connection lease dropped outside a runtime, connection leaked"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.max_connections, 4);
        assert!(config.validate_on_acquire);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.idle_eviction_age, Duration::from_secs(300));
    }

    #[test]
    fn test_pool_counts_active() {
        let counts = PoolCounts { idle: 2, total: 5 };
        assert_eq!(counts.active(), 3);
    }
}
