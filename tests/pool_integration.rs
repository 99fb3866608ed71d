use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use toolpool::catalog::ServerDescriptor;
use toolpool::facade::PooledToolFacade;
use toolpool::manager::ConnectionManager;
use toolpool::metrics::{MetricsCollector, MetricsConfig, PoolStatus};
use toolpool::pool::{
    BreakerState, CircuitBreakerConfig, ConnectionPool, PoolConfig, PoolError,
};
use toolpool::transport::{
    Connector, ContentItem, ToolDescriptor, ToolResult, ToolTransport, TransportError,
};

/// In-memory transport backed by shared flags so tests can flip a server
/// between healthy and broken.
struct FakeTransport {
    healthy: Arc<AtomicBool>,
    fail_calls: Arc<AtomicBool>,
}

#[async_trait]
impl ToolTransport for FakeTransport {
    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(vec![ToolDescriptor {
            name: "echo".to_string(),
            description: Some("echoes its arguments".to_string()),
            input_schema: json!({"type": "object"}),
        }])
    }

    async fn call_tool(
        &mut self,
        tool: &str,
        args: serde_json::Value,
    ) -> Result<ToolResult, TransportError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(TransportError::Protocol("tool blew up".to_string()));
        }
        Ok(ToolResult {
            content: vec![ContentItem::Text {
                text: format!("{tool}:{args}"),
            }],
            is_error: false,
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeConnector {
    fail_connect: AtomicBool,
    created: AtomicUsize,
    healthy: Arc<AtomicBool>,
    fail_calls: Arc<AtomicBool>,
}

impl FakeConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            healthy: Arc::new(AtomicBool::new(true)),
            ..Self::default()
        })
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn ToolTransport>, TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Protocol("connection refused".to_string()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTransport {
            healthy: Arc::clone(&self.healthy),
            fail_calls: Arc::clone(&self.fail_calls),
        }))
    }
}

fn test_pool_config() -> PoolConfig {
    PoolConfig {
        min_connections: 0,
        max_connections: 2,
        connect_timeout: Duration::from_secs(1),
        acquire_timeout: Duration::from_secs(1),
        idle_eviction_age: Duration::from_millis(20),
        validate_on_acquire: false,
        retry_attempts: 0,
        retry_backoff: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(50),
        health_check_enabled: false,
        health_check_interval: Duration::from_secs(60),
        health_check_timeout: Duration::from_millis(200),
        warning_error_rate: 20.0,
        critical_error_rate: 50.0,
        circuit_breaker: CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(200),
            success_threshold: 1,
            half_open_max_calls: 2,
            call_timeout: Duration::from_secs(1),
        },
    }
}

fn build_pool(config: PoolConfig, connector: Arc<FakeConnector>) -> Arc<ConnectionPool> {
    let metrics = Arc::new(MetricsCollector::new(MetricsConfig::default()));
    Arc::new(ConnectionPool::new("fake", config, connector, metrics, None))
}

#[tokio::test]
async fn test_acquire_creates_then_reuses() {
    let connector = FakeConnector::new();
    let pool = build_pool(test_pool_config(), Arc::clone(&connector));

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let first_id = lease.id();
    lease.release().await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(lease.id(), first_id);
    assert_eq!(connector.created(), 1);
    lease.release().await;

    let counts = pool.counts().await;
    assert_eq!(counts.total, 1);
    assert_eq!(counts.idle, 1);
}

#[tokio::test]
async fn test_acquire_times_out_when_exhausted() {
    let config = PoolConfig {
        max_connections: 1,
        ..test_pool_config()
    };
    let pool = build_pool(config, FakeConnector::new());

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, PoolError::PoolExhausted(_)));

    held.release().await;
    let lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
    lease.release().await;
}

#[tokio::test]
async fn test_waiter_wakes_on_release() {
    let config = PoolConfig {
        max_connections: 1,
        ..test_pool_config()
    };
    let pool = build_pool(config, FakeConnector::new());

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    held.release().await;

    let lease = waiter.await.unwrap().unwrap();
    lease.release().await;
}

#[tokio::test]
async fn test_breaker_opens_after_connect_failures() {
    let connector = FakeConnector::new();
    connector.fail_connect.store(true, Ordering::SeqCst);
    let pool = build_pool(test_pool_config(), Arc::clone(&connector));

    for _ in 0..2 {
        let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, PoolError::ConnectionFailed { .. }));
    }

    // Threshold of two reached, acquisitions now fail fast
    let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, PoolError::CircuitOpen(_)));
    assert_eq!(pool.breaker().state().await, BreakerState::Open);
}

#[tokio::test]
async fn test_breaker_recovers_after_timeout() {
    let connector = FakeConnector::new();
    connector.fail_connect.store(true, Ordering::SeqCst);
    let pool = build_pool(test_pool_config(), Arc::clone(&connector));

    for _ in 0..2 {
        let _ = pool.acquire(Duration::from_secs(1)).await;
    }
    assert_eq!(pool.breaker().state().await, BreakerState::Open);

    connector.fail_connect.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(250)).await;

    // The trial call succeeds and closes the breaker
    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    lease.release().await;
    assert_eq!(pool.breaker().state().await, BreakerState::Closed);
}

#[tokio::test]
async fn test_discard_destroys_connection() {
    let connector = FakeConnector::new();
    let pool = build_pool(test_pool_config(), Arc::clone(&connector));

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let first_id = lease.id();
    lease.discard("call blew up").await;

    assert_eq!(pool.counts().await.total, 0);

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_ne!(lease.id(), first_id);
    assert_eq!(connector.created(), 2);
    lease.release().await;
}

#[tokio::test]
async fn test_stop_wakes_waiters() {
    let config = PoolConfig {
        max_connections: 1,
        ..test_pool_config()
    };
    let pool = build_pool(config, FakeConnector::new());

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.stop().await;

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, PoolError::ShuttingDown(_)));

    let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, PoolError::ShuttingDown(_)));

    drop(held);
}

#[tokio::test]
async fn test_lease_debug_names_connection() {
    let pool = build_pool(test_pool_config(), FakeConnector::new());

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let rendered = format!("{lease:?}");
    assert!(rendered.contains("ConnectionLease"));
    assert!(rendered.contains("fake"));
    lease.release().await;
}

#[tokio::test]
async fn test_half_open_slot_returned_when_exhausted() {
    let config = PoolConfig {
        max_connections: 1,
        circuit_breaker: CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(100),
            success_threshold: 2,
            half_open_max_calls: 1,
            call_timeout: Duration::from_secs(1),
        },
        ..test_pool_config()
    };
    let pool = build_pool(config, FakeConnector::new());

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    pool.breaker().force_open().await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Admitted as the only trial call, but the pool is at capacity; the
    // failure is a capacity signal and must not use up the trial slot
    let err = pool.acquire(Duration::from_millis(20)).await.unwrap_err();
    assert!(matches!(err, PoolError::PoolExhausted(_)));
    assert_eq!(pool.breaker().state().await, BreakerState::HalfOpen);

    held.release().await;

    // The next acquire still gets a trial slot and recovery completes
    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    lease.release().await;
    assert_eq!(pool.breaker().state().await, BreakerState::Closed);
}

#[tokio::test]
async fn test_waiter_fails_fast_when_breaker_opens() {
    let config = PoolConfig {
        max_connections: 1,
        ..test_pool_config()
    };
    let pool = build_pool(config, FakeConnector::new());

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.breaker().force_open().await;
    held.discard("server fell over").await;

    // The freed slot wakes the waiter, which sees the open breaker
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, PoolError::CircuitOpen(_)));
}

#[tokio::test]
async fn test_release_after_stop_destroys() {
    let pool = build_pool(test_pool_config(), FakeConnector::new());

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    pool.stop().await;

    // The connection cannot be parked in a stopped pool
    lease.release().await;
    let counts = pool.counts().await;
    assert_eq!(counts.total, 0);
    assert_eq!(counts.idle, 0);
}

#[tokio::test]
async fn test_reap_respects_minimum() {
    let config = PoolConfig {
        min_connections: 1,
        ..test_pool_config()
    };
    let pool = build_pool(config, FakeConnector::new());

    let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
    a.release().await;
    b.release().await;
    assert_eq!(pool.counts().await.total, 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.reap_expired_idle().await;

    // Both are past the eviction age but the pool keeps its minimum
    let counts = pool.counts().await;
    assert_eq!(counts.total, 1);
    assert_eq!(counts.idle, 1);
}

#[tokio::test]
async fn test_health_check_removes_unhealthy() {
    let connector = FakeConnector::new();
    let pool = build_pool(test_pool_config(), Arc::clone(&connector));

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    lease.release().await;
    assert_eq!(pool.counts().await.idle, 1);

    connector.healthy.store(false, Ordering::SeqCst);
    pool.run_health_checks().await;

    assert_eq!(pool.counts().await.total, 0);
    assert_eq!(pool.breaker().stats().await.failure_count, 1);
}

#[tokio::test]
async fn test_validate_on_acquire_discards_stale() {
    let connector = FakeConnector::new();
    let config = PoolConfig {
        validate_on_acquire: true,
        ..test_pool_config()
    };
    let pool = build_pool(config, Arc::clone(&connector));

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let first_id = lease.id();
    lease.release().await;

    connector.healthy.store(false, Ordering::SeqCst);

    // The idle connection fails its probe and a fresh one is created
    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_ne!(lease.id(), first_id);
    assert_eq!(connector.created(), 2);
    lease.release().await;
}

#[tokio::test]
async fn test_prewarm_on_start() {
    let connector = FakeConnector::new();
    let config = PoolConfig {
        min_connections: 2,
        ..test_pool_config()
    };
    let metrics = Arc::new(MetricsCollector::new(MetricsConfig::default()));
    let dyn_connector: Arc<dyn Connector> = connector.clone();
    let pool = Arc::new(ConnectionPool::new(
        "fake",
        config,
        dyn_connector,
        metrics,
        None,
    ));

    pool.start().await;
    let counts = pool.counts().await;
    assert_eq!(counts.idle, 2);
    assert_eq!(connector.created(), 2);

    pool.stop().await;
    assert_eq!(pool.counts().await.total, 0);
}

#[tokio::test]
async fn test_global_limit_caps_pool() {
    use tokio::sync::Semaphore;

    let metrics = Arc::new(MetricsCollector::new(MetricsConfig::default()));
    let limit = Arc::new(Semaphore::new(1));
    let pool = Arc::new(ConnectionPool::new(
        "fake",
        test_pool_config(),
        FakeConnector::new(),
        metrics,
        Some(limit),
    ));

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    // Pool has room for two but the global limit allows one
    let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, PoolError::PoolExhausted(_)));

    held.release().await;
    let lease = pool.acquire(Duration::from_millis(200)).await.unwrap();
    lease.release().await;
}

fn build_facade(connector: Arc<FakeConnector>, config: PoolConfig) -> PooledToolFacade {
    let metrics = Arc::new(MetricsCollector::new(MetricsConfig::default()));
    let pool = Arc::new(ConnectionPool::new(
        "fake",
        config,
        connector,
        Arc::clone(&metrics),
        None,
    ));
    PooledToolFacade::new(pool, metrics)
}

#[tokio::test]
async fn test_facade_list_and_call() {
    let facade = build_facade(FakeConnector::new(), test_pool_config());

    let tools = facade.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    let result = facade.call_tool("echo", json!({"msg": "hi"})).await.unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content.len(), 1);

    let schema = facade.get_tool_schema("echo").await.unwrap();
    assert_eq!(schema, Some(json!({"type": "object"})));

    let schema = facade.get_tool_schema("missing").await.unwrap();
    assert_eq!(schema, None);
}

#[tokio::test]
async fn test_facade_call_failure_discards_connection() {
    let connector = FakeConnector::new();
    connector.fail_calls.store(true, Ordering::SeqCst);
    let metrics = Arc::new(MetricsCollector::new(MetricsConfig::default()));
    let dyn_connector: Arc<dyn Connector> = connector.clone();
    let pool = Arc::new(ConnectionPool::new(
        "fake",
        test_pool_config(),
        dyn_connector,
        Arc::clone(&metrics),
        None,
    ));
    let facade = PooledToolFacade::new(Arc::clone(&pool), Arc::clone(&metrics));

    let err = facade.call_tool("echo", json!({})).await.unwrap_err();
    assert!(matches!(err, PoolError::CallFailed { .. }));

    // The broken connection was destroyed, not returned
    assert_eq!(pool.counts().await.total, 0);
    assert_eq!(metrics.recent_error_rate("fake").await, 100.0);

    // A 100% recent error rate derives a critical status
    pool.report_status().await;
    let snapshot = metrics.snapshot("fake").await.unwrap();
    assert_eq!(snapshot.status, PoolStatus::Critical);
    assert_eq!(snapshot.errors, 1);
    assert_eq!(snapshot.active_connections, 0);
}

#[tokio::test]
async fn test_manager_unknown_server() {
    let manager = Arc::new(ConnectionManager::new(
        test_pool_config(),
        MetricsConfig::default(),
        0,
    ));
    manager.initialize(Vec::new()).await.unwrap();

    let err = manager.acquire("nope").await.unwrap_err();
    assert!(matches!(err, PoolError::ServerNotFound(_)));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_manager_rejects_invalid_descriptor() {
    let manager = Arc::new(ConnectionManager::new(
        test_pool_config(),
        MetricsConfig::default(),
        0,
    ));

    let descriptor = ServerDescriptor::subprocess("bad", "", Vec::new());
    let err = manager.add_server(descriptor).await.unwrap_err();
    assert!(matches!(err, PoolError::Configuration { .. }));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_manager_unreachable_endpoint() {
    let manager = Arc::new(ConnectionManager::new(
        test_pool_config(),
        MetricsConfig::default(),
        0,
    ));

    // Registering succeeds with min_connections 0; acquiring surfaces the
    // connection failure.
    let descriptor = ServerDescriptor::stream_endpoint("down", "http://127.0.0.1:1/rpc");
    manager.add_server(descriptor).await.unwrap();

    let err = manager.acquire("down").await.unwrap_err();
    assert!(matches!(err, PoolError::ConnectionFailed { .. }));

    manager.shutdown().await;
}
