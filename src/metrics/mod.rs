//! Pool metrics and alerting.
//!
//! One [`MetricsCollector`] is shared by all pools. It tracks per-server
//! connection counters, a sliding window of operation samples for latency
//! percentiles and error rates, derived pool status, and threshold alerts
//! with a suppression window so a flapping server does not spam the log.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Metrics configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Whether collection is enabled
    pub enabled: bool,
    /// Interval between export/prune cycles
    pub export_interval: Duration,
    /// Log per-server detail on each export cycle
    pub detailed: bool,
    /// Number of operation samples kept per server
    pub sample_window: usize,
    /// Minimum gap between repeats of the same alert
    pub alert_cooldown: Duration,
    /// How long alerts are retained
    pub retention: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            export_interval: Duration::from_secs(60),
            detailed: false,
            sample_window: 100,
            alert_cooldown: Duration::from_secs(300),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Derived health status of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    #[default]
    Healthy,
    Warning,
    Critical,
    Unavailable,
}

impl PoolStatus {
    pub fn name(&self) -> &'static str {
        match self {
            PoolStatus::Healthy => "healthy",
            PoolStatus::Warning => "warning",
            PoolStatus::Critical => "critical",
            PoolStatus::Unavailable => "unavailable",
        }
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// A raised alert
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub server: String,
    pub message: String,
    /// Unix timestamp in seconds
    pub timestamp: u64,
    #[serde(skip)]
    key: String,
    #[serde(skip)]
    raised_at: Instant,
}

struct OperationSample {
    duration: Duration,
    success: bool,
    recorded_at: Instant,
}

#[derive(Default)]
struct ServerMetrics {
    connections_created: u64,
    connections_destroyed: u64,
    acquired: u64,
    returned: u64,
    cache_hits: u64,
    cache_misses: u64,
    errors: u64,
    samples: VecDeque<OperationSample>,
    idle_connections: usize,
    active_connections: usize,
    status: PoolStatus,
    breaker_state: String,
    failure_count: u32,
}

/// Point-in-time view of one server's metrics
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetricsSnapshot {
    pub server: String,
    pub connections_created: u64,
    pub connections_destroyed: u64,
    pub acquired: u64,
    pub returned: u64,
    pub idle_connections: usize,
    pub active_connections: usize,
    pub errors: u64,
    pub cache_hit_rate: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub status: PoolStatus,
    pub breaker_state: String,
    pub failure_count: u32,
}

/// Aggregate view across all servers
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub servers: Vec<PoolMetricsSnapshot>,
    pub total_connections_created: u64,
    pub total_errors: u64,
    pub recent_alerts: Vec<Alert>,
}

pub struct MetricsCollector {
    config: MetricsConfig,
    servers: RwLock<HashMap<String, Arc<Mutex<ServerMetrics>>>>,
    alerts: Mutex<Vec<Alert>>,
    suppressed: Mutex<HashMap<String, Instant>>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            servers: RwLock::new(HashMap::new()),
            alerts: Mutex::new(Vec::new()),
            suppressed: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register_server(&self, server: &str) {
        let _ = self.entry(server).await;
    }

    async fn entry(&self, server: &str) -> Arc<Mutex<ServerMetrics>> {
        {
            let servers = self.servers.read().await;
            if let Some(entry) = servers.get(server) {
                return Arc::clone(entry);
            }
        }

        let mut servers = self.servers.write().await;
        Arc::clone(servers.entry(server.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(ServerMetrics {
                breaker_state: "closed".to_string(),
                ..ServerMetrics::default()
            }))
        }))
    }

    pub async fn record_connection_created(&self, server: &str) {
        if !self.config.enabled {
            return;
        }
        let entry = self.entry(server).await;
        entry.lock().await.connections_created += 1;
    }

    pub async fn record_connection_destroyed(&self, server: &str) {
        if !self.config.enabled {
            return;
        }
        let entry = self.entry(server).await;
        entry.lock().await.connections_destroyed += 1;
    }

    pub async fn record_acquired(&self, server: &str) {
        if !self.config.enabled {
            return;
        }
        let entry = self.entry(server).await;
        entry.lock().await.acquired += 1;
    }

    pub async fn record_returned(&self, server: &str) {
        if !self.config.enabled {
            return;
        }
        let entry = self.entry(server).await;
        entry.lock().await.returned += 1;
    }

    pub async fn record_cache_hit(&self, server: &str) {
        if !self.config.enabled {
            return;
        }
        let entry = self.entry(server).await;
        entry.lock().await.cache_hits += 1;
    }

    pub async fn record_cache_miss(&self, server: &str) {
        if !self.config.enabled {
            return;
        }
        let entry = self.entry(server).await;
        entry.lock().await.cache_misses += 1;
    }

    /// Record one operation's duration and outcome into the sliding window.
    pub async fn record_operation_time(
        &self,
        server: &str,
        operation: &str,
        duration: Duration,
        success: bool,
    ) {
        if !self.config.enabled {
            return;
        }

        debug!(%server, %operation, ?duration, success, "operation recorded");

        let entry = self.entry(server).await;
        let mut metrics = entry.lock().await;
        if !success {
            metrics.errors += 1;
        }
        metrics.samples.push_back(OperationSample {
            duration,
            success,
            recorded_at: Instant::now(),
        });
        while metrics.samples.len() > self.config.sample_window {
            metrics.samples.pop_front();
        }
    }

    /// Record the pool's live idle/active connection counts.
    pub async fn record_pool_counts(&self, server: &str, idle: usize, active: usize) {
        if !self.config.enabled {
            return;
        }
        let entry = self.entry(server).await;
        let mut metrics = entry.lock().await;
        metrics.idle_connections = idle;
        metrics.active_connections = active;
    }

    /// Failure percentage over the sample window (0.0 to 100.0).
    pub async fn recent_error_rate(&self, server: &str) -> f64 {
        let entry = self.entry(server).await;
        let metrics = entry.lock().await;
        error_rate(&metrics.samples)
    }

    /// Record the pool's derived status. Entering a degraded status raises
    /// an alert, subject to the suppression window.
    pub async fn update_pool_status(
        &self,
        server: &str,
        status: PoolStatus,
        breaker_state: &str,
        failure_count: u32,
    ) {
        let entry = self.entry(server).await;
        let previous = {
            let mut metrics = entry.lock().await;
            let previous = metrics.status;
            metrics.status = status;
            metrics.breaker_state = breaker_state.to_string();
            metrics.failure_count = failure_count;
            previous
        };

        if status == previous || status == PoolStatus::Healthy {
            return;
        }

        let level = match status {
            PoolStatus::Warning => AlertLevel::Warning,
            PoolStatus::Critical | PoolStatus::Unavailable => AlertLevel::Critical,
            PoolStatus::Healthy => return,
        };

        self.raise_alert(
            level,
            server,
            format!(
                "pool for '{}' is {} (breaker {}, {} consecutive failures)",
                server,
                status.name(),
                breaker_state,
                failure_count
            ),
            format!("{}:status:{}", server, status.name()),
        )
        .await;
    }

    async fn raise_alert(&self, level: AlertLevel, server: &str, message: String, key: String) {
        {
            let mut suppressed = self.suppressed.lock().await;
            if let Some(last) = suppressed.get(&key) {
                if last.elapsed() < self.config.alert_cooldown {
                    return;
                }
            }
            suppressed.insert(key.clone(), Instant::now());
        }

        match level {
            AlertLevel::Info => info!(%server, %message, "alert"),
            AlertLevel::Warning => warn!(%server, %message, "alert"),
            AlertLevel::Critical => error!(%server, %message, "alert"),
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        self.alerts.lock().await.push(Alert {
            level,
            server: server.to_string(),
            message,
            timestamp,
            key,
            raised_at: Instant::now(),
        });
    }

    /// Snapshot one server's metrics, or `None` if it was never registered.
    pub async fn snapshot(&self, server: &str) -> Option<PoolMetricsSnapshot> {
        let entry = {
            let servers = self.servers.read().await;
            servers.get(server).map(Arc::clone)?
        };

        let metrics = entry.lock().await;
        Some(build_snapshot(server, &metrics))
    }

    /// Snapshot every server plus aggregate counters and recent alerts.
    pub async fn summary(&self) -> MetricsSummary {
        let entries: Vec<(String, Arc<Mutex<ServerMetrics>>)> = {
            let servers = self.servers.read().await;
            servers
                .iter()
                .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
                .collect()
        };

        let mut snapshots = Vec::with_capacity(entries.len());
        let mut total_created = 0;
        let mut total_errors = 0;
        for (name, entry) in entries {
            let metrics = entry.lock().await;
            total_created += metrics.connections_created;
            total_errors += metrics.errors;
            snapshots.push(build_snapshot(&name, &metrics));
        }
        snapshots.sort_by(|a, b| a.server.cmp(&b.server));

        MetricsSummary {
            servers: snapshots,
            total_connections_created: total_created,
            total_errors,
            recent_alerts: self.alerts.lock().await.clone(),
        }
    }

    /// Drop alerts and operation samples older than the retention window.
    pub async fn prune(&self) {
        let retention = self.config.retention;
        self.alerts
            .lock()
            .await
            .retain(|a| a.raised_at.elapsed() < retention);

        let entries: Vec<Arc<Mutex<ServerMetrics>>> = {
            let servers = self.servers.read().await;
            servers.values().map(Arc::clone).collect()
        };
        for entry in entries {
            let mut metrics = entry.lock().await;
            metrics
                .samples
                .retain(|s| s.recorded_at.elapsed() < retention);
        }
    }

    /// Spawn the export loop: periodically log a summary and prune old
    /// alerts, until the shutdown signal fires.
    pub fn start_background(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let collector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(collector.config.export_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        collector.prune().await;
                        let summary = collector.summary().await;
                        info!(
                            servers = summary.servers.len(),
                            connections_created = summary.total_connections_created,
                            errors = summary.total_errors,
                            alerts = summary.recent_alerts.len(),
                            "metrics export"
                        );
                        if collector.config.detailed {
                            for snapshot in &summary.servers {
                                info!(
                                    server = %snapshot.server,
                                    status = snapshot.status.name(),
                                    error_rate = snapshot.error_rate,
                                    p95_ms = snapshot.p95_latency_ms,
                                    cache_hit_rate = snapshot.cache_hit_rate,
                                    "server metrics"
                                );
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }
}

fn build_snapshot(server: &str, metrics: &ServerMetrics) -> PoolMetricsSnapshot {
    let lookups = metrics.cache_hits + metrics.cache_misses;
    let cache_hit_rate = if lookups > 0 {
        metrics.cache_hits as f64 / lookups as f64 * 100.0
    } else {
        0.0
    };

    PoolMetricsSnapshot {
        server: server.to_string(),
        connections_created: metrics.connections_created,
        connections_destroyed: metrics.connections_destroyed,
        acquired: metrics.acquired,
        returned: metrics.returned,
        idle_connections: metrics.idle_connections,
        active_connections: metrics.active_connections,
        errors: metrics.errors,
        cache_hit_rate,
        error_rate: error_rate(&metrics.samples),
        avg_latency_ms: avg_latency_ms(&metrics.samples),
        p95_latency_ms: percentile_ms(&metrics.samples, 0.95),
        p99_latency_ms: percentile_ms(&metrics.samples, 0.99),
        status: metrics.status,
        breaker_state: metrics.breaker_state.clone(),
        failure_count: metrics.failure_count,
    }
}

fn error_rate(samples: &VecDeque<OperationSample>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let failures = samples.iter().filter(|s| !s.success).count();
    failures as f64 / samples.len() as f64 * 100.0
}

fn avg_latency_ms(samples: &VecDeque<OperationSample>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let total: f64 = samples.iter().map(|s| s.duration.as_secs_f64()).sum();
    total / samples.len() as f64 * 1000.0
}

fn percentile_ms(samples: &VecDeque<OperationSample>, quantile: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = samples
        .iter()
        .map(|s| s.duration.as_secs_f64() * 1000.0)
        .collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = ((sorted.len() as f64 * quantile).ceil() as usize).max(1) - 1;
    sorted[index.min(sorted.len() - 1)]
}
