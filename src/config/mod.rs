use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::catalog::{ServerCatalog, ServerDescriptor};
use crate::metrics::MetricsConfig;
use crate::pool::{CircuitBreakerConfig, PoolConfig};

/// Circuit breaker settings as they appear in configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Whether the circuit breaker is enabled
    #[serde(default = "default_breaker_enabled")]
    pub enabled: bool,

    /// Consecutive failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds to wait before allowing a trial call after opening
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,

    /// Consecutive successes to close the circuit from half-open
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Maximum trial calls admitted while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,

    /// Per-call timeout in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_breaker_enabled() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    30
}

fn default_success_threshold() -> u32 {
    2
}

fn default_half_open_max_calls() -> u32 {
    3
}

fn default_call_timeout() -> u64 {
    30
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: default_breaker_enabled(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
            success_threshold: default_success_threshold(),
            half_open_max_calls: default_half_open_max_calls(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

/// Connection pool settings as they appear in configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Minimum connections kept warm per server
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// Maximum connections per server
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Connection establishment timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout waiting for a pooled connection in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Idle connections older than this are evicted, in seconds
    #[serde(default = "default_idle_eviction_age")]
    pub idle_eviction_age_secs: u64,

    /// Probe idle connections before handing them out
    #[serde(default = "default_validate_on_acquire")]
    pub validate_on_acquire: bool,

    /// Connection-creation retries
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base backoff between creation retries, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Cap on the exponential retry backoff, in seconds
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,

    /// Whether the background health-check loop runs
    #[serde(default = "default_health_check_enabled")]
    pub health_check_enabled: bool,

    /// Health check interval in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Per-probe health check timeout in seconds
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,

    /// Recent error rate (percent) at which a pool reports Warning
    #[serde(default = "default_warning_error_rate")]
    pub warning_error_rate: f64,

    /// Recent error rate (percent) at which a pool reports Critical
    #[serde(default = "default_critical_error_rate")]
    pub critical_error_rate: f64,

    /// Cap on connections across all pools (0 = unlimited)
    #[serde(default)]
    pub max_total_connections: usize,

    /// Force one connection per server (constrained/dev environments)
    #[serde(default)]
    pub single_connection_mode: bool,

    /// Circuit breaker settings
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
}

fn default_min_connections() -> usize {
    1
}

fn default_max_connections() -> usize {
    4
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_idle_eviction_age() -> u64 {
    300
}

fn default_validate_on_acquire() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_retry_delay() -> u64 {
    10
}

fn default_health_check_enabled() -> bool {
    true
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_health_check_timeout() -> u64 {
    5
}

fn default_warning_error_rate() -> f64 {
    20.0
}

fn default_critical_error_rate() -> f64 {
    50.0
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
            acquire_timeout_secs: default_acquire_timeout(),
            idle_eviction_age_secs: default_idle_eviction_age(),
            validate_on_acquire: default_validate_on_acquire(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_delay_secs: default_max_retry_delay(),
            health_check_enabled: default_health_check_enabled(),
            health_check_interval_secs: default_health_check_interval(),
            health_check_timeout_secs: default_health_check_timeout(),
            warning_error_rate: default_warning_error_rate(),
            critical_error_rate: default_critical_error_rate(),
            max_total_connections: 0,
            single_connection_mode: false,
            circuit_breaker: BreakerSettings::default(),
        }
    }
}

impl PoolSettings {
    /// Build the runtime pool configuration. Single-connection mode forces
    /// one connection per server.
    pub fn to_pool_config(&self) -> PoolConfig {
        let (min, max) = if self.single_connection_mode {
            (self.min_connections.min(1), 1)
        } else {
            (self.min_connections, self.max_connections)
        };

        PoolConfig {
            min_connections: min,
            max_connections: max,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            idle_eviction_age: Duration::from_secs(self.idle_eviction_age_secs),
            validate_on_acquire: self.validate_on_acquire,
            retry_attempts: self.retry_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_retry_delay: Duration::from_secs(self.max_retry_delay_secs),
            health_check_enabled: self.health_check_enabled,
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            health_check_timeout: Duration::from_secs(self.health_check_timeout_secs),
            warning_error_rate: self.warning_error_rate,
            critical_error_rate: self.critical_error_rate,
            circuit_breaker: CircuitBreakerConfig {
                enabled: self.circuit_breaker.enabled,
                failure_threshold: self.circuit_breaker.failure_threshold,
                recovery_timeout: Duration::from_secs(self.circuit_breaker.recovery_timeout_secs),
                success_threshold: self.circuit_breaker.success_threshold,
                half_open_max_calls: self.circuit_breaker.half_open_max_calls,
                call_timeout: Duration::from_secs(self.circuit_breaker.call_timeout_secs),
            },
        }
    }
}

/// Metrics settings as they appear in configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Interval between metrics export/prune cycles, in seconds
    #[serde(default = "default_export_interval")]
    pub export_interval_secs: u64,

    /// Log per-server detail on each export cycle
    #[serde(default)]
    pub detailed: bool,

    /// How long samples and alerts are retained, in seconds
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_export_interval() -> u64 {
    60
}

fn default_retention() -> u64 {
    24 * 60 * 60
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            export_interval_secs: default_export_interval(),
            detailed: false,
            retention_secs: default_retention(),
        }
    }
}

impl MetricsSettings {
    /// Build the runtime metrics configuration.
    pub fn to_metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            enabled: self.enabled,
            export_interval: Duration::from_secs(self.export_interval_secs),
            detailed: self.detailed,
            retention: Duration::from_secs(self.retention_secs),
            ..MetricsConfig::default()
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Map of server name to descriptor
    #[serde(default)]
    pub servers: HashMap<String, ServerDescriptor>,

    /// Connection pool settings
    #[serde(default)]
    pub pool: PoolSettings,

    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Server descriptors with names filled from the map keys, sorted by
    /// name for deterministic startup ordering.
    pub fn descriptors(&self) -> Vec<ServerDescriptor> {
        ServerCatalog {
            servers: self.servers.clone(),
        }
        .descriptors()
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Recognized variables:
/// - TOOLPOOL_SERVERS (comma-separated `name=url` stream endpoints)
/// - TOOLPOOL_MIN_CONNECTIONS / TOOLPOOL_MAX_CONNECTIONS
/// - TOOLPOOL_CONNECT_TIMEOUT / TOOLPOOL_ACQUIRE_TIMEOUT (seconds)
/// - TOOLPOOL_IDLE_EVICTION_AGE (seconds)
/// - TOOLPOOL_VALIDATE_ON_ACQUIRE
/// - TOOLPOOL_RETRY_ATTEMPTS / TOOLPOOL_RETRY_BACKOFF_MS / TOOLPOOL_MAX_RETRY_DELAY
/// - TOOLPOOL_HEALTH_CHECK_ENABLED / _INTERVAL / _TIMEOUT
/// - TOOLPOOL_WARNING_ERROR_RATE / TOOLPOOL_CRITICAL_ERROR_RATE
/// - TOOLPOOL_CB_ENABLED / _FAILURE_THRESHOLD / _RECOVERY_TIMEOUT /
///   _SUCCESS_THRESHOLD / _HALF_OPEN_MAX_CALLS / _CALL_TIMEOUT
/// - TOOLPOOL_METRICS_ENABLED / _EXPORT_INTERVAL / _DETAILED
/// - TOOLPOOL_MAX_TOTAL_CONNECTIONS / TOOLPOOL_SINGLE_CONNECTION_MODE
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    let servers_str =
        std::env::var("TOOLPOOL_SERVERS").context("TOOLPOOL_SERVERS environment variable not set")?;

    for entry in servers_str.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, url) = entry
            .split_once('=')
            .context(format!("TOOLPOOL_SERVERS entry '{entry}' is not name=url"))?;
        let name = name.trim();
        let url = url.trim();
        if name.is_empty() || url.is_empty() {
            anyhow::bail!("TOOLPOOL_SERVERS entry '{entry}' is not name=url");
        }
        config
            .servers
            .insert(name.to_string(), ServerDescriptor::stream_endpoint(name, url));
    }

    if config.servers.is_empty() {
        anyhow::bail!("TOOLPOOL_SERVERS contains no valid servers");
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Apply environment-variable overrides for the pool/metrics settings.
pub fn apply_env_overrides(config: &mut Config) {
    let pool = &mut config.pool;
    env_override("TOOLPOOL_MIN_CONNECTIONS", &mut pool.min_connections);
    env_override("TOOLPOOL_MAX_CONNECTIONS", &mut pool.max_connections);
    env_override("TOOLPOOL_CONNECT_TIMEOUT", &mut pool.connect_timeout_secs);
    env_override("TOOLPOOL_ACQUIRE_TIMEOUT", &mut pool.acquire_timeout_secs);
    env_override("TOOLPOOL_IDLE_EVICTION_AGE", &mut pool.idle_eviction_age_secs);
    env_override("TOOLPOOL_VALIDATE_ON_ACQUIRE", &mut pool.validate_on_acquire);
    env_override("TOOLPOOL_RETRY_ATTEMPTS", &mut pool.retry_attempts);
    env_override("TOOLPOOL_RETRY_BACKOFF_MS", &mut pool.retry_backoff_ms);
    env_override("TOOLPOOL_MAX_RETRY_DELAY", &mut pool.max_retry_delay_secs);
    env_override("TOOLPOOL_HEALTH_CHECK_ENABLED", &mut pool.health_check_enabled);
    env_override(
        "TOOLPOOL_HEALTH_CHECK_INTERVAL",
        &mut pool.health_check_interval_secs,
    );
    env_override(
        "TOOLPOOL_HEALTH_CHECK_TIMEOUT",
        &mut pool.health_check_timeout_secs,
    );
    env_override("TOOLPOOL_WARNING_ERROR_RATE", &mut pool.warning_error_rate);
    env_override("TOOLPOOL_CRITICAL_ERROR_RATE", &mut pool.critical_error_rate);
    env_override("TOOLPOOL_MAX_TOTAL_CONNECTIONS", &mut pool.max_total_connections);
    env_override(
        "TOOLPOOL_SINGLE_CONNECTION_MODE",
        &mut pool.single_connection_mode,
    );

    let breaker = &mut pool.circuit_breaker;
    env_override("TOOLPOOL_CB_ENABLED", &mut breaker.enabled);
    env_override("TOOLPOOL_CB_FAILURE_THRESHOLD", &mut breaker.failure_threshold);
    env_override("TOOLPOOL_CB_RECOVERY_TIMEOUT", &mut breaker.recovery_timeout_secs);
    env_override("TOOLPOOL_CB_SUCCESS_THRESHOLD", &mut breaker.success_threshold);
    env_override(
        "TOOLPOOL_CB_HALF_OPEN_MAX_CALLS",
        &mut breaker.half_open_max_calls,
    );
    env_override("TOOLPOOL_CB_CALL_TIMEOUT", &mut breaker.call_timeout_secs);

    let metrics = &mut config.metrics;
    env_override("TOOLPOOL_METRICS_ENABLED", &mut metrics.enabled);
    env_override("TOOLPOOL_METRICS_EXPORT_INTERVAL", &mut metrics.export_interval_secs);
    env_override("TOOLPOOL_METRICS_DETAILED", &mut metrics.detailed);
}

fn env_override<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(value) = raw.parse() {
            *target = value;
        }
    }
}

/// Load configuration from file or environment
///
/// Tries a YAML file first when a path is given (environment variables still
/// override individual settings), otherwise builds the whole configuration
/// from the environment.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        let mut config = load_from_yaml(path)?;
        apply_env_overrides(&mut config);
        Ok(config)
    } else {
        load_from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TransportKind;

    #[test]
    fn test_load_from_yaml() {
        let yaml = r#"
servers:
  github:
    command: npx
    args: ["-y", "@modelcontextprotocol/server-github"]
  docs:
    url: https://tools.example.com/rpc

pool:
  min_connections: 2
  max_connections: 8
  acquire_timeout_secs: 10
  circuit_breaker:
    failure_threshold: 3
    recovery_timeout_secs: 15

metrics:
  export_interval_secs: 30
  detailed: true
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.pool.min_connections, 2);
        assert_eq!(config.pool.max_connections, 8);
        assert_eq!(config.pool.acquire_timeout_secs, 10);
        assert_eq!(config.pool.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.pool.circuit_breaker.recovery_timeout_secs, 15);
        assert!(config.metrics.detailed);

        let descriptors = config.descriptors();
        assert_eq!(descriptors[0].name, "docs");
        assert_eq!(descriptors[0].transport_kind(), TransportKind::StreamEndpoint);
    }

    #[test]
    fn test_default_values() {
        let yaml = r#"
servers:
  docs:
    url: https://tools.example.com/rpc
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.pool.min_connections, 1);
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.pool.connect_timeout_secs, 30);
        assert_eq!(config.pool.retry_attempts, 3);
        assert!(config.pool.validate_on_acquire);
        assert!(config.pool.health_check_enabled);
        assert_eq!(config.pool.warning_error_rate, 20.0);
        assert_eq!(config.pool.critical_error_rate, 50.0);
        assert_eq!(config.pool.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.pool.circuit_breaker.success_threshold, 2);
        assert_eq!(config.metrics.export_interval_secs, 60);
        assert_eq!(config.metrics.retention_secs, 24 * 60 * 60);
    }

    #[test]
    fn test_single_connection_mode_clamps_pool() {
        let settings = PoolSettings {
            min_connections: 3,
            max_connections: 10,
            single_connection_mode: true,
            ..PoolSettings::default()
        };

        let pool_config = settings.to_pool_config();
        assert_eq!(pool_config.max_connections, 1);
        assert_eq!(pool_config.min_connections, 1);
    }

    #[test]
    fn test_to_pool_config_durations() {
        let settings = PoolSettings {
            connect_timeout_secs: 7,
            retry_backoff_ms: 250,
            ..PoolSettings::default()
        };

        let pool_config = settings.to_pool_config();
        assert_eq!(pool_config.connect_timeout, Duration::from_secs(7));
        assert_eq!(pool_config.retry_backoff, Duration::from_millis(250));
    }
}
