//! Connection manager: one pool per configured tool server.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::catalog::ServerDescriptor;
use crate::config::Config;
use crate::facade::PooledToolFacade;
use crate::metrics::{MetricsCollector, MetricsConfig, MetricsSummary, PoolMetricsSnapshot};
use crate::pool::{ConnectionLease, ConnectionPool, PoolConfig, PoolError};
use crate::transport::DescriptorConnector;

/// Owns every connection pool and the shared metrics collector.
///
/// Pools are created from server descriptors at initialization and share one
/// pool configuration. An optional global semaphore caps connections across
/// all pools.
pub struct ConnectionManager {
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
    metrics: Arc<MetricsCollector>,
    pool_config: PoolConfig,
    global_limit: Option<Arc<Semaphore>>,
    shutdown_tx: watch::Sender<bool>,
    metrics_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        pool_config: PoolConfig,
        metrics_config: MetricsConfig,
        max_total_connections: usize,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            pools: RwLock::new(HashMap::new()),
            metrics: Arc::new(MetricsCollector::new(metrics_config)),
            pool_config,
            global_limit: if max_total_connections > 0 {
                Some(Arc::new(Semaphore::new(max_total_connections)))
            } else {
                None
            },
            shutdown_tx,
            metrics_task: Mutex::new(None),
        }
    }

    /// Build a manager from a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.pool.to_pool_config(),
            config.metrics.to_metrics_config(),
            config.pool.max_total_connections,
        )
    }

    /// Start a pool for every descriptor. A server that fails to start is
    /// logged and skipped so one bad entry does not take down the rest;
    /// failing every server is an error.
    pub async fn initialize(
        self: &Arc<Self>,
        descriptors: Vec<ServerDescriptor>,
    ) -> Result<(), PoolError> {
        {
            let mut task = self.metrics_task.lock().await;
            if task.is_none() {
                *task = Some(self.metrics.start_background(self.shutdown_tx.subscribe()));
            }
        }

        let configured = descriptors.len();
        let mut started = 0;
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            match self.add_server(descriptor).await {
                Ok(()) => started += 1,
                Err(e) => {
                    error!(server = %name, error = %e, "failed to start server pool");
                }
            }
        }

        info!(started, configured, "connection manager initialized");

        if started == 0 && configured > 0 {
            return Err(PoolError::Configuration {
                server: "<all>".to_string(),
                reason: "no server pool could be started".to_string(),
            });
        }
        Ok(())
    }

    /// Validate a descriptor and start a pool for it.
    pub async fn add_server(self: &Arc<Self>, descriptor: ServerDescriptor) -> Result<(), PoolError> {
        descriptor.validate()?;
        let name = descriptor.name.clone();

        {
            let pools = self.pools.read().await;
            if pools.contains_key(&name) {
                return Err(PoolError::Configuration {
                    server: name,
                    reason: "server already registered".to_string(),
                });
            }
        }

        self.metrics.register_server(&name).await;

        let connector = Arc::new(DescriptorConnector::new(
            descriptor,
            self.pool_config.circuit_breaker.call_timeout,
        ));
        let pool = Arc::new(ConnectionPool::new(
            name.clone(),
            self.pool_config.clone(),
            connector,
            Arc::clone(&self.metrics),
            self.global_limit.clone(),
        ));
        pool.start().await;

        self.pools.write().await.insert(name, pool);
        Ok(())
    }

    pub async fn pool(&self, server: &str) -> Result<Arc<ConnectionPool>, PoolError> {
        let pools = self.pools.read().await;
        pools
            .get(server)
            .map(Arc::clone)
            .ok_or_else(|| PoolError::ServerNotFound(server.to_string()))
    }

    /// Acquire a connection to the named server.
    pub async fn acquire(&self, server: &str) -> Result<ConnectionLease, PoolError> {
        let pool = self.pool(server).await?;
        pool.acquire(self.pool_config.acquire_timeout).await
    }

    /// Build a facade bound to the named server's pool.
    pub async fn facade(&self, server: &str) -> Result<PooledToolFacade, PoolError> {
        let pool = self.pool(server).await?;
        Ok(PooledToolFacade::new(pool, Arc::clone(&self.metrics)))
    }

    /// Names of all registered servers, sorted.
    pub async fn servers(&self) -> Vec<String> {
        let pools = self.pools.read().await;
        let mut names: Vec<String> = pools.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn server_metrics(&self, server: &str) -> Option<PoolMetricsSnapshot> {
        self.metrics.snapshot(server).await
    }

    pub async fn metrics_summary(&self) -> MetricsSummary {
        self.metrics.summary().await
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Stop every pool and the metrics export loop.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.metrics_task.lock().await.take() {
            let _ = task.await;
        }

        let pools: Vec<Arc<ConnectionPool>> = {
            let mut map = self.pools.write().await;
            map.drain().map(|(_, pool)| pool).collect()
        };
        join_all(pools.iter().map(|pool| pool.stop())).await;

        info!("connection manager shut down");
    }
}
