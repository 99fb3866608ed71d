//! Pooled facade over one tool server.
//!
//! Each operation borrows a connection from the pool, applies the per-call
//! timeout, records the outcome, and returns the connection: healthy calls
//! go back to the idle set, failed calls destroy the connection and count
//! against the circuit breaker.

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;

use crate::metrics::MetricsCollector;
use crate::pool::{ConnectionPool, PoolError};
use crate::transport::{ToolDescriptor, ToolResult};

pub struct PooledToolFacade {
    pool: Arc<ConnectionPool>,
    metrics: Arc<MetricsCollector>,
}

impl PooledToolFacade {
    pub fn new(pool: Arc<ConnectionPool>, metrics: Arc<MetricsCollector>) -> Self {
        Self { pool, metrics }
    }

    pub fn server(&self) -> &str {
        self.pool.server()
    }

    /// List the tools the server advertises.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, PoolError> {
        let server = self.pool.server().to_string();
        let call_timeout = self.pool.config().circuit_breaker.call_timeout;
        let mut lease = self.pool.acquire(self.pool.config().acquire_timeout).await?;

        let start = Instant::now();
        let outcome = timeout(call_timeout, lease.transport().list_tools()).await;
        let elapsed = start.elapsed();

        match outcome {
            Ok(Ok(tools)) => {
                self.metrics
                    .record_operation_time(&server, "list_tools", elapsed, true)
                    .await;
                lease.release().await;
                Ok(tools)
            }
            Ok(Err(e)) => {
                self.metrics
                    .record_operation_time(&server, "list_tools", elapsed, false)
                    .await;
                let reason = e.to_string();
                lease.discard(&reason).await;
                Err(PoolError::CallFailed {
                    server,
                    tool: "list_tools".to_string(),
                    reason,
                })
            }
            Err(_) => {
                self.metrics
                    .record_operation_time(&server, "list_tools", elapsed, false)
                    .await;
                let reason = format!("timed out after {call_timeout:?}");
                lease.discard(&reason).await;
                Err(PoolError::CallFailed {
                    server,
                    tool: "list_tools".to_string(),
                    reason,
                })
            }
        }
    }

    /// Invoke a tool by name.
    pub async fn call_tool(&self, tool: &str, args: Value) -> Result<ToolResult, PoolError> {
        let server = self.pool.server().to_string();
        let call_timeout = self.pool.config().circuit_breaker.call_timeout;
        let mut lease = self.pool.acquire(self.pool.config().acquire_timeout).await?;

        let start = Instant::now();
        let outcome = timeout(call_timeout, lease.transport().call_tool(tool, args)).await;
        let elapsed = start.elapsed();

        match outcome {
            Ok(Ok(result)) => {
                self.metrics
                    .record_operation_time(&server, "call_tool", elapsed, true)
                    .await;
                lease.release().await;
                Ok(result)
            }
            Ok(Err(e)) => {
                self.metrics
                    .record_operation_time(&server, "call_tool", elapsed, false)
                    .await;
                let reason = e.to_string();
                lease.discard(&reason).await;
                Err(PoolError::CallFailed {
                    server,
                    tool: tool.to_string(),
                    reason,
                })
            }
            Err(_) => {
                self.metrics
                    .record_operation_time(&server, "call_tool", elapsed, false)
                    .await;
                let reason = format!("timed out after {call_timeout:?}");
                lease.discard(&reason).await;
                Err(PoolError::CallFailed {
                    server,
                    tool: tool.to_string(),
                    reason,
                })
            }
        }
    }

    /// Look up one tool's input schema, `None` if the server does not
    /// advertise it.
    pub async fn get_tool_schema(&self, tool: &str) -> Result<Option<Value>, PoolError> {
        let tools = self.list_tools().await?;
        Ok(tools
            .into_iter()
            .find(|t| t.name == tool)
            .map(|t| t.input_schema))
    }
}
