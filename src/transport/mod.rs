//! Transports for talking JSON-RPC to tool servers.
//!
//! A [`ToolTransport`] is one live connection: a spawned child process
//! speaking line-delimited JSON-RPC over stdio, or an HTTP client bound to a
//! stream endpoint. A [`Connector`] knows how to open new transports and is
//! what the pool calls when it needs another connection.

pub mod endpoint;
pub mod subprocess;

pub use endpoint::EndpointTransport;
pub use subprocess::SubprocessTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::catalog::{ServerDescriptor, TransportKind};

/// Transport-level errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Closed,
}

/// A tool advertised by a server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Tool name
    pub name: String,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON schema describing the tool's arguments
    #[serde(default)]
    pub input_schema: Value,
}

/// Result of a tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    /// Content items returned by the tool
    #[serde(default)]
    pub content: Vec<ContentItem>,

    /// Whether the tool reported an application-level error
    #[serde(default)]
    pub is_error: bool,
}

/// One item of tool output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

/// One live connection to a tool server.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// List the tools the server advertises.
    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, TransportError>;

    /// Invoke a tool by name.
    async fn call_tool(&mut self, tool: &str, args: Value) -> Result<ToolResult, TransportError>;

    /// Cheap liveness probe. The default issues a tool listing and discards
    /// the result.
    async fn ping(&mut self) -> Result<(), TransportError> {
        self.list_tools().await.map(|_| ())
    }

    /// Close the connection, releasing any underlying resources.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens new transports for a pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ToolTransport>, TransportError>;
}

/// Connector driven by a [`ServerDescriptor`]: spawns a child process or
/// binds an HTTP client depending on the transport kind, then probes the new
/// connection before handing it to the pool.
pub struct DescriptorConnector {
    descriptor: ServerDescriptor,
    request_timeout: Duration,
}

impl DescriptorConnector {
    pub fn new(descriptor: ServerDescriptor, request_timeout: Duration) -> Self {
        Self {
            descriptor,
            request_timeout,
        }
    }
}

#[async_trait]
impl Connector for DescriptorConnector {
    async fn connect(&self) -> Result<Box<dyn ToolTransport>, TransportError> {
        match self.descriptor.transport_kind() {
            TransportKind::Subprocess => {
                let mut transport =
                    SubprocessTransport::spawn(&self.descriptor, self.request_timeout)?;
                // A process that spawns but cannot answer is not a connection.
                transport.ping().await?;
                Ok(Box::new(transport))
            }
            TransportKind::StreamEndpoint => {
                let mut transport =
                    EndpointTransport::connect(&self.descriptor, self.request_timeout)?;
                transport.ping().await?;
                Ok(Box::new(transport))
            }
        }
    }
}
