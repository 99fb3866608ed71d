//! Tool server catalog types.
//!
//! A [`ServerDescriptor`] names one external tool server and carries the
//! transport-specific parameters needed to reach it: a command line for
//! subprocess servers, or a URL for stream-endpoint servers. Descriptors are
//! loaded once at startup and handed to the connection manager, which builds
//! one pool per descriptor.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::pool::PoolError;

/// Transport used to reach a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Spawned child process speaking line-delimited JSON-RPC over stdio
    Subprocess,
    /// Network endpoint speaking JSON-RPC over HTTP, with event-stream
    /// response bodies supported
    StreamEndpoint,
}

impl TransportKind {
    /// Human-readable transport name
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Subprocess => "subprocess",
            TransportKind::StreamEndpoint => "stream-endpoint",
        }
    }
}

/// Configuration for a single tool server, immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Server name (unique key). Filled from the map key when loaded from a
    /// catalog file.
    #[serde(default)]
    pub name: String,

    /// Explicit transport kind. Inferred from the populated fields when
    /// omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,

    /// Command to run (subprocess transport)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments for the command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables for the child process, or extra request
    /// headers for a stream endpoint
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Endpoint URL (stream-endpoint transport)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ServerDescriptor {
    /// Create a subprocess server descriptor.
    pub fn subprocess(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            transport: Some(TransportKind::Subprocess),
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            url: None,
        }
    }

    /// Create a stream-endpoint server descriptor.
    pub fn stream_endpoint(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: Some(TransportKind::StreamEndpoint),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
        }
    }

    /// Add an environment variable (or endpoint header).
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Determine the transport kind, inferring from populated fields when no
    /// explicit kind was given.
    pub fn transport_kind(&self) -> TransportKind {
        if let Some(kind) = self.transport {
            return kind;
        }
        if self.url.is_some() {
            TransportKind::StreamEndpoint
        } else {
            TransportKind::Subprocess
        }
    }

    /// Validate that the descriptor carries the fields its transport kind
    /// requires. A bad descriptor is fatal to that server's pool only.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.name.trim().is_empty() {
            return Err(PoolError::Configuration {
                server: "<unnamed>".to_string(),
                reason: "server name is empty".to_string(),
            });
        }

        match self.transport_kind() {
            TransportKind::Subprocess => {
                let command = self.command.as_deref().map(str::trim).unwrap_or("");
                if command.is_empty() {
                    return Err(PoolError::Configuration {
                        server: self.name.clone(),
                        reason: "subprocess server requires a command".to_string(),
                    });
                }
            }
            TransportKind::StreamEndpoint => {
                let url = self.url.as_deref().unwrap_or("");
                if url.is_empty() {
                    return Err(PoolError::Configuration {
                        server: self.name.clone(),
                        reason: "stream-endpoint server requires a url".to_string(),
                    });
                }
                reqwest::Url::parse(url).map_err(|e| PoolError::Configuration {
                    server: self.name.clone(),
                    reason: format!("invalid endpoint url: {e}"),
                })?;
            }
        }

        Ok(())
    }
}

/// A catalog file: map of server name to descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCatalog {
    /// Map of server name to configuration
    #[serde(default)]
    pub servers: HashMap<String, ServerDescriptor>,
}

impl ServerCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server descriptor, keyed by its name.
    pub fn add_server(mut self, descriptor: ServerDescriptor) -> Self {
        self.servers.insert(descriptor.name.clone(), descriptor);
        self
    }

    /// Flatten into descriptors with names filled from the map keys, sorted
    /// by name for deterministic startup ordering.
    pub fn descriptors(&self) -> Vec<ServerDescriptor> {
        let mut out: Vec<ServerDescriptor> = self
            .servers
            .iter()
            .map(|(name, descriptor)| {
                let mut descriptor = descriptor.clone();
                descriptor.name = name.clone();
                descriptor
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

/// Load a catalog from a YAML (or JSON) file.
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<ServerCatalog> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read catalog file: {:?}", path.as_ref()))?;

    let catalog: ServerCatalog =
        serde_yaml::from_str(&content).context("Failed to parse server catalog")?;

    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_catalog() {
        let yaml = r#"
servers:
  github:
    command: npx
    args: ["-y", "@modelcontextprotocol/server-github"]
    env:
      GITHUB_TOKEN: ghp_xxx
  docs:
    url: https://tools.example.com/rpc
"#;

        let catalog: ServerCatalog = serde_yaml::from_str(yaml).unwrap();
        let descriptors = catalog.descriptors();

        assert_eq!(descriptors.len(), 2);
        // Sorted by name
        assert_eq!(descriptors[0].name, "docs");
        assert_eq!(descriptors[1].name, "github");

        assert_eq!(
            descriptors[0].transport_kind(),
            TransportKind::StreamEndpoint
        );
        assert_eq!(descriptors[1].transport_kind(), TransportKind::Subprocess);
        assert_eq!(descriptors[1].command.as_deref(), Some("npx"));
        assert_eq!(
            descriptors[1].env.get("GITHUB_TOKEN"),
            Some(&"ghp_xxx".to_string())
        );
    }

    #[test]
    fn test_builders() {
        let descriptor = ServerDescriptor::subprocess(
            "github",
            "npx",
            vec!["-y".into(), "@modelcontextprotocol/server-github".into()],
        )
        .env_var("GITHUB_TOKEN", "ghp_xxx");

        assert_eq!(descriptor.transport_kind(), TransportKind::Subprocess);
        assert!(descriptor.validate().is_ok());

        let descriptor = ServerDescriptor::stream_endpoint("docs", "https://docs.example.com/rpc");
        assert_eq!(descriptor.transport_kind(), TransportKind::StreamEndpoint);
        assert!(descriptor.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let descriptor = ServerDescriptor {
            name: "broken".to_string(),
            transport: Some(TransportKind::Subprocess),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
        };
        assert!(descriptor.validate().is_err());

        let descriptor = ServerDescriptor {
            name: "broken".to_string(),
            transport: Some(TransportKind::StreamEndpoint),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some("not a url".to_string()),
        };
        assert!(descriptor.validate().is_err());

        let descriptor = ServerDescriptor::subprocess("", "npx", Vec::new());
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_transport_kind_inference() {
        let descriptor = ServerDescriptor {
            name: "inferred".to_string(),
            transport: None,
            command: Some("npx".to_string()),
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
        };
        assert_eq!(descriptor.transport_kind(), TransportKind::Subprocess);

        let descriptor = ServerDescriptor {
            name: "inferred".to_string(),
            transport: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some("https://tools.example.com/rpc".to_string()),
        };
        assert_eq!(descriptor.transport_kind(), TransportKind::StreamEndpoint);
    }
}
