//! Stream-endpoint transport: JSON-RPC over HTTP POST.
//!
//! Endpoints may answer with a plain JSON body or with an event stream; both
//! are handled by [`parse_rpc_body`].

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{ToolDescriptor, ToolResult, ToolTransport, TransportError};
use crate::catalog::ServerDescriptor;

/// One HTTP client bound to a tool server endpoint.
pub struct EndpointTransport {
    server: String,
    url: String,
    client: reqwest::Client,
    next_id: u64,
}

impl EndpointTransport {
    /// Build a client for the endpoint described by the descriptor. The
    /// descriptor's `env` entries become request headers; `API_KEY` is
    /// special-cased into a bearer token.
    pub fn connect(
        descriptor: &ServerDescriptor,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let url = descriptor
            .url
            .as_deref()
            .ok_or_else(|| TransportError::Protocol("stream-endpoint server has no url".into()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );

        for (key, value) in &descriptor.env {
            if key == "API_KEY" {
                let bearer = format!("Bearer {value}");
                let header = HeaderValue::from_str(&bearer).map_err(|e| {
                    TransportError::Protocol(format!("invalid API_KEY value: {e}"))
                })?;
                headers.insert(AUTHORIZATION, header);
                continue;
            }

            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| TransportError::Protocol(format!("invalid header '{key}': {e}")))?;
            let header = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Protocol(format!("invalid header '{key}': {e}")))?;
            headers.insert(name, header);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Protocol(format!("failed to build client: {e}")))?;

        Ok(Self {
            server: descriptor.name.clone(),
            url: url.to_string(),
            client,
            next_id: 0,
        })
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, TransportError> {
        self.next_id += 1;
        let id = self.next_id;

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(server = %self.server, %method, "sending endpoint request");

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Protocol(format!(
                "endpoint returned HTTP {status}"
            )));
        }

        let body = response.text().await.map_err(map_reqwest_error)?;
        let response = parse_rpc_body(&body)?;

        if let Some(error) = response.get("error") {
            return Err(TransportError::Protocol(format!(
                "server returned error: {error}"
            )));
        }

        response
            .get("result")
            .cloned()
            .ok_or_else(|| TransportError::Protocol("response missing result".into()))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(Duration::ZERO)
    } else {
        TransportError::Protocol(e.to_string())
    }
}

/// Parse an endpoint response body: a plain JSON document, or an event
/// stream whose `data:` lines carry the JSON-RPC response.
fn parse_rpc_body(body: &str) -> Result<Value, TransportError> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return Ok(value);
    }

    for line in body.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            if let Ok(value) = serde_json::from_str::<Value>(data.trim()) {
                return Ok(value);
            }
        }
    }

    Err(TransportError::Protocol(
        "endpoint response is neither JSON nor an event stream".into(),
    ))
}

#[async_trait::async_trait]
impl ToolTransport for EndpointTransport {
    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let result = self.request("tools/list", json!({})).await?;

        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| TransportError::Protocol("tools/list result missing tools".into()))?;

        serde_json::from_value(tools)
            .map_err(|e| TransportError::Protocol(format!("invalid tool listing: {e}")))
    }

    async fn call_tool(&mut self, tool: &str, args: Value) -> Result<ToolResult, TransportError> {
        let result = self
            .request("tools/call", json!({ "name": tool, "arguments": args }))
            .await?;

        serde_json::from_value(result)
            .map_err(|e| TransportError::Protocol(format!("invalid tool result: {e}")))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Stateless HTTP client, nothing to tear down.
        Ok(())
    }
}
