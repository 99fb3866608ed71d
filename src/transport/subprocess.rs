//! Subprocess transport: line-delimited JSON-RPC over a child's stdio.

use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{ToolDescriptor, ToolResult, ToolTransport, TransportError};
use crate::catalog::ServerDescriptor;

/// One spawned tool server process. Requests are written as single JSON
/// lines to stdin; responses are matched by request id on stdout. stderr is
/// discarded.
pub struct SubprocessTransport {
    server: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    request_timeout: Duration,
}

impl SubprocessTransport {
    /// Spawn the server process described by the descriptor.
    pub fn spawn(
        descriptor: &ServerDescriptor,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let command = descriptor
            .command
            .as_deref()
            .ok_or_else(|| TransportError::Protocol("subprocess server has no command".into()))?;

        let mut child = Command::new(command)
            .args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Protocol("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Protocol("child stdout unavailable".into()))?;

        debug!(server = %descriptor.name, %command, "spawned tool server process");

        Ok(Self {
            server: descriptor.name.clone(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
            request_timeout,
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

        let mut line = serde_json::to_string(&request)
            .map_err(|e| TransportError::Protocol(format!("failed to encode request: {e}")))?;
        line.push('\n');

        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        // Servers may interleave notifications or log lines; skip anything
        // that is not the response to our id.
        loop {
            let next = timeout(self.request_timeout, self.stdout.next_line())
                .await
                .map_err(|_| TransportError::Timeout(self.request_timeout))??;

            let line = match next {
                Some(line) => line,
                None => return Err(TransportError::Closed),
            };

            if line.trim().is_empty() {
                continue;
            }

            let response: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => {
                    debug!(server = %self.server, "skipping non-JSON output line");
                    continue;
                }
            };

            if response.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }

            if let Some(error) = response.get("error") {
                return Err(TransportError::Protocol(format!(
                    "server returned error: {error}"
                )));
            }

            return response
                .get("result")
                .cloned()
                .ok_or_else(|| TransportError::Protocol("response missing result".into()));
        }
    }
}

#[async_trait::async_trait]
impl ToolTransport for SubprocessTransport {
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
        // Closing stdin tells a well-behaved server to exit.
        let _ = self.stdin.shutdown().await;

        match timeout(Duration::from_secs(2), self.child.wait()).await {
            Ok(status) => {
                debug!(server = %self.server, ?status, "tool server process exited");
            }
            Err(_) => {
                warn!(server = %self.server, "tool server did not exit, killing");
                let _ = self.child.start_kill();
            }
        }

        Ok(())
    }
}
