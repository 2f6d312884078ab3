use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::mcp::{JsonRpcRequest, JsonRpcResponse};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The worker closed its end of the pipe.
    #[error("transport closed")]
    Closed,
    #[error("io: {0}")]
    Io(String),
    #[error("protocol: {0}")]
    Protocol(String),
}

// ---------------------------------------------------------------------------
// McpTransport trait
// ---------------------------------------------------------------------------

/// One request/response exchange with a worker.
///
/// The live implementation is [`StdioTransport`]; tests substitute
/// [`StubWorker`] so the full probe/invoke/suite machinery runs without
/// real subprocesses.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn request(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    async fn notify(&self, req: JsonRpcRequest) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// StdioTransport: newline-delimited JSON-RPC over child stdio
// ---------------------------------------------------------------------------

struct StdioPipes {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
}

/// Line-delimited JSON-RPC over a child process's stdin/stdout.
///
/// One request/response pair at a time: the pipe pair is held under a single
/// mutex for the whole exchange, so concurrent callers are serialized and
/// response ids cannot interleave.
pub struct StdioTransport {
    io: Mutex<StdioPipes>,
}

impl StdioTransport {
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            io: Mutex::new(StdioPipes {
                stdin,
                reader: BufReader::new(stdout),
            }),
        }
    }

    async fn write_line(
        pipes: &mut StdioPipes,
        req: &JsonRpcRequest,
    ) -> Result<(), TransportError> {
        let mut line =
            serde_json::to_string(req).map_err(|e| TransportError::Protocol(e.to_string()))?;
        line.push('\n');
        pipes
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        pipes
            .stdin
            .flush()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        trace!(method = %req.method, "wrote request");
        Ok(())
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let expected_id = req.id.clone();
        let mut pipes = self.io.lock().await;
        Self::write_line(&mut pipes, &req).await?;

        // Read until the response matching our id arrives. Workers may emit
        // log notifications or their own requests in between; skip those.
        loop {
            let mut line = String::new();
            let read = pipes
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            if read == 0 {
                return Err(TransportError::Closed);
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| TransportError::Protocol(format!("unparsable frame: {e}")))?;
            if value.get("method").is_some() {
                debug!("skipping server-initiated frame");
                continue;
            }
            let response: JsonRpcResponse = serde_json::from_value(value)
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            if response.id == expected_id {
                return Ok(response);
            }
            debug!(?response.id, "skipping response for another request id");
        }
    }

    async fn notify(&self, req: JsonRpcRequest) -> Result<(), TransportError> {
        let mut pipes = self.io.lock().await;
        Self::write_line(&mut pipes, &req).await
    }
}

// ---------------------------------------------------------------------------
// StubWorker: scripted in-process worker for tests
// ---------------------------------------------------------------------------

/// In-process stand-in for a worker, routed by JSON-RPC method.
///
/// Knobs cover the failure modes the suites care about: refuse the first N
/// initialize exchanges, report tool errors, add artificial latency. The
/// request counter lets tests assert how many wire calls an operation
/// consumed (or that it consumed none at all).
pub struct StubWorker {
    tools: Vec<String>,
    failing_probes: AtomicU32,
    tool_error: bool,
    latency: Duration,
    requests: AtomicU32,
}

impl StubWorker {
    pub fn new<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tools: tools.into_iter().map(Into::into).collect(),
            failing_probes: AtomicU32::new(0),
            tool_error: false,
            latency: Duration::ZERO,
            requests: AtomicU32::new(0),
        }
    }

    /// Refuse the first `n` initialize exchanges with a transport failure.
    pub fn with_failing_probes(mut self, n: u32) -> Self {
        self.failing_probes = AtomicU32::new(n);
        self
    }

    /// Every tool call returns an `isError` result.
    pub fn with_tool_error(mut self) -> Self {
        self.tool_error = true;
        self
    }

    /// Sleep before answering each request.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of `request` calls that reached this worker.
    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl McpTransport for StubWorker {
    async fn request(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match req.method.as_str() {
            "initialize" => {
                let remaining = self.failing_probes.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failing_probes.store(remaining - 1, Ordering::SeqCst);
                    return Err(TransportError::Io("connection refused".to_string()));
                }
                Ok(JsonRpcResponse::success(
                    req.id,
                    serde_json::json!({
                        "protocolVersion": crate::mcp::MCP_PROTOCOL_VERSION,
                        "capabilities": { "tools": {} },
                        "serverInfo": { "name": "stub-worker", "version": "0.0.0" },
                    }),
                ))
            }
            "tools/list" => {
                let tools: Vec<serde_json::Value> = self
                    .tools
                    .iter()
                    .map(|name| {
                        serde_json::json!({
                            "name": name,
                            "inputSchema": { "type": "object", "properties": {} },
                        })
                    })
                    .collect();
                Ok(JsonRpcResponse::success(
                    req.id,
                    serde_json::json!({ "tools": tools }),
                ))
            }
            "tools/call" => {
                if self.tool_error {
                    return Ok(JsonRpcResponse::success(
                        req.id,
                        serde_json::json!({
                            "content": [{ "type": "text", "text": "stub tool failure" }],
                            "isError": true,
                        }),
                    ));
                }
                Ok(JsonRpcResponse::success(
                    req.id,
                    serde_json::json!({
                        "content": [{ "type": "text", "text": "ok" }],
                        "isError": false,
                    }),
                ))
            }
            other => Err(TransportError::Protocol(format!(
                "stub has no handler for '{other}'"
            ))),
        }
    }

    async fn notify(&self, _req: JsonRpcRequest) -> Result<(), TransportError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp;

    #[tokio::test]
    async fn stub_answers_initialize() {
        let stub = StubWorker::new(["a"]);
        let resp = stub.request(mcp::initialize_request(1)).await.unwrap();
        assert!(!resp.is_error());
        assert_eq!(stub.requests(), 1);
    }

    #[tokio::test]
    async fn stub_failing_probes_then_recovers() {
        let stub = StubWorker::new(["a"]).with_failing_probes(2);
        assert!(stub.request(mcp::initialize_request(1)).await.is_err());
        assert!(stub.request(mcp::initialize_request(2)).await.is_err());
        assert!(stub.request(mcp::initialize_request(3)).await.is_ok());
    }

    #[tokio::test]
    async fn stub_lists_declared_tools() {
        let stub = StubWorker::new(["send_message", "list_channels"]);
        let resp = stub.request(mcp::tools_list_request(1)).await.unwrap();
        let listed: mcp::ToolsListResult =
            serde_json::from_value(resp.result.unwrap()).unwrap();
        let names: Vec<&str> = listed.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["send_message", "list_channels"]);
    }

    #[tokio::test]
    async fn stub_tool_error_mode() {
        let stub = StubWorker::new(["a"]).with_tool_error();
        let resp = stub
            .request(mcp::tools_call_request(1, "a", serde_json::json!({})))
            .await
            .unwrap();
        let result: mcp::ToolCallResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn stub_rejects_unknown_method() {
        let stub = StubWorker::new(["a"]);
        let err = stub
            .request(mcp::JsonRpcRequest::call(1, "resources/list", None))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
