use std::sync::atomic::{AtomicI64, Ordering};

use tracing::{debug, warn};

use crate::error::HarnessError;
use crate::launcher::WorkerHandle;
use crate::mcp::{self, ToolCallResult, ToolDescriptor, ToolsListResult};

// ---------------------------------------------------------------------------
// ToolInvoker
// ---------------------------------------------------------------------------

/// Issues structured tool calls against a worker and validates the response
/// shape. Retry and timeout semantics are identical in shape to the health
/// prober's: per-attempt timeout, policy-driven backoff, exhaustion reported
/// with the last observed diagnostic.
pub struct ToolInvoker {
    next_id: AtomicI64,
}

/// One failed call attempt: human-readable reason plus the raw payload.
struct CallFailure {
    reason: String,
    payload: serde_json::Value,
}

impl ToolInvoker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }

    /// Invoke `tool` on the worker behind `handle`.
    ///
    /// Tools outside the service's declared list are rejected immediately
    /// with [`HarnessError::UnknownTool`], before any transport call, so the
    /// mismatch costs no retries and no wire traffic.
    pub async fn invoke(
        &self,
        handle: &WorkerHandle,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, HarnessError> {
        let spec = handle.spec();
        if !spec.declares_tool(tool) {
            return Err(HarnessError::UnknownTool {
                service: spec.name.clone(),
                tool: tool.to_string(),
            });
        }

        let policy = &spec.retry;
        let timeout = spec.timeouts.tool_call;
        let mut last: Option<CallFailure> = None;

        for attempt in 1..=policy.max_attempts() {
            match tokio::time::timeout(timeout, self.call_once(handle, tool, &arguments)).await {
                Ok(Ok(result)) => {
                    debug!(service = %spec.name, tool, attempt, "tool call succeeded");
                    return Ok(result);
                }
                Ok(Err(failure)) => {
                    debug!(service = %spec.name, tool, attempt, reason = %failure.reason, "tool call failed");
                    last = Some(failure);
                }
                Err(_) => {
                    debug!(service = %spec.name, tool, attempt, ?timeout, "tool call timed out");
                    last = Some(CallFailure {
                        reason: format!("attempt timed out after {timeout:?}"),
                        payload: serde_json::Value::Null,
                    });
                }
            }
            if let Some(delay) = policy.backoff_after(attempt) {
                tokio::time::sleep(delay).await;
            }
        }

        let failure = last.unwrap_or_else(|| CallFailure {
            reason: "no attempt was made".to_string(),
            payload: serde_json::Value::Null,
        });
        warn!(
            service = %spec.name,
            tool,
            attempts = policy.max_attempts(),
            reason = %failure.reason,
            "tool invocation exhausted retries"
        );
        Err(HarnessError::ToolInvocation {
            service: spec.name.clone(),
            tool: tool.to_string(),
            attempts: policy.max_attempts(),
            message: failure.reason,
            detail: failure.payload,
        })
    }

    /// Fetch the worker's advertised tools (`tools/list`), under the same
    /// timeout and retry policy as a tool call.
    pub async fn list_tools(
        &self,
        handle: &WorkerHandle,
    ) -> Result<Vec<ToolDescriptor>, HarnessError> {
        let spec = handle.spec();
        let policy = &spec.retry;
        let timeout = spec.timeouts.tool_call;
        let mut last: Option<CallFailure> = None;

        for attempt in 1..=policy.max_attempts() {
            match tokio::time::timeout(timeout, self.list_once(handle)).await {
                Ok(Ok(tools)) => return Ok(tools),
                Ok(Err(failure)) => last = Some(failure),
                Err(_) => {
                    last = Some(CallFailure {
                        reason: format!("attempt timed out after {timeout:?}"),
                        payload: serde_json::Value::Null,
                    })
                }
            }
            if let Some(delay) = policy.backoff_after(attempt) {
                tokio::time::sleep(delay).await;
            }
        }

        let failure = last.unwrap_or_else(|| CallFailure {
            reason: "no attempt was made".to_string(),
            payload: serde_json::Value::Null,
        });
        Err(HarnessError::ToolInvocation {
            service: spec.name.clone(),
            tool: "tools/list".to_string(),
            attempts: policy.max_attempts(),
            message: failure.reason,
            detail: failure.payload,
        })
    }

    async fn call_once(
        &self,
        handle: &WorkerHandle,
        tool: &str,
        arguments: &serde_json::Value,
    ) -> Result<ToolCallResult, CallFailure> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = handle
            .transport()
            .request(mcp::tools_call_request(id, tool, arguments.clone()))
            .await
            .map_err(|e| CallFailure {
                reason: e.to_string(),
                payload: serde_json::Value::Null,
            })?;

        if let Some(err) = response.error {
            let payload = serde_json::to_value(&err).unwrap_or(serde_json::Value::Null);
            return Err(CallFailure {
                reason: format!("rpc error {}: {}", err.code, err.message),
                payload,
            });
        }
        let raw = response.result.ok_or_else(|| CallFailure {
            reason: "tool response carries no result".to_string(),
            payload: serde_json::Value::Null,
        })?;
        let result: ToolCallResult =
            serde_json::from_value(raw.clone()).map_err(|e| CallFailure {
                reason: format!("malformed tool result: {e}"),
                payload: raw.clone(),
            })?;
        result.validate_shape().map_err(|reason| CallFailure {
            reason,
            payload: raw,
        })?;
        Ok(result)
    }

    async fn list_once(&self, handle: &WorkerHandle) -> Result<Vec<ToolDescriptor>, CallFailure> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = handle
            .transport()
            .request(mcp::tools_list_request(id))
            .await
            .map_err(|e| CallFailure {
                reason: e.to_string(),
                payload: serde_json::Value::Null,
            })?;
        if let Some(err) = response.error {
            let payload = serde_json::to_value(&err).unwrap_or(serde_json::Value::Null);
            return Err(CallFailure {
                reason: format!("rpc error {}: {}", err.code, err.message),
                payload,
            });
        }
        let raw = response.result.ok_or_else(|| CallFailure {
            reason: "tools/list response carries no result".to_string(),
            payload: serde_json::Value::Null,
        })?;
        let listed: ToolsListResult = serde_json::from_value(raw.clone()).map_err(|e| CallFailure {
            reason: format!("malformed tools/list result: {e}"),
            payload: raw,
        })?;
        Ok(listed.tools)
    }
}

impl Default for ToolInvoker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::transport::{McpTransport, StubWorker};
    use attest_core::config::{HarnessConfig, ServiceSpec};

    fn spec(tools: &[&str], max_retries: u32) -> ServiceSpec {
        let tool_list = tools
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let toml = format!(
            "[services.svc]\ncommand = \"worker\"\ntools = [{tool_list}]\n\
             tool_call_timeout_ms = 200\n\n[services.svc.retry]\n\
             max_retries = {max_retries}\nbase_delay_ms = 1\n"
        );
        let config = HarnessConfig::load_str(&toml).unwrap();
        config.resolve().unwrap().remove("svc").unwrap()
    }

    #[tokio::test]
    async fn undeclared_tool_never_reaches_the_wire() {
        let stub = Arc::new(StubWorker::new(["declared"]));
        let handle = crate::launcher::WorkerHandle::detached(
            spec(&["declared"], 3),
            stub.clone() as Arc<dyn McpTransport>,
        );
        let invoker = ToolInvoker::new();

        let err = invoker
            .invoke(&handle, "undeclared", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::UnknownTool { .. }));
        assert_eq!(stub.requests(), 0, "rejection must consume no wire calls");
    }

    #[tokio::test]
    async fn declared_tool_invocation_succeeds() {
        let stub = Arc::new(StubWorker::new(["ping"]));
        let handle = crate::launcher::WorkerHandle::detached(
            spec(&["ping"], 3),
            stub.clone() as Arc<dyn McpTransport>,
        );
        let invoker = ToolInvoker::new();

        let result = invoker
            .invoke(&handle, "ping", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result.text_content(), Some("ok"));
        assert_eq!(stub.requests(), 1);
    }

    #[tokio::test]
    async fn tool_error_result_exhausts_retries_with_payload() {
        let stub = Arc::new(StubWorker::new(["ping"]).with_tool_error());
        let handle = crate::launcher::WorkerHandle::detached(
            spec(&["ping"], 2),
            stub.clone() as Arc<dyn McpTransport>,
        );
        let invoker = ToolInvoker::new();

        let err = invoker
            .invoke(&handle, "ping", serde_json::json!({}))
            .await
            .unwrap_err();
        match err {
            HarnessError::ToolInvocation {
                attempts,
                message,
                detail,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert!(message.contains("stub tool failure"));
                assert_eq!(detail["isError"], serde_json::json!(true));
            }
            other => panic!("expected ToolInvocation, got {other:?}"),
        }
        assert_eq!(stub.requests(), 3);
    }

    #[tokio::test]
    async fn slow_tool_call_times_out_per_attempt() {
        let stub = Arc::new(StubWorker::new(["ping"]).with_latency(Duration::from_secs(5)));
        let handle = crate::launcher::WorkerHandle::detached(
            spec(&["ping"], 0),
            stub.clone() as Arc<dyn McpTransport>,
        );
        let invoker = ToolInvoker::new();

        let err = invoker
            .invoke(&handle, "ping", serde_json::json!({}))
            .await
            .unwrap_err();
        match err {
            HarnessError::ToolInvocation { message, .. } => {
                assert!(message.contains("timed out"));
            }
            other => panic!("expected ToolInvocation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_tools_returns_descriptors() {
        let stub = Arc::new(StubWorker::new(["a", "b"]));
        let handle = crate::launcher::WorkerHandle::detached(
            spec(&["a", "b"], 1),
            stub.clone() as Arc<dyn McpTransport>,
        );
        let invoker = ToolInvoker::new();

        let tools = invoker.list_tools(&handle).await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
