use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use attest_core::retry::RetryPolicy;
use attest_core::types::HealthState;

use crate::error::HarnessError;
use crate::launcher::WorkerHandle;
use crate::mcp::{self, InitializeResult};

// ---------------------------------------------------------------------------
// ProbeReport
// ---------------------------------------------------------------------------

/// Outcome of one health probe, including how many attempts it took.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub state: HealthState,
    pub attempts: u32,
    pub elapsed: Duration,
    pub last_error: Option<String>,
    pub server: Option<String>,
}

impl ProbeReport {
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }

    /// Failed probes map onto the connection-timeout error of the taxonomy.
    pub fn as_error(&self, service: &str) -> Option<HarnessError> {
        if self.is_healthy() {
            None
        } else {
            Some(HarnessError::ConnectionTimeout {
                service: service.to_string(),
                attempts: self.attempts,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// HealthChecker
// ---------------------------------------------------------------------------

/// Probes a worker for readiness with the MCP `initialize` exchange.
pub struct HealthChecker {
    next_id: AtomicI64,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }

    /// Probe `handle` until the worker answers `initialize` or the retry
    /// policy is exhausted.
    ///
    /// Each attempt runs under `timeout`; an attempt that exceeds it is a
    /// failed attempt consuming one retry, never a fatal error. A permanent
    /// failure under `max_retries = r` makes exactly `r + 1` attempts and
    /// leaves the handle `Unhealthy` with the last observed error.
    pub async fn probe(
        &self,
        handle: &WorkerHandle,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> ProbeReport {
        let service = handle.spec().name.clone();
        handle.set_health(HealthState::Starting).await;
        let started = Instant::now();
        let mut last_error = None;

        for attempt in 1..=policy.max_attempts() {
            match tokio::time::timeout(timeout, self.initialize_once(handle)).await {
                Ok(Ok(init)) => {
                    handle.set_health(HealthState::Healthy).await;
                    info!(
                        service = %service,
                        attempt,
                        server = %init.server_info.name,
                        "worker healthy"
                    );
                    return ProbeReport {
                        state: HealthState::Healthy,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                        last_error: None,
                        server: Some(init.server_info.name),
                    };
                }
                Ok(Err(reason)) => {
                    debug!(service = %service, attempt, %reason, "probe attempt failed");
                    last_error = Some(reason);
                }
                Err(_) => {
                    debug!(service = %service, attempt, ?timeout, "probe attempt timed out");
                    last_error = Some(format!("attempt timed out after {timeout:?}"));
                }
            }
            if let Some(delay) = policy.backoff_after(attempt) {
                tokio::time::sleep(delay).await;
            }
        }

        handle.set_health(HealthState::Unhealthy).await;
        warn!(
            service = %service,
            attempts = policy.max_attempts(),
            last_error = last_error.as_deref().unwrap_or("none"),
            "worker unhealthy after exhausting retries"
        );
        ProbeReport {
            state: HealthState::Unhealthy,
            attempts: policy.max_attempts(),
            elapsed: started.elapsed(),
            last_error,
            server: None,
        }
    }

    async fn initialize_once(&self, handle: &WorkerHandle) -> Result<InitializeResult, String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let transport = handle.transport();
        let response = transport
            .request(mcp::initialize_request(id))
            .await
            .map_err(|e| e.to_string())?;
        if let Some(err) = response.error {
            return Err(format!("initialize error {}: {}", err.code, err.message));
        }
        let result = response
            .result
            .ok_or_else(|| "initialize response carries no result".to_string())?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| format!("malformed initialize result: {e}"))?;
        transport
            .notify(mcp::initialized_notification())
            .await
            .map_err(|e| e.to_string())?;
        Ok(init)
    }
}

impl Default for HealthChecker {
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

    use super::*;
    use crate::transport::StubWorker;
    use attest_core::config::HarnessConfig;
    use attest_core::config::ServiceSpec;

    fn spec(name: &str) -> ServiceSpec {
        let toml = format!("[services.{name}]\ncommand = \"worker\"\ntools = [\"t\"]\n");
        let config = HarnessConfig::load_str(&toml).unwrap();
        config.resolve().unwrap().remove(name).unwrap()
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            multiplier: 1.0,
        }
    }

    #[tokio::test]
    async fn healthy_worker_passes_first_attempt() {
        let stub = Arc::new(StubWorker::new(["t"]));
        let handle = WorkerHandle::detached(spec("svc"), stub.clone() as Arc<dyn crate::transport::McpTransport>);
        let checker = HealthChecker::new();

        let report = checker
            .probe(&handle, Duration::from_secs(1), &policy(3))
            .await;
        assert!(report.is_healthy());
        assert_eq!(report.attempts, 1);
        assert_eq!(report.server.as_deref(), Some("stub-worker"));
        assert_eq!(handle.health().await, HealthState::Healthy);
    }

    #[tokio::test]
    async fn flaky_worker_succeeds_on_third_attempt() {
        let stub = Arc::new(StubWorker::new(["t"]).with_failing_probes(2));
        let handle = WorkerHandle::detached(spec("svc"), stub.clone() as Arc<dyn crate::transport::McpTransport>);
        let checker = HealthChecker::new();

        let report = checker
            .probe(&handle, Duration::from_secs(1), &policy(3))
            .await;
        assert!(report.is_healthy());
        assert_eq!(report.attempts, 3);
        assert_eq!(stub.requests(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_makes_exactly_retries_plus_one_attempts() {
        let stub = Arc::new(StubWorker::new(["t"]).with_failing_probes(u32::MAX));
        let handle = WorkerHandle::detached(spec("svc"), stub.clone() as Arc<dyn crate::transport::McpTransport>);
        let checker = HealthChecker::new();

        let report = checker
            .probe(&handle, Duration::from_secs(1), &policy(2))
            .await;
        assert!(!report.is_healthy());
        assert_eq!(report.attempts, 3);
        assert_eq!(stub.requests(), 3);
        assert!(report.last_error.is_some());
        assert_eq!(handle.health().await, HealthState::Unhealthy);
        assert!(matches!(
            report.as_error("svc"),
            Some(HarnessError::ConnectionTimeout { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn slow_attempt_consumes_a_retry_not_the_probe() {
        // First attempts outlast the per-attempt timeout; the probe keeps
        // retrying until the policy is exhausted.
        let stub = Arc::new(
            StubWorker::new(["t"]).with_latency(Duration::from_millis(50)),
        );
        let handle = WorkerHandle::detached(spec("svc"), stub.clone() as Arc<dyn crate::transport::McpTransport>);
        let checker = HealthChecker::new();

        let report = checker
            .probe(&handle, Duration::from_millis(5), &policy(1))
            .await;
        assert!(!report.is_healthy());
        assert_eq!(report.attempts, 2);
        assert!(report
            .last_error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }
}
