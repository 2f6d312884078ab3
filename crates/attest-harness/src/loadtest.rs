use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::invoker::ToolInvoker;
use crate::launcher::WorkerHandle;

// ---------------------------------------------------------------------------
// LoadTestReport
// ---------------------------------------------------------------------------

/// Aggregated outcome of one concurrent burst.
#[derive(Debug, Clone)]
pub struct LoadTestReport {
    pub concurrency: usize,
    pub successes: usize,
    pub failures: usize,
    pub elapsed: Duration,
    /// Per-call latencies of the successful calls, sorted ascending.
    latencies: Vec<Duration>,
}

impl LoadTestReport {
    pub fn all_succeeded(&self) -> bool {
        self.failures == 0 && self.successes == self.concurrency
    }

    pub fn min_latency(&self) -> Option<Duration> {
        self.latencies.first().copied()
    }

    pub fn max_latency(&self) -> Option<Duration> {
        self.latencies.last().copied()
    }

    pub fn mean_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }

    /// Nearest-rank 95th percentile over the successful calls.
    pub fn p95_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let rank = (self.latencies.len() as f64 * 0.95).ceil() as usize;
        self.latencies.get(rank.saturating_sub(1)).copied()
    }
}

// ---------------------------------------------------------------------------
// ConcurrencyHarness
// ---------------------------------------------------------------------------

/// Fires `concurrency` simultaneous invocations of one tool and aggregates
/// the latencies. Calls that fail, or that are still pending when `budget`
/// runs out, count as failures.
pub struct ConcurrencyHarness {
    invoker: Arc<ToolInvoker>,
}

impl ConcurrencyHarness {
    pub fn new() -> Self {
        Self {
            invoker: Arc::new(ToolInvoker::new()),
        }
    }

    pub async fn load_test(
        &self,
        handle: &Arc<WorkerHandle>,
        tool: &str,
        arguments: serde_json::Value,
        concurrency: usize,
        budget: Duration,
    ) -> LoadTestReport {
        let started = Instant::now();
        let deadline = started + budget;
        let mut tasks: JoinSet<Result<Duration, String>> = JoinSet::new();

        for _ in 0..concurrency {
            let invoker = Arc::clone(&self.invoker);
            let handle = Arc::clone(handle);
            let tool = tool.to_string();
            let arguments = arguments.clone();
            tasks.spawn(async move {
                let call_started = Instant::now();
                invoker
                    .invoke(&handle, &tool, arguments)
                    .await
                    .map(|_| call_started.elapsed())
                    .map_err(|e| e.to_string())
            });
        }

        let mut latencies = Vec::with_capacity(concurrency);
        let mut failures = 0usize;
        while !tasks.is_empty() {
            match tokio::time::timeout_at(deadline.into(), tasks.join_next()).await {
                Ok(Some(Ok(Ok(latency)))) => latencies.push(latency),
                Ok(Some(Ok(Err(reason)))) => {
                    warn!(tool, %reason, "load test call failed");
                    failures += 1;
                }
                Ok(Some(Err(join_err))) => {
                    warn!(tool, error = %join_err, "load test task panicked");
                    failures += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    let pending = tasks.len();
                    warn!(tool, pending, ?budget, "load test budget exhausted");
                    tasks.abort_all();
                    failures += pending;
                    break;
                }
            }
        }

        latencies.sort_unstable();
        let report = LoadTestReport {
            concurrency,
            successes: latencies.len(),
            failures,
            elapsed: started.elapsed(),
            latencies,
        };
        info!(
            tool,
            concurrency,
            successes = report.successes,
            failures = report.failures,
            "load test finished"
        );
        report
    }
}

impl Default for ConcurrencyHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{McpTransport, StubWorker};
    use attest_core::config::{HarnessConfig, ServiceSpec};

    fn spec() -> ServiceSpec {
        let toml = "[services.svc]\ncommand = \"worker\"\ntools = [\"ping\"]\n\n\
                    [services.svc.retry]\nmax_retries = 1\nbase_delay_ms = 1\n";
        let config = HarnessConfig::load_str(toml).unwrap();
        config.resolve().unwrap().remove("svc").unwrap()
    }

    #[tokio::test]
    async fn burst_of_five_all_succeed() {
        let stub = Arc::new(StubWorker::new(["ping"]));
        let handle =
            crate::launcher::WorkerHandle::detached(spec(), stub.clone() as Arc<dyn McpTransport>);
        let harness = ConcurrencyHarness::new();

        let report = harness
            .load_test(&handle, "ping", serde_json::json!({}), 5, Duration::from_secs(5))
            .await;
        assert!(report.all_succeeded());
        assert_eq!(report.successes, 5);
        assert_eq!(report.failures, 0);
        assert_eq!(stub.requests(), 5);
        assert!(report.min_latency().is_some());
        assert!(report.p95_latency() >= report.min_latency());
    }

    #[tokio::test]
    async fn failing_tool_counts_as_failures() {
        let stub = Arc::new(StubWorker::new(["ping"]).with_tool_error());
        let handle =
            crate::launcher::WorkerHandle::detached(spec(), stub.clone() as Arc<dyn McpTransport>);
        let harness = ConcurrencyHarness::new();

        let report = harness
            .load_test(&handle, "ping", serde_json::json!({}), 3, Duration::from_secs(30))
            .await;
        assert_eq!(report.successes, 0);
        assert_eq!(report.failures, 3);
        assert!(!report.all_succeeded());
        assert!(report.mean_latency().is_none());
    }

    #[test]
    fn percentile_over_known_latencies() {
        let latencies: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        let report = LoadTestReport {
            concurrency: 100,
            successes: 100,
            failures: 0,
            elapsed: Duration::from_secs(1),
            latencies,
        };
        assert_eq!(report.min_latency(), Some(Duration::from_millis(1)));
        assert_eq!(report.max_latency(), Some(Duration::from_millis(100)));
        assert_eq!(report.p95_latency(), Some(Duration::from_millis(95)));
        assert_eq!(report.mean_latency(), Some(Duration::from_micros(50_500)));
    }
}
