use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use attest_core::config::{EnvSnapshot, ServiceSpec};
use attest_core::types::{HealthState, TestResult, TestStatus, TestSuite};

use crate::error::HarnessError;
use crate::health::HealthChecker;
use crate::invoker::ToolInvoker;
use crate::launcher::{LaunchMode, ProcessLauncher, WorkerHandle};
use crate::loadtest::ConcurrencyHarness;

// ---------------------------------------------------------------------------
// Suite lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("no suite is active")]
    NoActiveSuite,
    #[error("suite '{0}' is still running")]
    SuiteAlreadyRunning(String),
}

/// What a single check concluded. `Fail` carries structured diagnostics that
/// land in the result's detail map.
#[derive(Debug)]
pub enum CheckOutcome {
    Pass {
        message: String,
        details: BTreeMap<String, serde_json::Value>,
    },
    Fail {
        message: String,
        details: BTreeMap<String, serde_json::Value>,
    },
    Skip {
        message: String,
    },
}

impl CheckOutcome {
    pub fn pass(message: impl Into<String>) -> Self {
        Self::Pass {
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn pass_with(
        message: impl Into<String>,
        details: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self::Pass {
            message: message.into(),
            details,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn fail_with(
        message: impl Into<String>,
        details: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self::Fail {
            message: message.into(),
            details,
        }
    }

    pub fn skip(message: impl Into<String>) -> Self {
        Self::Skip {
            message: message.into(),
        }
    }
}

/// Collects suites one at a time: exactly one suite may be open, every check
/// records exactly one result, and a check that returns an error becomes a
/// failed result rather than aborting the run.
pub struct SuiteRunner {
    suites: Vec<TestSuite>,
    active: Option<TestSuite>,
}

impl SuiteRunner {
    pub fn new() -> Self {
        Self {
            suites: Vec::new(),
            active: None,
        }
    }

    pub fn start_suite(&mut self, name: impl Into<String>) -> Result<(), RunnerError> {
        if let Some(open) = &self.active {
            return Err(RunnerError::SuiteAlreadyRunning(open.name.clone()));
        }
        let name = name.into();
        info!(suite = %name, "suite started");
        self.active = Some(TestSuite {
            name,
            results: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        });
        Ok(())
    }

    /// Time `check` and record exactly one result for it, tagged with the
    /// service it exercised.
    pub async fn run_test<F>(
        &mut self,
        name: impl Into<String>,
        service: &str,
        check: F,
    ) -> Result<(), RunnerError>
    where
        F: std::future::Future<Output = Result<CheckOutcome, HarnessError>>,
    {
        if self.active.is_none() {
            return Err(RunnerError::NoActiveSuite);
        }
        let name = name.into();
        let started = Instant::now();
        let outcome = check.await;
        let elapsed = started.elapsed();

        let mut result = match outcome {
            Ok(CheckOutcome::Pass { message, details }) => {
                let mut result = TestResult::passed(&name, message);
                for (key, value) in details {
                    result = result.with_detail(key, value);
                }
                result
            }
            Ok(CheckOutcome::Fail { message, details }) => {
                let mut result = TestResult::failed(&name, message);
                for (key, value) in details {
                    result = result.with_detail(key, value);
                }
                result
            }
            Ok(CheckOutcome::Skip { message }) => TestResult::skipped(&name, message),
            Err(err) => {
                let mut result = TestResult::failed(&name, err.to_string());
                if let HarnessError::ToolInvocation {
                    attempts, detail, ..
                } = &err
                {
                    result = result
                        .with_detail("attempts", serde_json::json!(attempts))
                        .with_detail("payload", detail.clone());
                }
                result
            }
        };
        result = result
            .with_duration(elapsed)
            .with_detail("service", serde_json::json!(service));
        if result.status == TestStatus::Failed {
            warn!(test = %name, service, message = %result.message, "check failed");
        }
        if let Some(suite) = self.active.as_mut() {
            suite.results.push(result);
        }
        Ok(())
    }

    pub fn end_suite(&mut self) -> Result<(), RunnerError> {
        let mut suite = self.active.take().ok_or(RunnerError::NoActiveSuite)?;
        suite.ended_at = Some(Utc::now());
        let (passed, failed, skipped) = suite.counts();
        info!(suite = %suite.name, passed, failed, skipped, "suite ended");
        self.suites.push(suite);
        Ok(())
    }

    pub fn finish(self) -> Result<Vec<TestSuite>, RunnerError> {
        if let Some(open) = self.active {
            return Err(RunnerError::SuiteAlreadyRunning(open.name));
        }
        Ok(self.suites)
    }
}

impl Default for SuiteRunner {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Run options and result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: LaunchMode,
    pub include_performance: bool,
    pub integration_target: Option<String>,
    pub concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: LaunchMode::Sequential,
            include_performance: false,
            integration_target: None,
            concurrency: 5,
        }
    }
}

/// Everything a run produced, plus the count that drives the exit code:
/// failed results attributed to required services.
#[derive(Debug)]
pub struct HarnessRun {
    pub suites: Vec<TestSuite>,
    pub required_failures: usize,
}

// ---------------------------------------------------------------------------
// HarnessRunner
// ---------------------------------------------------------------------------

/// Drives a full run over the configured services: environment checks,
/// launch, connection probes, tool checks, integration, and an optional
/// performance burst.
///
/// Only two things abort a run: configuration errors (raised before this
/// type exists) and a launch failure of a required service. Every other
/// failure is recorded as a result and the run continues.
pub struct HarnessRunner {
    specs: BTreeMap<String, ServiceSpec>,
    env: EnvSnapshot,
    launcher: Arc<ProcessLauncher>,
    checker: HealthChecker,
    invoker: ToolInvoker,
}

impl HarnessRunner {
    pub fn new(
        specs: BTreeMap<String, ServiceSpec>,
        env: EnvSnapshot,
        settle_delay: Duration,
    ) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(env.clone(), settle_delay));
        Self {
            specs,
            env,
            launcher,
            checker: HealthChecker::new(),
            invoker: ToolInvoker::new(),
        }
    }

    /// The launcher owning this run's worker handles. Callers use it for
    /// shutdown and, in tests, to adopt stub-backed workers.
    pub fn launcher(&self) -> Arc<ProcessLauncher> {
        Arc::clone(&self.launcher)
    }

    pub async fn run(&self, options: &RunOptions) -> Result<HarnessRun, HarnessError> {
        let mut suites = SuiteRunner::new();

        let launchable = self.run_environment_suite(&mut suites).await?;
        self.launcher.launch(&launchable, options.mode).await?;

        self.run_connection_suite(&mut suites).await?;
        self.run_tools_suite(&mut suites).await?;
        self.run_integration_suite(&mut suites, options).await?;
        if options.include_performance {
            self.run_performance_suite(&mut suites, options).await?;
        }

        let suites = suites.finish()?;
        let required_failures = self.count_required_failures(&suites);
        Ok(HarnessRun {
            suites,
            required_failures,
        })
    }

    /// Check declared environment variables for every service. Services with
    /// missing variables record a failure and are withheld from launch; the
    /// run itself continues either way.
    async fn run_environment_suite(
        &self,
        suites: &mut SuiteRunner,
    ) -> Result<Vec<ServiceSpec>, HarnessError> {
        suites.start_suite("environment")?;
        let mut launchable = Vec::new();
        for spec in self.specs.values() {
            let missing = self.env.missing_for(spec);
            let name = format!("{}::env", spec.name);
            if missing.is_empty() {
                launchable.push(spec.clone());
                suites
                    .run_test(name, &spec.name, async {
                        Ok(CheckOutcome::pass(format!(
                            "all {} declared variables present",
                            spec.env.len()
                        )))
                    })
                    .await?;
            } else {
                let details = BTreeMap::from([(
                    "missing".to_string(),
                    serde_json::json!(missing.clone()),
                )]);
                suites
                    .run_test(name, &spec.name, async {
                        Ok(CheckOutcome::fail_with(
                            format!("missing environment variables: {}", missing.join(", ")),
                            details,
                        ))
                    })
                    .await?;
            }
        }
        suites.end_suite()?;
        Ok(launchable)
    }

    /// Probe each launched worker for readiness. The whole probe runs under
    /// the service's init deadline; each attempt under its connect timeout.
    async fn run_connection_suite(&self, suites: &mut SuiteRunner) -> Result<(), HarnessError> {
        suites.start_suite("connection")?;
        for spec in self.specs.values() {
            let name = format!("{}::connect", spec.name);
            let handle = self.launcher.handle(&spec.name);
            suites
                .run_test(name, &spec.name, async {
                    let Some(handle) = handle else {
                        return Ok(CheckOutcome::skip("service was not launched"));
                    };
                    let probe = tokio::time::timeout(
                        spec.timeouts.init,
                        self.checker
                            .probe(&handle, spec.timeouts.connect, &spec.retry),
                    )
                    .await;
                    match probe {
                        Ok(report) if report.is_healthy() => {
                            let server = report.server.as_deref().unwrap_or("unknown");
                            let details = BTreeMap::from([(
                                "attempts".to_string(),
                                serde_json::json!(report.attempts),
                            )]);
                            Ok(CheckOutcome::pass_with(
                                format!(
                                    "connected to {server} in {} attempt(s)",
                                    report.attempts
                                ),
                                details,
                            ))
                        }
                        Ok(report) => {
                            let mut details = BTreeMap::from([(
                                "attempts".to_string(),
                                serde_json::json!(report.attempts),
                            )]);
                            if let Some(last) = report.last_error {
                                details.insert("last_error".to_string(), serde_json::json!(last));
                            }
                            Ok(CheckOutcome::fail_with(
                                format!("unhealthy after {} attempt(s)", report.attempts),
                                details,
                            ))
                        }
                        Err(_) => {
                            handle.set_health(HealthState::Unhealthy).await;
                            Ok(CheckOutcome::fail(format!(
                                "initialization deadline of {:?} exceeded",
                                spec.timeouts.init
                            )))
                        }
                    }
                })
                .await?;
        }
        suites.end_suite()?;
        Ok(())
    }

    /// Verify each healthy worker advertises its declared tools, then smoke
    /// test the designated tool.
    async fn run_tools_suite(&self, suites: &mut SuiteRunner) -> Result<(), HarnessError> {
        suites.start_suite("tool-functionality")?;
        for spec in self.specs.values() {
            let handle = self.healthy_handle(&spec.name).await;

            let list_name = format!("{}::tools-list", spec.name);
            suites
                .run_test(list_name, &spec.name, async {
                    let Some(handle) = &handle else {
                        return Ok(CheckOutcome::skip("service is not healthy"));
                    };
                    let advertised = self.invoker.list_tools(handle).await?;
                    let advertised_names: BTreeSet<&str> =
                        advertised.iter().map(|t| t.name.as_str()).collect();
                    let undeclared: Vec<&str> = spec
                        .tools
                        .iter()
                        .map(String::as_str)
                        .filter(|t| !advertised_names.contains(t))
                        .collect();
                    if undeclared.is_empty() {
                        Ok(CheckOutcome::pass(format!(
                            "{} advertised tool(s) cover all {} declared",
                            advertised.len(),
                            spec.tools.len()
                        )))
                    } else {
                        let details = BTreeMap::from([(
                            "not_advertised".to_string(),
                            serde_json::json!(undeclared),
                        )]);
                        Ok(CheckOutcome::fail_with(
                            format!("declared tools not advertised: {}", undeclared.join(", ")),
                            details,
                        ))
                    }
                })
                .await?;

            if let Some(smoke_tool) = &spec.smoke_tool {
                let smoke_name = format!("{}::smoke", spec.name);
                suites
                    .run_test(smoke_name, &spec.name, async {
                        let Some(handle) = &handle else {
                            return Ok(CheckOutcome::skip("service is not healthy"));
                        };
                        let result = self
                            .invoker
                            .invoke(handle, smoke_tool, spec.smoke_args.clone())
                            .await?;
                        let preview = result.text_content().unwrap_or("(non-text content)");
                        Ok(CheckOutcome::pass(format!(
                            "'{smoke_tool}' answered: {preview}"
                        )))
                    })
                    .await?;
            }
        }
        suites.end_suite()?;
        Ok(())
    }

    /// End-to-end exercise of the designated target service.
    async fn run_integration_suite(
        &self,
        suites: &mut SuiteRunner,
        options: &RunOptions,
    ) -> Result<(), HarnessError> {
        suites.start_suite("integration")?;
        match &options.integration_target {
            None => {
                suites
                    .run_test("integration::target", "", async {
                        Ok(CheckOutcome::skip("no integration target configured"))
                    })
                    .await?;
            }
            Some(target) => {
                let name = format!("{target}::integration");
                let spec = self.specs.get(target);
                let handle = self.healthy_handle(target).await;
                suites
                    .run_test(name, target, async {
                        let Some(spec) = spec else {
                            return Ok(CheckOutcome::fail(format!(
                                "integration target '{target}' is not a configured service"
                            )));
                        };
                        let Some(smoke_tool) = &spec.smoke_tool else {
                            return Ok(CheckOutcome::skip("target declares no smoke tool"));
                        };
                        let Some(handle) = &handle else {
                            return Ok(CheckOutcome::skip("target is not healthy"));
                        };
                        let result = self
                            .invoker
                            .invoke(handle, smoke_tool, spec.smoke_args.clone())
                            .await?;
                        match result.text_content() {
                            Some(text) if !text.trim().is_empty() => Ok(CheckOutcome::pass(
                                format!("'{smoke_tool}' returned {} bytes", text.len()),
                            )),
                            _ => Ok(CheckOutcome::fail(
                                "smoke tool returned no usable text content",
                            )),
                        }
                    })
                    .await?;
            }
        }
        suites.end_suite()?;
        Ok(())
    }

    /// Concurrent burst against every healthy service that declares a smoke
    /// tool. Passing requires every call in the burst to succeed. Only runs
    /// when explicitly requested; a default run has no performance suite at
    /// all.
    async fn run_performance_suite(
        &self,
        suites: &mut SuiteRunner,
        options: &RunOptions,
    ) -> Result<(), HarnessError> {
        suites.start_suite("performance")?;
        let harness = ConcurrencyHarness::new();
        for spec in self.specs.values() {
            let name = format!("{}::load", spec.name);
            let Some(smoke_tool) = &spec.smoke_tool else {
                suites
                    .run_test(name, &spec.name, async {
                        Ok(CheckOutcome::skip("no smoke tool configured"))
                    })
                    .await?;
                continue;
            };
            let handle = self.healthy_handle(&spec.name).await;
            suites
                .run_test(name, &spec.name, async {
                    let Some(handle) = &handle else {
                        return Ok(CheckOutcome::skip("service is not healthy"));
                    };
                    let budget = spec
                        .timeouts
                        .tool_call
                        .saturating_mul(spec.retry.max_attempts().max(1));
                    let report = harness
                        .load_test(
                            handle,
                            smoke_tool,
                            spec.smoke_args.clone(),
                            options.concurrency,
                            budget,
                        )
                        .await;
                    let details = load_details(&report);
                    if report.all_succeeded() {
                        Ok(CheckOutcome::pass_with(
                            format!(
                                "{} concurrent call(s) succeeded, p95 {:?}",
                                report.concurrency,
                                report.p95_latency().unwrap_or_default()
                            ),
                            details,
                        ))
                    } else {
                        Ok(CheckOutcome::fail_with(
                            format!(
                                "{} of {} concurrent call(s) failed",
                                report.failures, report.concurrency
                            ),
                            details,
                        ))
                    }
                })
                .await?;
        }
        suites.end_suite()?;
        Ok(())
    }

    async fn healthy_handle(&self, name: &str) -> Option<Arc<WorkerHandle>> {
        let handle = self.launcher.handle(name)?;
        if handle.health().await == HealthState::Healthy {
            Some(handle)
        } else {
            None
        }
    }

    fn count_required_failures(&self, suites: &[TestSuite]) -> usize {
        let required: BTreeSet<&str> = self
            .specs
            .values()
            .filter(|s| s.required)
            .map(|s| s.name.as_str())
            .collect();
        suites
            .iter()
            .flat_map(|suite| suite.results.iter())
            .filter(|result| result.status == TestStatus::Failed)
            .filter(|result| {
                result
                    .details
                    .get("service")
                    .and_then(serde_json::Value::as_str)
                    .is_some_and(|svc| required.contains(svc))
            })
            .count()
    }
}

fn load_details(report: &crate::loadtest::LoadTestReport) -> BTreeMap<String, serde_json::Value> {
    let mut details = BTreeMap::from([
        ("concurrency".to_string(), serde_json::json!(report.concurrency)),
        ("successes".to_string(), serde_json::json!(report.successes)),
        ("failures".to_string(), serde_json::json!(report.failures)),
        (
            "elapsed_ms".to_string(),
            serde_json::json!(report.elapsed.as_millis() as u64),
        ),
    ]);
    let stats = [
        ("min_ms", report.min_latency()),
        ("max_ms", report.max_latency()),
        ("mean_ms", report.mean_latency()),
        ("p95_ms", report.p95_latency()),
    ];
    for (key, value) in stats {
        if let Some(latency) = value {
            details.insert(
                key.to_string(),
                serde_json::json!(latency.as_millis() as u64),
            );
        }
    }
    details
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{McpTransport, StubWorker};
    use attest_core::config::HarnessConfig;

    const TWO_SERVICES: &str = r#"
        [defaults.retry]
        max_retries = 1
        base_delay_ms = 1

        [services.alpha]
        command = "alpha-worker"
        env = ["ALPHA_TOKEN"]
        required = true
        tools = ["ping", "echo"]
        smoke_tool = "ping"

        [services.beta]
        command = "beta-worker"
        env = ["BETA_TOKEN"]
        required = false
        tools = ["search"]
        smoke_tool = "search"
    "#;

    fn runner_with_env(pairs: &[(&str, &str)]) -> HarnessRunner {
        let specs = HarnessConfig::load_str(TWO_SERVICES)
            .unwrap()
            .resolve()
            .unwrap();
        let env = EnvSnapshot::from_pairs(pairs.iter().copied());
        HarnessRunner::new(specs, env, Duration::ZERO)
    }

    fn adopt_stub(runner: &HarnessRunner, name: &str, stub: Arc<StubWorker>) {
        let spec = runner.specs.get(name).unwrap().clone();
        runner
            .launcher()
            .adopt(WorkerHandle::detached(spec, stub as Arc<dyn McpTransport>));
    }

    fn results_of<'a>(run: &'a HarnessRun, suite: &str) -> &'a [TestResult] {
        &run.suites
            .iter()
            .find(|s| s.name == suite)
            .unwrap_or_else(|| panic!("suite '{suite}' missing"))
            .results
    }

    #[tokio::test]
    async fn missing_env_fails_but_run_continues() {
        let runner = runner_with_env(&[("ALPHA_TOKEN", "xoxb-1")]);
        adopt_stub(&runner, "alpha", Arc::new(StubWorker::new(["ping", "echo"])));

        let run = runner.run(&RunOptions::default()).await.unwrap();

        let env = results_of(&run, "environment");
        assert_eq!(env.len(), 2);
        assert_eq!(env[0].status, TestStatus::Passed);
        assert_eq!(env[1].status, TestStatus::Failed);
        assert_eq!(env[1].details["missing"], serde_json::json!(["BETA_TOKEN"]));

        // beta was withheld from launch; its later checks are skipped, not
        // failed, and alpha's connection check still ran.
        let conn = results_of(&run, "connection");
        assert_eq!(conn[0].status, TestStatus::Passed);
        assert_eq!(conn[1].status, TestStatus::Skipped);

        // beta is optional, so its env failure does not count.
        assert_eq!(run.required_failures, 0);
    }

    #[tokio::test]
    async fn required_env_failure_counts_toward_exit_code() {
        let runner = runner_with_env(&[("BETA_TOKEN", "secret")]);
        adopt_stub(&runner, "beta", Arc::new(StubWorker::new(["search"])));

        let run = runner.run(&RunOptions::default()).await.unwrap();
        assert_eq!(run.required_failures, 1);
    }

    #[tokio::test]
    async fn tool_error_fails_smoke_but_later_suites_still_run() {
        let runner = runner_with_env(&[("ALPHA_TOKEN", "x"), ("BETA_TOKEN", "y")]);
        adopt_stub(&runner, "alpha", Arc::new(StubWorker::new(["ping", "echo"])));
        adopt_stub(
            &runner,
            "beta",
            Arc::new(StubWorker::new(["search"]).with_tool_error()),
        );

        let options = RunOptions {
            integration_target: Some("alpha".to_string()),
            ..RunOptions::default()
        };
        let run = runner.run(&options).await.unwrap();

        let tools = results_of(&run, "tool-functionality");
        let beta_smoke = tools.iter().find(|r| r.name == "beta::smoke").unwrap();
        assert_eq!(beta_smoke.status, TestStatus::Failed);
        assert!(beta_smoke.details.contains_key("attempts"));

        let integration = results_of(&run, "integration");
        assert_eq!(integration[0].status, TestStatus::Passed);

        // alpha never failed anything, beta is optional.
        assert_eq!(run.required_failures, 0);
    }

    #[tokio::test]
    async fn performance_suite_runs_when_enabled() {
        let runner = runner_with_env(&[("ALPHA_TOKEN", "x"), ("BETA_TOKEN", "y")]);
        adopt_stub(&runner, "alpha", Arc::new(StubWorker::new(["ping", "echo"])));
        adopt_stub(&runner, "beta", Arc::new(StubWorker::new(["search"])));

        let options = RunOptions {
            include_performance: true,
            concurrency: 4,
            ..RunOptions::default()
        };
        let run = runner.run(&options).await.unwrap();

        let perf = results_of(&run, "performance");
        assert_eq!(perf.len(), 2);
        for result in perf {
            assert_eq!(result.status, TestStatus::Passed);
            assert_eq!(result.details["concurrency"], serde_json::json!(4));
            assert_eq!(result.details["successes"], serde_json::json!(4));
        }
    }

    #[tokio::test]
    async fn default_run_has_no_performance_suite() {
        let runner = runner_with_env(&[("ALPHA_TOKEN", "x"), ("BETA_TOKEN", "y")]);
        adopt_stub(&runner, "alpha", Arc::new(StubWorker::new(["ping", "echo"])));
        adopt_stub(&runner, "beta", Arc::new(StubWorker::new(["search"])));

        let run = runner.run(&RunOptions::default()).await.unwrap();
        assert!(run.suites.iter().all(|s| s.name != "performance"));
        let names: Vec<&str> = run.suites.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["environment", "connection", "tool-functionality", "integration"]
        );
    }

    #[tokio::test]
    async fn suite_runner_rejects_nested_suites() {
        let mut suites = SuiteRunner::new();
        suites.start_suite("one").unwrap();
        let err = suites.start_suite("two").unwrap_err();
        assert!(matches!(err, RunnerError::SuiteAlreadyRunning(name) if name == "one"));
    }

    #[tokio::test]
    async fn suite_runner_rejects_orphan_checks() {
        let mut suites = SuiteRunner::new();
        let err = suites
            .run_test("orphan", "svc", async { Ok(CheckOutcome::pass("ok")) })
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NoActiveSuite));
    }

    #[tokio::test]
    async fn finish_rejects_open_suite() {
        let mut suites = SuiteRunner::new();
        suites.start_suite("open").unwrap();
        assert!(suites.finish().is_err());
    }
}
