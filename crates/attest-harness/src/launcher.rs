use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{info, warn};

use attest_core::config::{EnvSnapshot, ServiceSpec};
use attest_core::types::HealthState;

use crate::error::HarnessError;
use crate::transport::{McpTransport, StdioTransport};

// ---------------------------------------------------------------------------
// WorkerHandle
// ---------------------------------------------------------------------------

/// Runtime binding between a [`ServiceSpec`] and its launched process.
///
/// Handles are created and destroyed only by the [`ProcessLauncher`]; health
/// probes and tool invokers read and update the health state but never touch
/// process identity. That single-writer-for-identity discipline is what lets
/// concurrent status updates coexist with a race-free process lifetime.
pub struct WorkerHandle {
    spec: Arc<ServiceSpec>,
    health: RwLock<HealthState>,
    child: Mutex<Option<Child>>,
    transport: Arc<dyn McpTransport>,
    started_at: Instant,
}

impl WorkerHandle {
    fn spawned(spec: Arc<ServiceSpec>, child: Child, transport: Arc<dyn McpTransport>) -> Arc<Self> {
        Arc::new(Self {
            spec,
            health: RwLock::new(HealthState::Starting),
            child: Mutex::new(Some(child)),
            transport,
            started_at: Instant::now(),
        })
    }

    /// A handle with no underlying process, bound to the given transport.
    /// Used by tests and by in-process worker stand-ins.
    pub fn detached(spec: ServiceSpec, transport: Arc<dyn McpTransport>) -> Arc<Self> {
        Arc::new(Self {
            spec: Arc::new(spec),
            health: RwLock::new(HealthState::Starting),
            child: Mutex::new(None),
            transport,
            started_at: Instant::now(),
        })
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn transport(&self) -> Arc<dyn McpTransport> {
        Arc::clone(&self.transport)
    }

    pub async fn health(&self) -> HealthState {
        *self.health.read().await
    }

    pub async fn set_health(&self, state: HealthState) {
        *self.health.write().await = state;
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    async fn terminate(&self) {
        let mut slot = self.child.lock().await;
        if let Some(mut child) = slot.take() {
            // Already-dead children make start_kill/wait fail; that's fine.
            let _ = child.start_kill();
            let _ = child.wait().await;
            info!(service = %self.spec.name, "worker terminated");
        }
        self.set_health(HealthState::Stopped).await;
    }
}

// ---------------------------------------------------------------------------
// Launch mode and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Exact input order with a settle delay between launches; a failed
    /// required spec aborts the remainder.
    Sequential,
    /// All specs attempted concurrently; fatal only when every required
    /// spec failed.
    Parallel,
}

#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub service: String,
    pub ok: bool,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// Per-spec launch outcomes, in input-spec order regardless of mode.
#[derive(Debug, Clone, Default)]
pub struct LaunchReport {
    pub outcomes: Vec<LaunchOutcome>,
}

impl LaunchReport {
    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(|o| o.ok)
    }

    pub fn launched(&self) -> usize {
        self.outcomes.iter().filter(|o| o.ok).count()
    }
}

// ---------------------------------------------------------------------------
// ProcessLauncher
// ---------------------------------------------------------------------------

/// Starts and stops worker processes, owning the handle map for the run.
pub struct ProcessLauncher {
    env: EnvSnapshot,
    settle_delay: Duration,
    handles: DashMap<String, Arc<WorkerHandle>>,
}

impl ProcessLauncher {
    pub fn new(env: EnvSnapshot, settle_delay: Duration) -> Self {
        Self {
            env,
            settle_delay,
            handles: DashMap::new(),
        }
    }

    /// Launch every spec in `specs` per `mode`. Specs whose name already has
    /// a live handle are reported as launched without respawning.
    pub async fn launch(
        &self,
        specs: &[ServiceSpec],
        mode: LaunchMode,
    ) -> Result<LaunchReport, HarnessError> {
        match mode {
            LaunchMode::Sequential => self.launch_sequential(specs).await,
            LaunchMode::Parallel => self.launch_parallel(specs).await,
        }
    }

    /// Register an externally constructed handle (e.g. a stub-backed worker
    /// in tests). Handle creation stays a launcher operation.
    pub fn adopt(&self, handle: Arc<WorkerHandle>) {
        self.handles.insert(handle.spec().name.clone(), handle);
    }

    pub fn handle(&self, name: &str) -> Option<Arc<WorkerHandle>> {
        self.handles.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn handles(&self) -> Vec<Arc<WorkerHandle>> {
        self.handles
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    async fn launch_sequential(&self, specs: &[ServiceSpec]) -> Result<LaunchReport, HarnessError> {
        let mut report = LaunchReport::default();
        for (index, spec) in specs.iter().enumerate() {
            let outcome = self.launch_one(spec);
            let failed = !outcome.ok;
            let error = outcome.error.clone();
            report.outcomes.push(outcome);

            if failed {
                if spec.required {
                    return Err(HarnessError::ProcessLaunchFailure {
                        service: spec.name.clone(),
                        reason: error.unwrap_or_else(|| "unknown launch failure".to_string()),
                    });
                }
                warn!(service = %spec.name, "optional service failed to launch, continuing");
            }

            if index + 1 < specs.len() && !self.settle_delay.is_zero() {
                tokio::time::sleep(self.settle_delay).await;
            }
        }
        Ok(report)
    }

    async fn launch_parallel(&self, specs: &[ServiceSpec]) -> Result<LaunchReport, HarnessError> {
        let mut set = JoinSet::new();
        for (index, spec) in specs.iter().enumerate() {
            let spec = spec.clone();
            let env = self.env.clone();
            let existing = self.handle(&spec.name);
            set.spawn(async move {
                let started = Instant::now();
                if existing.is_some() {
                    return (index, None, Ok(()), started.elapsed());
                }
                match spawn_worker(&spec, &env) {
                    Ok(handle) => (index, Some(handle), Ok(()), started.elapsed()),
                    Err(reason) => (index, None, Err(reason), started.elapsed()),
                }
            });
        }

        let mut slots: Vec<Option<LaunchOutcome>> = vec![None; specs.len()];
        while let Some(joined) = set.join_next().await {
            let (index, handle, result, elapsed) = joined
                .map_err(|e| HarnessError::Internal(format!("launch task panicked: {e}")))?;
            let spec = &specs[index];
            if let Some(handle) = handle {
                self.handles.insert(spec.name.clone(), handle);
            }
            slots[index] = Some(match result {
                Ok(()) => {
                    info!(service = %spec.name, ?elapsed, "worker launched");
                    LaunchOutcome {
                        service: spec.name.clone(),
                        ok: true,
                        error: None,
                        elapsed,
                    }
                }
                Err(reason) => {
                    warn!(service = %spec.name, %reason, "worker failed to launch");
                    LaunchOutcome {
                        service: spec.name.clone(),
                        ok: false,
                        error: Some(reason),
                        elapsed,
                    }
                }
            });
        }

        let report = LaunchReport {
            outcomes: slots.into_iter().flatten().collect(),
        };

        let required: Vec<&LaunchOutcome> = report
            .outcomes
            .iter()
            .filter(|o| specs.iter().any(|s| s.name == o.service && s.required))
            .collect();
        if !required.is_empty() && required.iter().all(|o| !o.ok) {
            let names: Vec<&str> = required.iter().map(|o| o.service.as_str()).collect();
            return Err(HarnessError::ProcessLaunchFailure {
                service: names.join(", "),
                reason: "every required service failed to launch".to_string(),
            });
        }
        Ok(report)
    }

    fn launch_one(&self, spec: &ServiceSpec) -> LaunchOutcome {
        let started = Instant::now();
        if self.handles.contains_key(&spec.name) {
            return LaunchOutcome {
                service: spec.name.clone(),
                ok: true,
                error: None,
                elapsed: started.elapsed(),
            };
        }
        match spawn_worker(spec, &self.env) {
            Ok(handle) => {
                self.handles.insert(spec.name.clone(), handle);
                info!(service = %spec.name, command = %spec.command, "worker launched");
                LaunchOutcome {
                    service: spec.name.clone(),
                    ok: true,
                    error: None,
                    elapsed: started.elapsed(),
                }
            }
            Err(reason) => {
                warn!(service = %spec.name, %reason, "worker failed to launch");
                LaunchOutcome {
                    service: spec.name.clone(),
                    ok: false,
                    error: Some(reason),
                    elapsed: started.elapsed(),
                }
            }
        }
    }

    /// Terminate every owned worker. Idempotent: repeated calls, including
    /// after partial launch failure, are safe; already-dead processes are
    /// tolerated.
    pub async fn shutdown(&self) {
        let handles = self.handles();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "shutting down workers");
        for handle in handles {
            handle.terminate().await;
        }
    }
}

fn spawn_worker(spec: &ServiceSpec, env: &EnvSnapshot) -> Result<Arc<WorkerHandle>, String> {
    let mut command = Command::new(&spec.command);
    command
        .args(&spec.args)
        .envs(env.resolved_for(spec))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        // Backstop for abnormal exits; normal teardown goes through shutdown().
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| format!("spawn '{}' failed: {e}", spec.command))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| "child stdin unavailable".to_string())?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "child stdout unavailable".to_string())?;

    let transport = Arc::new(StdioTransport::new(stdin, stdout));
    Ok(WorkerHandle::spawned(Arc::new(spec.clone()), child, transport))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
