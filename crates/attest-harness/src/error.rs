use crate::transport::TransportError;

// ---------------------------------------------------------------------------
// HarnessError
// ---------------------------------------------------------------------------

/// Failure taxonomy for the harness.
///
/// Only two of these are fatal to a run: configuration errors (raised as
/// `attest_core::config::ConfigError` before anything launches) and
/// [`HarnessError::ProcessLaunchFailure`] for a required worker. Everything
/// else is captured as a failed test result and the run continues.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// A required worker could not start. Fatal for the run.
    #[error("failed to launch required service '{service}': {reason}")]
    ProcessLaunchFailure { service: String, reason: String },

    /// Health probe exhausted its retry budget.
    #[error("connection to '{service}' failed after {attempts} attempts")]
    ConnectionTimeout { service: String, attempts: u32 },

    /// Tool name not in the service's declared list. Rejected before any
    /// transport call.
    #[error("tool '{tool}' is not declared by service '{service}'")]
    UnknownTool { service: String, tool: String },

    /// The worker returned a malformed or error response for a tool call.
    /// Carries the raw diagnostic payload from the last attempt.
    #[error("tool '{tool}' on '{service}' failed after {attempts} attempts: {message}")]
    ToolInvocation {
        service: String,
        tool: String,
        attempts: u32,
        message: String,
        detail: serde_json::Value,
    },

    /// Declared environment variables absent at startup.
    #[error("service '{service}' is missing environment variables: {missing:?}")]
    EnvironmentMissing {
        service: String,
        missing: Vec<String>,
    },

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Suite lifecycle misuse, a caller bug rather than an environmental failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl From<crate::runner::RunnerError> for HarnessError {
    fn from(err: crate::runner::RunnerError) -> Self {
        HarnessError::Internal(err.to_string())
    }
}
