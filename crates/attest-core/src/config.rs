use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// HarnessConfig: raw TOML document
// ---------------------------------------------------------------------------

/// Top-level harness configuration.
///
/// **Security**: services declare the *names* of the environment variables
/// they need (e.g. `"SLACK_BOT_TOKEN"`); actual credential values are never
/// stored in configuration and are read from the process environment at
/// runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl HarnessConfig {
    /// Load and parse a configuration file. Semantic validation happens in
    /// [`HarnessConfig::resolve`], which is the fail-fast gate before any
    /// process is launched.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config = Self::load_str(&text)?;
        tracing::debug!(path = %path.display(), services = config.services.len(), "configuration parsed");
        Ok(config)
    }

    pub fn load_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate the document and resolve every service into an immutable
    /// [`ServiceSpec`], applying per-service overrides on top of the
    /// defaults section.
    pub fn resolve(&self) -> Result<BTreeMap<String, ServiceSpec>, ConfigError> {
        self.defaults.validate()?;
        let mut specs = BTreeMap::new();
        for (name, service) in &self.services {
            let spec = service.resolve(name, &self.defaults)?;
            specs.insert(name.clone(), spec);
        }
        Ok(specs)
    }

    /// Pause between sequential launches.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.defaults.settle_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Defaults section
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_tool_call_timeout_ms")]
    pub tool_call_timeout_ms: u64,
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            tool_call_timeout_ms: default_tool_call_timeout_ms(),
            init_timeout_ms: default_init_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl DefaultsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("defaults.connect_timeout_ms", self.connect_timeout_ms),
            ("defaults.tool_call_timeout_ms", self.tool_call_timeout_ms),
            ("defaults.init_timeout_ms", self.init_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "{field} must be greater than zero"
                )));
            }
        }
        self.retry.validate("defaults.retry")
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_tool_call_timeout_ms() -> u64 {
    30_000
}
fn default_init_timeout_ms() -> u64 {
    15_000
}
fn default_settle_delay_ms() -> u64 {
    500
}

// ---------------------------------------------------------------------------
// Retry section
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        // A multiplier below 1.0 would make backoff delays shrink across
        // attempts; reject it at load time instead of accepting a policy
        // that silently breaks the non-decreasing-delay invariant.
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Validation(format!(
                "{section}.multiplier must be a finite value >= 1.0 (got {})",
                self.multiplier
            )));
        }
        Ok(())
    }

    fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_multiplier() -> f64 {
    2.0
}

// ---------------------------------------------------------------------------
// Service section
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Executable that serves the worker over stdio.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Names of environment variables the worker requires at launch.
    #[serde(default)]
    pub env: Vec<String>,
    /// When true, this worker's unavailability is fatal to the run.
    #[serde(default)]
    pub required: bool,
    /// Tool names the worker declares; invocations outside this list are
    /// rejected before reaching the wire.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Tool exercised by the integration and performance suites. Must be a
    /// member of `tools`.
    #[serde(default)]
    pub smoke_tool: Option<String>,
    /// Arguments passed to `smoke_tool` (defaults to an empty object).
    #[serde(default)]
    pub smoke_args: Option<serde_json::Value>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub tool_call_timeout_ms: Option<u64>,
    #[serde(default)]
    pub init_timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl ServiceConfig {
    fn resolve(&self, name: &str, defaults: &DefaultsConfig) -> Result<ServiceSpec, ConfigError> {
        if name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "service name must not be empty".to_string(),
            ));
        }
        if self.command.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "services.{name}.command must not be empty"
            )));
        }
        for var in &self.env {
            if var.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "services.{name}.env contains an empty variable name"
                )));
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for tool in &self.tools {
            if tool.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "services.{name}.tools contains an empty tool name"
                )));
            }
            if !seen.insert(tool.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "services.{name}.tools contains duplicate tool '{tool}'"
                )));
            }
        }
        if let Some(smoke) = &self.smoke_tool {
            if !self.tools.iter().any(|t| t == smoke) {
                return Err(ConfigError::Validation(format!(
                    "services.{name}.smoke_tool '{smoke}' is not in the declared tool list"
                )));
            }
        }
        if let Some(retry) = &self.retry {
            retry.validate(&format!("services.{name}.retry"))?;
        }

        let timeout = |over: Option<u64>, base: u64, field: &str| -> Result<Duration, ConfigError> {
            let ms = over.unwrap_or(base);
            if ms == 0 {
                return Err(ConfigError::Validation(format!(
                    "services.{name}.{field} must be greater than zero"
                )));
            }
            Ok(Duration::from_millis(ms))
        };

        Ok(ServiceSpec {
            name: name.to_string(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            required: self.required,
            tools: self.tools.clone(),
            smoke_tool: self.smoke_tool.clone(),
            smoke_args: self
                .smoke_args
                .clone()
                .unwrap_or_else(|| serde_json::json!({})),
            timeouts: OperationTimeouts {
                connect: timeout(
                    self.connect_timeout_ms,
                    defaults.connect_timeout_ms,
                    "connect_timeout_ms",
                )?,
                tool_call: timeout(
                    self.tool_call_timeout_ms,
                    defaults.tool_call_timeout_ms,
                    "tool_call_timeout_ms",
                )?,
                init: timeout(
                    self.init_timeout_ms,
                    defaults.init_timeout_ms,
                    "init_timeout_ms",
                )?,
            },
            retry: self
                .retry
                .as_ref()
                .unwrap_or(&defaults.retry)
                .to_policy(),
        })
    }
}

// ---------------------------------------------------------------------------
// ServiceSpec: resolved, immutable
// ---------------------------------------------------------------------------

/// Validated description of one worker. Created once from configuration and
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub required: bool,
    pub tools: Vec<String>,
    pub smoke_tool: Option<String>,
    pub smoke_args: serde_json::Value,
    pub timeouts: OperationTimeouts,
    pub retry: RetryPolicy,
}

impl ServiceSpec {
    pub fn declares_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }
}

/// Per-operation timeouts for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationTimeouts {
    pub connect: Duration,
    pub tool_call: Duration,
    pub init: Duration,
}

// ---------------------------------------------------------------------------
// EnvSnapshot: process environment captured once at startup
// ---------------------------------------------------------------------------

/// Immutable snapshot of the process environment, taken once and passed to
/// each component at construction time. There is no cached-then-stale state
/// to defeat: a component either got the variable in its snapshot or it
/// did not.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build a snapshot from explicit pairs (test seam).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Declared variables of `spec` that are absent or empty, in declaration
    /// order.
    pub fn missing_for(&self, spec: &ServiceSpec) -> Vec<String> {
        spec.env
            .iter()
            .filter(|name| self.get(name).map(str::trim).unwrap_or("").is_empty())
            .cloned()
            .collect()
    }

    /// Resolved (name, value) pairs for the spec's declared variables that
    /// are present; used when building the child process environment.
    pub fn resolved_for(&self, spec: &ServiceSpec) -> Vec<(String, String)> {
        spec.env
            .iter()
            .filter_map(|name| self.get(name).map(|v| (name.clone(), v.to_string())))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [defaults]
        connect_timeout_ms = 2000
        settle_delay_ms = 100

        [defaults.retry]
        max_retries = 2
        base_delay_ms = 50

        [services.slack]
        command = "npx"
        args = ["-y", "@slack/mcp"]
        env = ["SLACK_BOT_TOKEN", "SLACK_TEAM_ID"]
        required = true
        tools = ["send_message", "list_channels"]
        smoke_tool = "list_channels"

        [services.notion]
        command = "npx"
        args = ["-y", "@notion/mcp"]
        env = ["NOTION_API_KEY"]
        tools = ["search_pages"]
        tool_call_timeout_ms = 5000

        [services.notion.retry]
        max_retries = 5
    "#;

    #[test]
    fn resolves_sample_config() {
        let config = HarnessConfig::load_str(SAMPLE).unwrap();
        let specs = config.resolve().unwrap();
        assert_eq!(specs.len(), 2);

        let slack = &specs["slack"];
        assert!(slack.required);
        assert_eq!(slack.timeouts.connect, Duration::from_millis(2000));
        assert_eq!(slack.retry.max_retries, 2);
        assert_eq!(slack.smoke_tool.as_deref(), Some("list_channels"));

        let notion = &specs["notion"];
        assert!(!notion.required);
        assert_eq!(notion.timeouts.tool_call, Duration::from_millis(5000));
        assert_eq!(notion.retry.max_retries, 5);
        assert_eq!(config.settle_delay(), Duration::from_millis(100));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attest.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.services.len(), 2);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = HarnessConfig::load("/nonexistent/attest.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn unparsable_syntax_is_parse_error() {
        let err = HarnessConfig::load_str("not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_command_fails_at_parse() {
        // `command` has no default; toml reports the missing field.
        let err = HarnessConfig::load_str("[services.x]\nrequired = true").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn empty_command_is_rejected() {
        let config = HarnessConfig::load_str("[services.x]\ncommand = \"  \"").unwrap();
        let err = config.resolve().unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn duplicate_tool_is_rejected() {
        let config =
            HarnessConfig::load_str("[services.x]\ncommand = \"w\"\ntools = [\"a\", \"a\"]")
                .unwrap();
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("duplicate tool"));
    }

    #[test]
    fn smoke_tool_must_be_declared() {
        let config = HarnessConfig::load_str(
            "[services.x]\ncommand = \"w\"\ntools = [\"a\"]\nsmoke_tool = \"b\"",
        )
        .unwrap();
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("smoke_tool"));
    }

    #[test]
    fn shrinking_multiplier_is_rejected() {
        let config = HarnessConfig::load_str(
            "[defaults.retry]\nmultiplier = 0.5\n\n[services.x]\ncommand = \"w\"",
        )
        .unwrap();
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("multiplier"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config =
            HarnessConfig::load_str("[services.x]\ncommand = \"w\"\nconnect_timeout_ms = 0")
                .unwrap();
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn snapshot_reports_missing_names_in_order() {
        let config = HarnessConfig::load_str(SAMPLE).unwrap();
        let specs = config.resolve().unwrap();
        let snapshot = EnvSnapshot::from_pairs([("SLACK_TEAM_ID", "T123")]);
        assert_eq!(
            snapshot.missing_for(&specs["slack"]),
            vec!["SLACK_BOT_TOKEN".to_string()]
        );
        assert!(snapshot.missing_for(&specs["notion"]).contains(&"NOTION_API_KEY".to_string()));
    }

    #[test]
    fn snapshot_treats_empty_value_as_missing() {
        let config = HarnessConfig::load_str(SAMPLE).unwrap();
        let specs = config.resolve().unwrap();
        let snapshot =
            EnvSnapshot::from_pairs([("SLACK_BOT_TOKEN", ""), ("SLACK_TEAM_ID", "T123")]);
        assert_eq!(
            snapshot.missing_for(&specs["slack"]),
            vec!["SLACK_BOT_TOKEN".to_string()]
        );
    }
}
