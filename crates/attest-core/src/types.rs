use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// HealthState
// ---------------------------------------------------------------------------

/// Last-known health of a launched worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unstarted,
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthState::Unstarted => "unstarted",
            HealthState::Starting => "starting",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// TestStatus / TestResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

/// A single recorded check. Immutable once appended to a suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub status: TestStatus,
    /// Wall-clock duration of the check.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub message: String,
    /// Open diagnostic payload: missing variable names, response excerpts,
    /// attempt counts, and the like.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl TestResult {
    pub fn passed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, TestStatus::Passed, message)
    }

    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, TestStatus::Failed, message)
    }

    pub fn skipped(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, TestStatus::Skipped, message)
    }

    fn new(name: impl Into<String>, status: TestStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            duration: Duration::ZERO,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// TestSuite
// ---------------------------------------------------------------------------

/// An ordered, named group of results sharing a start/end lifecycle.
/// Once `ended_at` is set the suite is read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    pub name: String,
    pub results: Vec<TestResult>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TestSuite {
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// (passed, failed, skipped) counts for this suite.
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut passed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for result in &self.results {
            match result.status {
                TestStatus::Passed => passed += 1,
                TestStatus::Failed => failed += 1,
                TestStatus::Skipped => skipped += 1,
            }
        }
        (passed, failed, skipped)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Aggregated run output: every suite plus a summary recomputed from the
/// suite list at generation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub suites: Vec<TestSuite>,
    pub summary: ReportSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// passed / total, or 1.0 when no tests ran.
    pub success_rate: f64,
}

impl ReportSummary {
    /// Compute counts from a suite list. Never trusts a cached counter, so
    /// `total == passed + failed + skipped` holds by construction.
    pub fn from_suites(suites: &[TestSuite]) -> Self {
        let mut passed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for suite in suites {
            let (p, f, s) = suite.counts();
            passed += p;
            failed += f;
            skipped += s;
        }
        let total = passed + failed + skipped;
        let success_rate = if total == 0 {
            1.0
        } else {
            passed as f64 / total as f64
        };
        Self {
            total,
            passed,
            failed,
            skipped,
            success_rate,
        }
    }
}

// ---------------------------------------------------------------------------
// Duration <-> millis serde helper
// ---------------------------------------------------------------------------

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ended_suite(name: &str, results: Vec<TestResult>) -> TestSuite {
        TestSuite {
            name: name.to_string(),
            results,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
        }
    }

    #[test]
    fn suite_counts_by_status() {
        let suite = ended_suite(
            "environment",
            vec![
                TestResult::passed("a", "ok"),
                TestResult::failed("b", "bad"),
                TestResult::failed("c", "bad"),
                TestResult::skipped("d", "no smoke tool"),
            ],
        );
        assert_eq!(suite.counts(), (1, 2, 1));
    }

    #[test]
    fn summary_total_is_sum_of_parts() {
        let suites = vec![
            ended_suite("a", vec![TestResult::passed("x", "ok")]),
            ended_suite(
                "b",
                vec![
                    TestResult::failed("y", "bad"),
                    TestResult::skipped("z", "skip"),
                ],
            ),
        ];
        let summary = ReportSummary::from_suites(&suites);
        assert_eq!(summary.total, 3);
        assert_eq!(
            summary.total,
            summary.passed + summary.failed + summary.skipped
        );
    }

    #[test]
    fn summary_of_zero_tests() {
        let summary = ReportSummary::from_suites(&[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.total, summary.passed + summary.failed + summary.skipped);
        assert_eq!(summary.success_rate, 1.0);
    }

    #[test]
    fn result_details_round_trip() {
        let result = TestResult::failed("env:slack", "missing variables")
            .with_detail("missing", serde_json::json!(["SLACK_BOT_TOKEN"]))
            .with_duration(Duration::from_millis(12));
        let json = serde_json::to_string(&result).unwrap();
        let parsed: TestResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.status, TestStatus::Failed);
        assert_eq!(parsed.duration, Duration::from_millis(12));
        assert_eq!(
            parsed.details.get("missing").unwrap(),
            &serde_json::json!(["SLACK_BOT_TOKEN"])
        );
    }

    #[test]
    fn health_state_display() {
        assert_eq!(HealthState::Healthy.to_string(), "healthy");
        assert_eq!(HealthState::Unstarted.to_string(), "unstarted");
    }
}
