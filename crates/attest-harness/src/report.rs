use std::fmt::Write as _;

use chrono::Utc;
use uuid::Uuid;

use attest_core::types::{Report, ReportSummary, TestStatus, TestSuite};

// ---------------------------------------------------------------------------
// ReportGenerator
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// A suite reached the generator without being ended.
    #[error("suite '{0}' was never ended")]
    UnterminatedSuite(String),
}

/// Assembles the final run report. The summary is always recomputed from the
/// suite list here, never accepted from a caller, so the counts cannot drift
/// from the results they describe.
pub struct ReportGenerator;

impl ReportGenerator {
    pub fn generate(suites: Vec<TestSuite>) -> Result<Report, ReportError> {
        if let Some(open) = suites.iter().find(|s| !s.is_ended()) {
            return Err(ReportError::UnterminatedSuite(open.name.clone()));
        }
        let summary = ReportSummary::from_suites(&suites);
        Ok(Report {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            suites,
            summary,
        })
    }

    /// Human-readable rendering for terminal output.
    pub fn render(report: &Report) -> String {
        let mut out = String::new();
        let s = &report.summary;
        let _ = writeln!(out, "run {}", report.run_id);
        let _ = writeln!(
            out,
            "{} tests: {} passed, {} failed, {} skipped ({:.1}% success)",
            s.total,
            s.passed,
            s.failed,
            s.skipped,
            s.success_rate * 100.0
        );

        for suite in &report.suites {
            let (passed, failed, skipped) = suite.counts();
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "== {} ({} passed, {} failed, {} skipped)",
                suite.name, passed, failed, skipped
            );
            for result in &suite.results {
                let glyph = match result.status {
                    TestStatus::Passed => "[PASS]",
                    TestStatus::Failed => "[FAIL]",
                    TestStatus::Skipped => "[SKIP]",
                };
                let _ = writeln!(
                    out,
                    "{glyph} {} ({}ms) {}",
                    result.name,
                    result.duration.as_millis(),
                    result.message
                );
                if result.status == TestStatus::Failed {
                    for (key, value) in &result.details {
                        if key == "service" {
                            continue;
                        }
                        let _ = writeln!(out, "       {key}: {value}");
                    }
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
