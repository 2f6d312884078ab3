//! Observability infrastructure for the attest harness.
//!
//! Structured logging via the `tracing` ecosystem, with human-readable output
//! for interactive runs and JSON output for CI log collectors.

pub mod logging;
