//! Core types for the attest MCP service harness: validated service
//! configuration, retry policy computation, and the result/report data
//! model shared by the harness and the CLI.

pub mod config;
pub mod retry;
pub mod types;
