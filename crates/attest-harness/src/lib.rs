//! Harness layer: process lifecycle, health probing, tool invocation, and suite
//! execution for verifying a fleet of MCP tool servers.
//!
//! This crate is the execution layer between a validated service registry
//! (`attest-core`) and the external worker processes it exercises. It
//! coordinates:
//! - Launching workers sequentially or in parallel and tearing them down
//! - MCP (Model Context Protocol) stdio transport and message types
//! - Health probes and tool invocations under one shared retry policy
//! - Ordered test suites that record every check and never abort mid-run
//! - Concurrent load testing and report generation

pub mod error;
pub mod health;
pub mod invoker;
pub mod launcher;
pub mod loadtest;
pub mod mcp;
pub mod report;
pub mod runner;
pub mod transport;
