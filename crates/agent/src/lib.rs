//! `jobagent`: CLI, config, logging, and host-telemetry wiring around
//! `jobagent-core`'s claim/supervise/retry engine.
//!
//! Out of scope for `jobagent-core` but in scope for a complete repo: the
//! job-type registry and demo executors ([`registry`]), config loading
//! ([`config`]), the default `sysinfo`-backed telemetry reporter
//! ([`telemetry`]), and the Child Runner entry point ([`child_runner`]).

pub mod child_runner;
pub mod cli;
pub mod config;
pub mod registry;
pub mod telemetry;
