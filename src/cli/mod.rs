//! Command-line interface for the fuzz scheduler.
//!
//! Runs the controller loop, submits jobs, registers workers and reports
//! scheduler status.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
