//! Command-line interface for trajforge.
//!
//! Provides the `run` command for generation runs and `status` for
//! inspecting a checkpoint log.

mod commands;

pub use commands::{build_config, parse_cli, run, run_with_cli, Cli, Commands, RunArgs, StatusArgs};
