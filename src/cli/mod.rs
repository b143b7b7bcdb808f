//! CLI module for reflux
//!
//! Provides command-line interface for:
//! - serve: run the engine and WebSocket server over an in-memory store
//! - check-config: validate a configuration file

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command, LogFormatArg};
pub use commands::{check_config, load_seed, run, run_command, serve};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};
