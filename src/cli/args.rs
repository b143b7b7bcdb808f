//! CLI argument definitions using clap
//!
//! Commands:
//! - reflux serve [--config <path>] [--seed <path>] [--bind <addr>]
//! - reflux check-config --config <path>

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::observability::LogFormat;

/// reflux - reactive query subscriptions over a change-feed store
#[derive(Parser, Debug)]
#[command(name = "reflux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormatArg::Json, global = true)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the engine and its WebSocket server over an in-memory store
    Serve {
        /// Path to configuration file (defaults apply when omitted)
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON file of initial rows: {"table": {"key": {..row..}}}
        #[arg(long)]
        seed: Option<PathBuf>,

        /// Override `server.bind_addr`
        #[arg(long)]
        bind: Option<String>,
    },

    /// Validate a configuration file and print the effective configuration
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./reflux.json")]
        config: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Json,
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve() {
        let cli = Cli::try_parse_from([
            "reflux",
            "--log-format",
            "text",
            "serve",
            "--seed",
            "rows.json",
            "--bind",
            "127.0.0.1:9000",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormatArg::Text);
        match cli.command {
            Command::Serve { config, seed, bind } => {
                assert!(config.is_none());
                assert_eq!(seed, Some(PathBuf::from("rows.json")));
                assert_eq!(bind.as_deref(), Some("127.0.0.1:9000"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_check_config_default_path() {
        let cli = Cli::try_parse_from(["reflux", "check-config"]).unwrap();
        match cli.command {
            Command::CheckConfig { config } => assert_eq!(config, PathBuf::from("./reflux.json")),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
