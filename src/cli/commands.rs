//! CLI command implementations
//!
//! `serve` boots in a fixed order:
//! 1. configuration load and validation
//! 2. logging
//! 3. reference store, seeded from file
//! 4. engine start (listener + scheduler)
//! 5. WebSocket server, until ctrl-c
//!
//! Shutdown runs in reverse: server, then engine.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::functions::FunctionRegistry;
use crate::observability::{init_logging, Event, LogFormat};
use crate::server::WebSocketServer;
use crate::store::{MemoryStore, Write};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

const DEFAULT_LOG_DIRECTIVE: &str = "reflux=info";

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command, cli.log_format.into())
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command, log_format: LogFormat) -> CliResult<()> {
    match cmd {
        Command::Serve { config, seed, bind } => {
            let mut config = match config {
                Some(path) => EngineConfig::load(&path)?,
                None => EngineConfig::default(),
            };
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
                config.validate()?;
            }
            serve(config, seed.as_deref(), log_format)
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

/// Validate a configuration file and print the effective configuration.
pub fn check_config(path: &Path) -> CliResult<()> {
    match EngineConfig::load(path) {
        Ok(config) => write_response(serde_json::to_value(&config)?),
        Err(e) => {
            write_error(e.code(), &e.to_string())?;
            Err(e.into())
        }
    }
}

/// Serve until interrupted.
pub fn serve(config: EngineConfig, seed: Option<&Path>, log_format: LogFormat) -> CliResult<()> {
    init_logging(log_format, DEFAULT_LOG_DIRECTIVE)?;
    info!(event = %Event::ConfigLoaded, bind = %config.server.bind_addr);

    let store = Arc::new(MemoryStore::new(config.store.clone()));
    if let Some(path) = seed {
        let rows = load_seed(&store, path)?;
        info!(rows, seed = %path.display(), "store seeded");
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::serve_failed(format!("failed to create tokio runtime: {}", e)))?;

    runtime.block_on(async move {
        let server_config = config.server.clone();
        let engine = Arc::new(Engine::new(config, store, FunctionRegistry::with_builtins()));
        engine.start()?;

        let server = WebSocketServer::new(server_config, Arc::clone(&engine));
        let listener = server.bind().await?;

        let served = tokio::select! {
            served = server.serve(listener) => served,
            _ = tokio::signal::ctrl_c() => {
                server.shutdown();
                Ok(())
            }
        };

        let stopped = engine.shutdown().await;
        served?;
        stopped?;
        Ok::<(), CliError>(())
    })
}

/// Load `{"table": {"key": row}}` into `store` in one commit.
/// Returns the number of rows written.
pub fn load_seed(store: &MemoryStore, path: &Path) -> CliResult<usize> {
    let content = fs::read_to_string(path)
        .map_err(|e| CliError::seed_error(format!("failed to read {}: {}", path.display(), e)))?;
    let tables: Map<String, Value> = serde_json::from_str(&content)
        .map_err(|e| CliError::seed_error(format!("invalid seed JSON: {}", e)))?;

    let mut writes = Vec::new();
    for (table, rows) in tables {
        let Value::Object(rows) = rows else {
            return Err(CliError::seed_error(format!(
                "table '{}' must map keys to rows",
                table
            )));
        };
        for (key, row) in rows {
            writes.push(Write::insert(table.clone(), key, row));
        }
    }

    let count = writes.len();
    if count > 0 {
        store
            .commit(writes)
            .map_err(|e| CliError::seed_error(format!("seed rejected: {}", e)))?;
    }
    Ok(count)
}
