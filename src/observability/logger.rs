//! Structured logging setup
//!
//! - One log line = one event
//! - JSON by default, human-readable text on request
//! - Filtered by `RUST_LOG`, falling back to the configured directive

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use super::{ObservabilityError, ObservabilityResult};

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = ObservabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "pretty" => Ok(LogFormat::Text),
            other => Err(ObservabilityError::new(format!("unknown log format: {}", other))),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Fails if one is already installed.
pub fn init_logging(format: LogFormat, default_directive: &str) -> ObservabilityResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| ObservabilityError::new(format!("invalid log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Text => builder.try_init(),
    };

    installed.map_err(|e| ObservabilityError::new(format!("logging already initialised: {}", e)))
}
