//! Engine configuration
//!
//! Loaded from a JSON file. Every field has a default, so `{}` is a valid
//! configuration. Validation happens once at load; invalid configuration
//! is fatal at startup.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryConfig;
use crate::errors::{EngineError, EngineResult};
use crate::feed::FeedConfig;
use crate::registry::RegistryConfig;
use crate::scheduler::SchedulerConfig;
use crate::server::ServerConfig;
use crate::store::MemoryStoreConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub delivery: DeliveryConfig,
    pub feed: FeedConfig,
    pub registry: RegistryConfig,
    pub server: ServerConfig,
    /// In-memory reference store settings (demo server only)
    pub store: MemoryStoreConfig,
    /// Listener checkpoint file; in-memory when unset
    pub checkpoint_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> EngineResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration text
    pub fn from_json(content: &str) -> EngineResult<Self> {
        let config: EngineConfig = serde_json::from_str(content)
            .map_err(|e| EngineError::Config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.scheduler.recompute_workers == 0 {
            return Err(invalid("scheduler.recompute_workers must be > 0"));
        }
        if self.scheduler.max_consecutive_failures == 0 {
            return Err(invalid("scheduler.max_consecutive_failures must be > 0"));
        }

        if self.delivery.soft_bound == 0 {
            return Err(invalid("delivery.soft_bound must be > 0"));
        }
        if self.delivery.hard_ceiling < self.delivery.soft_bound {
            return Err(invalid(format!(
                "delivery.hard_ceiling ({}) must be >= delivery.soft_bound ({})",
                self.delivery.hard_ceiling, self.delivery.soft_bound
            )));
        }

        if self.feed.max_batch_events == 0 {
            return Err(invalid("feed.max_batch_events must be > 0"));
        }
        if self.feed.reconnect_initial_backoff_ms > self.feed.reconnect_max_backoff_ms {
            return Err(invalid(
                "feed.reconnect_initial_backoff_ms must be <= feed.reconnect_max_backoff_ms",
            ));
        }

        if self.registry.max_subscriptions_per_connection == 0 {
            return Err(invalid("registry.max_subscriptions_per_connection must be > 0"));
        }

        if self.store.log_retention == 0 {
            return Err(invalid("store.log_retention must be > 0"));
        }

        self.server
            .bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| invalid(format!("server.bind_addr '{}': {}", self.server.bind_addr, e)))?;
        if self.server.heartbeat_interval_secs == 0 {
            return Err(invalid("server.heartbeat_interval_secs must be > 0"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::Config(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_object_is_default() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config.scheduler.max_consecutive_failures, 3);
        assert_eq!(config.feed.debounce_ms, 20);
        assert_eq!(config.registry.max_subscriptions_per_connection, 100);
        assert!(config.checkpoint_path.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config = EngineConfig::from_json(
            r#"{"delivery": {"soft_bound": 4, "hard_ceiling": 8}, "feed": {"debounce_ms": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.delivery.soft_bound, 4);
        assert_eq!(config.delivery.overflow_grace_ms, 1_000);
        assert_eq!(config.feed.debounce_ms, 5);
        assert_eq!(config.feed.max_batch_events, 512);
    }

    #[test]
    fn test_ceiling_below_soft_bound_rejected() {
        let err = EngineConfig::from_json(r#"{"delivery": {"soft_bound": 10, "hard_ceiling": 5}}"#)
            .unwrap_err();
        assert_eq!(err.code(), "REFLUX_CONFIG_INVALID");
        assert!(err.to_string().contains("hard_ceiling"));
    }

    #[test]
    fn test_bad_bind_addr_rejected() {
        let err = EngineConfig::from_json(r#"{"server": {"bind_addr": "nowhere"}}"#).unwrap_err();
        assert!(err.to_string().contains("bind_addr"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reflux.json");
        fs::write(&path, r#"{"scheduler": {"recompute_workers": 2}}"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.scheduler.recompute_workers, 2);

        let missing = EngineConfig::load(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(missing, EngineError::Config(_)));
    }
}
