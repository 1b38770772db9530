//! Store configuration.
//!
//! Supports TOML config files, environment variable overrides, and defaults.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Configuration for the entity store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Key prefix every record lives under (default: "miren")
    pub prefix: String,
    /// Capacity of the attribute-schema and kind-schema LRUs (default: 256,
    /// clamped to at least 100)
    pub schema_cache_entries: usize,
    /// Buffer size of entity watch channels (default: 256)
    pub watch_buffer: usize,
    /// Default TTL for sessions created without an explicit one, in seconds
    /// (default: 30)
    pub default_session_ttl_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: "miren".to_string(),
            schema_cache_entries: 256,
            watch_buffer: 256,
            default_session_ttl_seconds: 30,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| StoreError::Transport(format!("failed to read config file: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| StoreError::Transport(format!("invalid TOML: {e}")))
    }

    /// Applies environment variable overrides, prefixed with `ATTRDB_`.
    /// Example: `ATTRDB_PREFIX=prod` overrides `prefix`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = env::var("ATTRDB_PREFIX") {
            self.prefix = val;
        }
        if let Ok(val) = env::var("ATTRDB_SCHEMA_CACHE_ENTRIES") {
            self.schema_cache_entries = val
                .parse()
                .map_err(|_| StoreError::Transport(format!("invalid schema_cache_entries: {val}")))?;
        }
        if let Ok(val) = env::var("ATTRDB_WATCH_BUFFER") {
            self.watch_buffer = val
                .parse()
                .map_err(|_| StoreError::Transport(format!("invalid watch_buffer: {val}")))?;
        }
        if let Ok(val) = env::var("ATTRDB_DEFAULT_SESSION_TTL_SECONDS") {
            self.default_session_ttl_seconds = val.parse().map_err(|_| {
                StoreError::Transport(format!("invalid default_session_ttl_seconds: {val}"))
            })?;
        }
        Ok(())
    }

    pub fn default_session_ttl(&self) -> Duration {
        Duration::from_secs(self.default_session_ttl_seconds)
    }
}
