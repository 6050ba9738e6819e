//! TOML configuration for the `ab-engine` binary.
//!
//! Every section and field is optional; an empty file yields the defaults.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [store]
//! path = "ab-engine.db"     # ":memory:" for a process-local store
//!
//! [analysis]
//! alpha = 0.05
//! min_visitors = 100
//! target_effect = 0.2
//!
//! [assignment]
//! selection = "most_recent" # or "oldest"
//!
//! [sweep]
//! interval_secs = 300       # 0 disables the scheduled sweep
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::{AnalysisConfig, EngineSettings, SelectionPolicy};
use crate::error::{EngineError, Result};
use crate::store::{ExperimentStore, InMemoryStore, SqliteStore};

/// Store path that selects [`crate::store::InMemoryStore`].
pub const MEMORY_STORE: &str = ":memory:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: 8080 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
}

impl StoreConfig {
    pub fn is_memory(&self) -> bool {
        self.path == MEMORY_STORE
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: "ab-engine.db".into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    pub selection: SelectionPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub analysis: AnalysisConfig,
    pub assignment: AssignmentConfig,
    pub sweep: SweepConfig,
}

impl EngineConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(EngineError::Config("server.host must not be empty".into()));
        }
        if self.store.path.trim().is_empty() {
            return Err(EngineError::Config("store.path must not be empty".into()));
        }
        self.analysis
            .validate()
            .map_err(|e| EngineError::Config(format!("analysis: {e}")))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings { analysis: self.analysis.clone(), selection: self.assignment.selection }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Open the configured store.
    pub fn open_store(&self) -> Result<Arc<dyn ExperimentStore>> {
        if self.store.is_memory() {
            return Ok(Arc::new(InMemoryStore::new()));
        }
        Ok(Arc::new(SqliteStore::open(Path::new(&self.store.path))?))
    }

    /// `None` when the scheduled sweep is disabled.
    pub fn sweep_interval(&self) -> Option<std::time::Duration> {
        (self.sweep.interval_secs > 0)
            .then(|| std::time::Duration::from_secs(self.sweep.interval_secs))
    }
}
