//! A/B-testing engine: deterministic visitor bucketing, conversion tracking
//! and two-proportion significance testing with automatic winner selection.
//!
//! ```text
//!  HTTP (web) ─┐
//!  CLI (cli) ──┼──► ExperimentEngine ──► ExperimentStore (memory | sqlite)
//!  library ────┘          │
//!                         └──► CompletionQueue ──► CompletionWorker
//! ```
//!
//! Library use:
//!
//! ```rust,ignore
//! let store = Arc::new(InMemoryStore::new());
//! let (engine, worker) = ExperimentEngine::new(store, EngineSettings::default());
//! worker.spawn();
//! let exp = engine.create_experiment(new_experiment)?;
//! let assignment = engine.assign_variant(&exp.id, "visitor-1")?;
//! ```

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod store;
pub mod web;

use std::time::{SystemTime, UNIX_EPOCH};

pub use config::EngineConfig;
pub use engine::{
    AnalysisConfig, Arm, Assignment, CompletionQueue, CompletionWorker, EngineSettings, Experiment,
    ExperimentEngine, ExperimentStatus, NewExperiment, RecommendedAction, RecordOutcome,
    ResultInput, SelectionPolicy, StatisticalAnalysis, StatusAction, TrafficSplit,
};
pub use error::{EngineError, Result};
pub use store::{ExperimentFilter, ExperimentStore, InMemoryStore, SqliteStore};

/// Milliseconds since the Unix epoch; 0 if the clock is before it.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
