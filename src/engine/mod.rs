//! # Module: engine
//!
//! The experiment engine: lifecycle, visitor assignment, result recording and
//! significance-based decisioning.
//!
//! ```text
//!  create ──► Experiment (active) ──► assign ──► visitors++
//!                  │                   record ──► conversions++
//!                  ▼
//!            analyze / sweep ──► StatisticalAnalysis ──► caller
//!                  │
//!                  └─ declare_winner ──► CompletionQueue ──► CompletionWorker
//!                                                              │
//!                                                  complete_experiment
//! ```
//!
//! The engine holds no mutable state of its own: every operation reads and
//! writes through the [`ExperimentStore`], so an [`ExperimentEngine`] can be
//! shared behind an `Arc` and called concurrently.
//!
//! ## Sub-modules
//! - [`model`]: experiments, arms, statuses, assignments, result events
//! - [`bucketing`]: deterministic visitor hash and arm selection
//! - [`stats`]: z-test, p-value, minimum sample size, decision policy
//! - [`lifecycle`]: create, status actions, completion
//! - [`assignment`]: idempotent assignment and active-experiment selection
//! - [`results`]: result recording
//! - [`completion`]: fire-and-forget completion queue and worker

pub mod assignment;
pub mod bucketing;
pub mod completion;
pub mod lifecycle;
pub mod model;
pub mod results;
pub mod stats;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::now_ms;
use crate::store::{ExperimentFilter, ExperimentStore};

pub use assignment::SelectionPolicy;
pub use completion::{CompletionJob, CompletionQueue, CompletionWorker};
pub use model::{
    Arm, Assignment, Experiment, ExperimentStatus, NewExperiment, RecordOutcome, ResultInput,
    StatusAction, TrafficSplit,
};
pub use stats::{AnalysisConfig, RecommendedAction, StatisticalAnalysis};

// ---------------------------------------------------------------------------
// EngineSettings
// ---------------------------------------------------------------------------

/// Tunables for an [`ExperimentEngine`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub analysis: AnalysisConfig,
    pub selection: SelectionPolicy,
}

// ---------------------------------------------------------------------------
// ExperimentEngine
// ---------------------------------------------------------------------------

/// Stateless façade over an [`ExperimentStore`].
pub struct ExperimentEngine {
    store: Arc<dyn ExperimentStore>,
    settings: EngineSettings,
    completions: CompletionQueue,
}

impl ExperimentEngine {
    /// Create an engine and the worker that drains its completion queue.
    ///
    /// The worker must be spawned (or run) for `declare_winner` decisions to
    /// take effect; dropping it turns completion submissions into logged no-ops.
    pub fn new(
        store: Arc<dyn ExperimentStore>,
        settings: EngineSettings,
    ) -> (Self, CompletionWorker) {
        let (completions, worker) = completion::channel(Arc::clone(&store));
        (Self { store, settings, completions }, worker)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn ExperimentStore> {
        &self.store
    }

    /// Fetch an experiment, failing with `NotFound` if it does not exist.
    pub fn get_experiment(&self, id: &str) -> Result<Experiment> {
        if id.trim().is_empty() {
            return Err(EngineError::validation("experiment_id is required"));
        }
        self.store.get_experiment(id)?.ok_or_else(|| EngineError::not_found(id))
    }

    pub fn list_experiments(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>> {
        self.store.list_experiments(filter)
    }

    // -----------------------------------------------------------------------
    // Analysis
    // -----------------------------------------------------------------------

    /// Analyze one experiment. A `declare_winner` recommendation on an active
    /// experiment queues its completion; the analysis returns without waiting.
    pub fn analyze_experiment(&self, id: &str) -> Result<StatisticalAnalysis> {
        let experiment = self.get_experiment(id)?;
        let analysis = stats::analyze(&experiment, &self.settings.analysis, now_ms());
        self.act_on(&experiment, &analysis);
        Ok(analysis)
    }

    /// Analyze every active experiment, optionally scoped to one site.
    pub fn sweep(&self, site_id: Option<&str>) -> Result<Vec<StatisticalAnalysis>> {
        let mut filter = ExperimentFilter::default().with_status(ExperimentStatus::Active);
        filter.site_id = site_id.map(str::to_string);
        let experiments = self.store.list_experiments(&filter)?;
        let now = now_ms();

        let analyses: Vec<StatisticalAnalysis> = experiments
            .iter()
            .map(|experiment| {
                let analysis = stats::analyze(experiment, &self.settings.analysis, now);
                self.act_on(experiment, &analysis);
                analysis
            })
            .collect();

        info!(
            target: "ab_engine::engine",
            site_id = site_id.unwrap_or("*"),
            analyzed = analyses.len(),
            winners = analyses
                .iter()
                .filter(|a| a.recommended_action == RecommendedAction::DeclareWinner)
                .count(),
            "sweep finished"
        );
        Ok(analyses)
    }

    fn act_on(&self, experiment: &Experiment, analysis: &StatisticalAnalysis) {
        match analysis.recommended_action {
            RecommendedAction::DeclareWinner if experiment.status == ExperimentStatus::Active => {
                self.completions.submit(CompletionJob {
                    experiment_id: experiment.id.clone(),
                    analysis: analysis.clone(),
                });
            }
            RecommendedAction::StopTest => {
                info!(
                    target: "ab_engine::engine",
                    experiment_id = %experiment.id,
                    sample_size = analysis.sample_size,
                    min_sample_size = analysis.min_sample_size,
                    p_value = analysis.p_value,
                    "futility: sample is twice the minimum without significance"
                );
            }
            _ => {
                debug!(
                    target: "ab_engine::engine",
                    experiment_id = %experiment.id,
                    action = %analysis.recommended_action,
                    "analysis"
                );
            }
        }
    }
}

/// `true` for JSON `null` and empty/whitespace strings.
pub(crate) fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}
