//! # Stage: Lifecycle
//!
//! ## Responsibility
//! Create experiments, apply operator status actions and record completion.
//!
//! ## Guarantees
//! - Validated: creation rejects blank identity/content and splits that do
//!   not sum to 100
//! - Race-safe: status changes are compare-and-swap on the previous status,
//!   retried a bounded number of times
//! - Audited: every path into `completed` writes winner, confidence,
//!   p-value, improvement and end date
//!
//! ## NOT Responsible For
//! - Deciding *when* to complete (see [`super::stats::recommend`])

use tracing::{debug, info};
use uuid::Uuid;

use super::model::{
    Completion, Experiment, ExperimentStatus, NewExperiment, StatusAction, TrafficSplit,
};
use super::stats::{self, StatisticalAnalysis};
use super::{is_blank, ExperimentEngine};
use crate::error::{EngineError, Result};
use crate::now_ms;
use crate::store::ExperimentStore;

/// Experiment type used when the caller does not supply one.
pub const DEFAULT_KIND: &str = "general";

/// Compare-and-swap attempts before a status change gives up.
const MAX_STATUS_ATTEMPTS: usize = 8;

/// Statuses an operator's `complete` action may finish from.
pub const OPERATOR_COMPLETABLE: &[ExperimentStatus] =
    &[ExperimentStatus::Active, ExperimentStatus::Paused];

/// Statuses a queued `declare_winner` decision may finish from. A pause that
/// lands between analysis and completion wins over the decision.
pub const DECISION_COMPLETABLE: &[ExperimentStatus] = &[ExperimentStatus::Active];

impl ExperimentEngine {
    /// Validate and persist a new experiment.
    ///
    /// The experiment starts `active` (or `draft` when `input.draft` is set)
    /// with zeroed counters and `start_date = now`.
    pub fn create_experiment(&self, input: NewExperiment) -> Result<Experiment> {
        if input.site_id.trim().is_empty() {
            return Err(EngineError::validation("site_id is required"));
        }
        if input.name.trim().is_empty() {
            return Err(EngineError::validation("name is required"));
        }
        if is_blank(&input.control_content) {
            return Err(EngineError::validation("control_content is required"));
        }
        if is_blank(&input.variant_content) {
            return Err(EngineError::validation("variant_content is required"));
        }
        let traffic_split = input.traffic_split.unwrap_or_default();
        traffic_split.validate()?;

        let kind = input
            .kind
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| DEFAULT_KIND.to_string());
        let status = if input.draft { ExperimentStatus::Draft } else { ExperimentStatus::Active };

        let experiment = Experiment {
            id: Uuid::new_v4().to_string(),
            site_id: input.site_id,
            name: input.name,
            kind,
            control_content: input.control_content,
            variant_content: input.variant_content,
            traffic_split,
            start_date: now_ms(),
            end_date: None,
            status,
            winner: None,
            confidence_level: None,
            statistical_significance: None,
            improvement_percentage: None,
            control_visitors: 0,
            variant_visitors: 0,
            control_conversions: 0,
            variant_conversions: 0,
        };
        self.store.insert_experiment(&experiment)?;

        info!(
            target: "ab_engine::engine",
            experiment_id = %experiment.id,
            site_id = %experiment.site_id,
            kind = %experiment.kind,
            status = %experiment.status,
            split = %format_split(&experiment.traffic_split),
            "experiment created"
        );
        Ok(experiment)
    }

    /// Apply a textual status action (`pause`, `resume`, `start`, `cancel`,
    /// `complete`) and return the resulting status.
    pub fn set_status(&self, experiment_id: &str, action: &str) -> Result<ExperimentStatus> {
        let action: StatusAction = action.parse()?;
        self.apply_action(experiment_id, action)
    }

    /// Typed form of [`set_status`](Self::set_status).
    ///
    /// Requesting the status the experiment already has is a successful no-op.
    /// `complete` runs the analysis first so the audit fields are populated.
    pub fn apply_action(
        &self,
        experiment_id: &str,
        action: StatusAction,
    ) -> Result<ExperimentStatus> {
        let target = action.target();

        for attempt in 1..=MAX_STATUS_ATTEMPTS {
            let experiment = self.get_experiment(experiment_id)?;
            let current = experiment.status;

            if current == target {
                debug!(
                    target: "ab_engine::engine",
                    experiment_id,
                    status = %current,
                    "status unchanged"
                );
                return Ok(current);
            }
            if !current.can_transition_to(target) {
                return Err(EngineError::invalid_action(
                    action.as_str(),
                    format!("cannot move a {current} experiment to {target}"),
                ));
            }

            let applied = if action == StatusAction::Complete {
                let analysis = stats::analyze(&experiment, &self.settings.analysis, now_ms());
                finalize(
                    self.store.as_ref(),
                    experiment_id,
                    OPERATOR_COMPLETABLE,
                    &analysis,
                    now_ms(),
                )?
            } else {
                let end_date = (target == ExperimentStatus::Cancelled).then(now_ms);
                self.store.update_status(experiment_id, current, target, end_date)?
            };

            if applied {
                info!(
                    target: "ab_engine::engine",
                    experiment_id,
                    action = action.as_str(),
                    from = %current,
                    to = %target,
                    "status changed"
                );
                return Ok(target);
            }
            debug!(
                target: "ab_engine::engine",
                experiment_id,
                attempt,
                "status changed underneath us, retrying"
            );
        }

        Err(EngineError::Persistence(format!(
            "status of '{experiment_id}' kept changing; gave up after {MAX_STATUS_ATTEMPTS} attempts"
        )))
    }

    /// Mark an experiment completed using `analysis` for the audit fields.
    ///
    /// Returns `false` (and changes nothing) when the experiment is no longer
    /// `active` or `paused`.
    pub fn complete_experiment(
        &self,
        experiment_id: &str,
        analysis: &StatisticalAnalysis,
    ) -> Result<bool> {
        finalize(self.store.as_ref(), experiment_id, OPERATOR_COMPLETABLE, analysis, now_ms())
    }
}

/// Audit fields derived from an analysis. Ties go to control.
pub fn completion_from(analysis: &StatisticalAnalysis, end_date: u64) -> Completion {
    Completion {
        winner: analysis.leading_arm(),
        confidence_level: analysis.confidence_level,
        statistical_significance: analysis.p_value,
        improvement_percentage: analysis.improvement_percentage,
        end_date,
    }
}

/// Complete `experiment_id` if its status is one of `from`. Shared by the
/// engine and the completion worker.
pub(crate) fn finalize(
    store: &dyn ExperimentStore,
    experiment_id: &str,
    from: &[ExperimentStatus],
    analysis: &StatisticalAnalysis,
    now: u64,
) -> Result<bool> {
    let completion = completion_from(analysis, now);
    let done = store.complete_experiment(experiment_id, from, &completion)?;
    if done {
        info!(
            target: "ab_engine::engine",
            experiment_id,
            winner = %completion.winner,
            confidence = completion.confidence_level,
            p_value = completion.statistical_significance,
            improvement = completion.improvement_percentage,
            "experiment completed"
        );
    } else {
        debug!(
            target: "ab_engine::engine",
            experiment_id,
            "completion skipped: experiment not in a completable status"
        );
    }
    Ok(done)
}

fn format_split(split: &TrafficSplit) -> String {
    format!("{}/{}", split.control, split.variant)
}
