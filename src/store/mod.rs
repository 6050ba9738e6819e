//! # Module: store
//!
//! Persistence collaborator for the experiment engine.
//!
//! The engine is stateless between calls; every durable fact (experiment
//! records, visitor assignments, result events) lives behind
//! [`ExperimentStore`]. Compound mutations are single store calls so each
//! implementation can make them atomic:
//!
//! - [`ExperimentStore::assign_if_absent`]: existence check, assignment insert
//!   and visitor-counter increment in one transaction
//! - [`ExperimentStore::record_result`]: event append and conditional
//!   conversion-counter increment in one transaction
//! - [`ExperimentStore::update_status`]: compare-and-swap on the previous status
//! - [`ExperimentStore::complete_experiment`]: conditional on the caller's allowed statuses
//!
//! ## Sub-modules
//! - [`memory`]: `Mutex`-guarded in-process store (tests, ephemeral runs)
//! - [`sqlite`]: `rusqlite` store with `BEGIN IMMEDIATE` transactions

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::engine::model::{
    Arm, AssignOutcome, Completion, Experiment, ExperimentStatus, RecordOutcome, ResultEvent,
    VisitorAssignment,
};
use crate::error::Result;

/// Query filter for [`ExperimentStore::list_experiments`]. `None` matches all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExperimentFilter {
    pub site_id: Option<String>,
    pub status: Option<ExperimentStatus>,
    pub kind: Option<String>,
}

impl ExperimentFilter {
    pub fn site(site_id: impl Into<String>) -> Self {
        Self { site_id: Some(site_id.into()), ..Default::default() }
    }

    pub fn with_status(mut self, status: ExperimentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_kind(mut self, kind: Option<String>) -> Self {
        self.kind = kind;
        self
    }

    pub fn matches(&self, e: &Experiment) -> bool {
        self.site_id.as_ref().map_or(true, |s| *s == e.site_id)
            && self.status.map_or(true, |s| s == e.status)
            && self.kind.as_ref().map_or(true, |k| *k == e.kind)
    }
}

/// Keyed store of experiments, assignments and result events.
pub trait ExperimentStore: Send + Sync {
    /// Insert a new experiment. Fails if the id already exists.
    fn insert_experiment(&self, experiment: &Experiment) -> Result<()>;

    fn get_experiment(&self, id: &str) -> Result<Option<Experiment>>;

    /// Experiments matching `filter`, newest `start_date` first; ties resolve
    /// to the most recently inserted.
    fn list_experiments(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>>;

    /// Move `id` from `expected` to `target`. Returns `false` when the stored
    /// status is no longer `expected`. `end_date`, when given, is recorded too.
    fn update_status(
        &self,
        id: &str,
        expected: ExperimentStatus,
        target: ExperimentStatus,
        end_date: Option<u64>,
    ) -> Result<bool>;

    /// Mark `id` completed with its audit fields, only if its current status
    /// is one of `from`. Returns `false` otherwise.
    fn complete_experiment(
        &self,
        id: &str,
        from: &[ExperimentStatus],
        completion: &Completion,
    ) -> Result<bool>;

    /// Atomically return the existing assignment for the pair, or record a new
    /// one with `arm` and increment that arm's visitor counter.
    ///
    /// Returns `Ok(None)` when there is no existing assignment and the
    /// experiment is not `active`. Fails with `NotFound` for unknown ids.
    fn assign_if_absent(
        &self,
        experiment_id: &str,
        visitor_id: &str,
        arm: Arm,
        now_ms: u64,
    ) -> Result<Option<AssignOutcome>>;

    fn get_assignment(
        &self,
        experiment_id: &str,
        visitor_id: &str,
    ) -> Result<Option<VisitorAssignment>>;

    /// Append `event`; if it is a conversion, increment the arm's conversion
    /// counter unless that would exceed the arm's visitors or the experiment
    /// is terminal. Fails with `NotFound` for unknown experiments.
    fn record_result(&self, event: &ResultEvent) -> Result<RecordOutcome>;

    /// Result events for an experiment in append order.
    fn results_for(&self, experiment_id: &str) -> Result<Vec<ResultEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::TrafficSplit;
    use serde_json::json;

    fn exp(site: &str, kind: &str, status: ExperimentStatus) -> Experiment {
        Experiment {
            id: "e".into(),
            site_id: site.into(),
            name: "n".into(),
            kind: kind.into(),
            control_content: json!("A"),
            variant_content: json!("B"),
            traffic_split: TrafficSplit::default(),
            start_date: 0,
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
        }
    }

    #[test]
    fn test_filter_default_matches_everything() {
        let f = ExperimentFilter::default();
        assert!(f.matches(&exp("s1", "general", ExperimentStatus::Draft)));
        assert!(f.matches(&exp("s2", "cta", ExperimentStatus::Completed)));
    }

    #[test]
    fn test_filter_site_status_kind() {
        let f = ExperimentFilter::site("s1")
            .with_status(ExperimentStatus::Active)
            .with_kind(Some("cta".into()));
        assert!(f.matches(&exp("s1", "cta", ExperimentStatus::Active)));
        assert!(!f.matches(&exp("s2", "cta", ExperimentStatus::Active)));
        assert!(!f.matches(&exp("s1", "general", ExperimentStatus::Active)));
        assert!(!f.matches(&exp("s1", "cta", ExperimentStatus::Paused)));
    }
}
