//! # Stage: In-Memory Store
//!
//! ## Responsibility
//! Process-local [`ExperimentStore`] for tests and ephemeral runs.
//!
//! ## Guarantees
//! - Atomic: every trait call runs under a single `Mutex` guard, so compound
//!   mutations (check-then-insert, append-then-increment) cannot interleave
//! - Non-panicking: a poisoned lock surfaces as `EngineError::Persistence`
//!
//! ## NOT Responsible For
//! - Durability across restarts (use [`super::SqliteStore`])

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{ExperimentFilter, ExperimentStore};
use crate::engine::model::{
    Arm, AssignOutcome, Completion, Experiment, ExperimentStatus, RecordOutcome, ResultEvent,
    VisitorAssignment,
};
use crate::error::{EngineError, Result};

#[derive(Debug, Default)]
struct MemoryState {
    /// Insertion order is significant for tie-breaking in `list_experiments`.
    experiments: Vec<Experiment>,
    index: HashMap<String, usize>,
    assignments: HashMap<(String, String), VisitorAssignment>,
    results: Vec<ResultEvent>,
}

impl MemoryState {
    fn experiment_mut(&mut self, id: &str) -> Option<&mut Experiment> {
        let idx = *self.index.get(id)?;
        self.experiments.get_mut(idx)
    }
}

/// `Mutex`-guarded in-memory store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::Persistence("in-memory store lock poisoned".into()))
    }

    /// Number of stored experiments.
    pub fn experiment_count(&self) -> usize {
        self.state.lock().map(|s| s.experiments.len()).unwrap_or(0)
    }

    /// Number of stored visitor assignments.
    pub fn assignment_count(&self) -> usize {
        self.state.lock().map(|s| s.assignments.len()).unwrap_or(0)
    }
}

impl ExperimentStore for InMemoryStore {
    fn insert_experiment(&self, experiment: &Experiment) -> Result<()> {
        let mut state = self.lock()?;
        if state.index.contains_key(&experiment.id) {
            return Err(EngineError::Persistence(format!(
                "experiment '{}' already exists",
                experiment.id
            )));
        }
        let idx = state.experiments.len();
        state.index.insert(experiment.id.clone(), idx);
        state.experiments.push(experiment.clone());
        Ok(())
    }

    fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        let state = self.lock()?;
        Ok(state.index.get(id).and_then(|&i| state.experiments.get(i)).cloned())
    }

    fn list_experiments(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>> {
        let state = self.lock()?;
        // Reverse insertion order first so the stable sort keeps newest-inserted
        // ahead on equal start dates.
        let mut out: Vec<Experiment> =
            state.experiments.iter().rev().filter(|e| filter.matches(e)).cloned().collect();
        out.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        Ok(out)
    }

    fn update_status(
        &self,
        id: &str,
        expected: ExperimentStatus,
        target: ExperimentStatus,
        end_date: Option<u64>,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let exp = state.experiment_mut(id).ok_or_else(|| EngineError::not_found(id))?;
        if exp.status != expected {
            return Ok(false);
        }
        exp.status = target;
        if end_date.is_some() {
            exp.end_date = end_date;
        }
        Ok(true)
    }

    fn complete_experiment(
        &self,
        id: &str,
        from: &[ExperimentStatus],
        completion: &Completion,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let exp = state.experiment_mut(id).ok_or_else(|| EngineError::not_found(id))?;
        if !from.contains(&exp.status) {
            return Ok(false);
        }
        exp.status = ExperimentStatus::Completed;
        exp.winner = Some(completion.winner);
        exp.confidence_level = Some(completion.confidence_level);
        exp.statistical_significance = Some(completion.statistical_significance);
        exp.improvement_percentage = Some(completion.improvement_percentage);
        exp.end_date = Some(completion.end_date);
        Ok(true)
    }

    fn assign_if_absent(
        &self,
        experiment_id: &str,
        visitor_id: &str,
        arm: Arm,
        now_ms: u64,
    ) -> Result<Option<AssignOutcome>> {
        let mut state = self.lock()?;
        if !state.index.contains_key(experiment_id) {
            return Err(EngineError::not_found(experiment_id));
        }
        let key = (experiment_id.to_string(), visitor_id.to_string());
        if let Some(existing) = state.assignments.get(&key) {
            return Ok(Some(AssignOutcome { assignment: existing.clone(), created: false }));
        }

        let exp = state
            .experiment_mut(experiment_id)
            .ok_or_else(|| EngineError::not_found(experiment_id))?;
        if exp.status != ExperimentStatus::Active {
            return Ok(None);
        }
        match arm {
            Arm::Control => exp.control_visitors += 1,
            Arm::Variant => exp.variant_visitors += 1,
        }

        let assignment = VisitorAssignment {
            experiment_id: experiment_id.to_string(),
            visitor_id: visitor_id.to_string(),
            arm,
            assigned_at: now_ms,
        };
        state.assignments.insert(key, assignment.clone());
        Ok(Some(AssignOutcome { assignment, created: true }))
    }

    fn get_assignment(
        &self,
        experiment_id: &str,
        visitor_id: &str,
    ) -> Result<Option<VisitorAssignment>> {
        let state = self.lock()?;
        Ok(state
            .assignments
            .get(&(experiment_id.to_string(), visitor_id.to_string()))
            .cloned())
    }

    fn record_result(&self, event: &ResultEvent) -> Result<RecordOutcome> {
        let mut state = self.lock()?;
        let exp = state
            .experiment_mut(&event.experiment_id)
            .ok_or_else(|| EngineError::not_found(&event.experiment_id))?;

        let mut counted = false;
        if event.converted && !exp.status.is_terminal() {
            let (conversions, visitors) = match event.arm {
                Arm::Control => (&mut exp.control_conversions, exp.control_visitors),
                Arm::Variant => (&mut exp.variant_conversions, exp.variant_visitors),
            };
            if *conversions < visitors {
                *conversions += 1;
                counted = true;
            }
        }
        state.results.push(event.clone());
        Ok(RecordOutcome { counted })
    }

    fn results_for(&self, experiment_id: &str) -> Result<Vec<ResultEvent>> {
        let state = self.lock()?;
        Ok(state
            .results
            .iter()
            .filter(|r| r.experiment_id == experiment_id)
            .cloned()
            .collect())
    }
}
