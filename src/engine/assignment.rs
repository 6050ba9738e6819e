//! # Stage: Assignment
//!
//! ## Responsibility
//! Map a visitor to an arm of an experiment, once, and pick which active
//! experiment a site-level request should use.
//!
//! ## Guarantees
//! - Idempotent: an existing `(experiment, visitor)` assignment is always
//!   returned unchanged, whatever the experiment's current status or split
//! - Counted once: the visitor counter moves only when the store creates the
//!   assignment (see [`crate::store::ExperimentStore::assign_if_absent`])
//! - Neutral fallback: no applicable active experiment yields
//!   [`Assignment::neutral`], never an error
//!
//! ## NOT Responsible For
//! - The hash itself (see [`super::bucketing`])

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::bucketing;
use super::model::{Assignment, Experiment, ExperimentStatus};
use super::ExperimentEngine;
use crate::error::{EngineError, Result};
use crate::now_ms;
use crate::store::ExperimentFilter;

/// Which active experiment a site-level assignment uses when several match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Newest `start_date`; ties go to the most recently created.
    #[default]
    MostRecent,
    /// Oldest `start_date`.
    Oldest,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::MostRecent => "most_recent",
            SelectionPolicy::Oldest => "oldest",
        }
    }

    /// Pick from candidates ordered newest first, as
    /// [`crate::store::ExperimentStore::list_experiments`] returns them.
    pub fn select<'a>(&self, newest_first: &'a [Experiment]) -> Option<&'a Experiment> {
        match self {
            SelectionPolicy::MostRecent => newest_first.first(),
            SelectionPolicy::Oldest => newest_first.last(),
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "most_recent" => Ok(SelectionPolicy::MostRecent),
            "oldest" => Ok(SelectionPolicy::Oldest),
            other => Err(EngineError::Config(format!(
                "unknown selection policy '{other}' (expected most_recent or oldest)"
            ))),
        }
    }
}

impl ExperimentEngine {
    /// Assign `visitor_id` to an arm of `experiment_id`.
    ///
    /// A visitor seen before gets the same arm back. A new visitor is bucketed
    /// only while the experiment is `active`; otherwise the neutral assignment
    /// is returned and nothing is recorded.
    pub fn assign_variant(&self, experiment_id: &str, visitor_id: &str) -> Result<Assignment> {
        if visitor_id.trim().is_empty() {
            return Err(EngineError::validation("visitor_id is required"));
        }
        let experiment = self.get_experiment(experiment_id)?;
        let arm = bucketing::assign_arm(visitor_id, &experiment.traffic_split);

        match self.store.assign_if_absent(experiment_id, visitor_id, arm, now_ms())? {
            Some(outcome) => {
                let arm = outcome.assignment.arm;
                if outcome.created {
                    debug!(
                        target: "ab_engine::engine",
                        experiment_id,
                        visitor_id,
                        arm = %arm,
                        bucket = bucketing::bucket(visitor_id),
                        "visitor assigned"
                    );
                }
                Ok(Assignment {
                    variant: arm,
                    content: Some(experiment.content(arm).clone()),
                    experiment_id: Some(experiment.id),
                })
            }
            None => {
                debug!(
                    target: "ab_engine::engine",
                    experiment_id,
                    status = %experiment.status,
                    "experiment not accepting visitors, returning neutral assignment"
                );
                Ok(Assignment::neutral())
            }
        }
    }

    /// Assign a visitor for a site, choosing among its active experiments
    /// (optionally of one `kind`) with the configured [`SelectionPolicy`].
    pub fn assign_for_site(
        &self,
        site_id: &str,
        visitor_id: &str,
        kind: Option<&str>,
    ) -> Result<Assignment> {
        if site_id.trim().is_empty() {
            return Err(EngineError::validation("site_id is required"));
        }
        if visitor_id.trim().is_empty() {
            return Err(EngineError::validation("visitor_id is required"));
        }

        let kind = kind.map(str::trim).filter(|k| !k.is_empty()).map(str::to_string);
        let filter = ExperimentFilter::site(site_id)
            .with_status(ExperimentStatus::Active)
            .with_kind(kind);
        let candidates = self.store.list_experiments(&filter)?;

        match self.settings.selection.select(&candidates) {
            Some(experiment) => self.assign_variant(&experiment.id, visitor_id),
            None => {
                debug!(
                    target: "ab_engine::engine",
                    site_id,
                    kind = filter.kind.as_deref().unwrap_or("*"),
                    "no active experiment for site"
                );
                Ok(Assignment::neutral())
            }
        }
    }
}
