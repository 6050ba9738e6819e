//! # Stage: Completion Queue
//!
//! ## Responsibility
//! Decouple "this experiment has a winner" from persisting that fact.
//! Analysis submits a [`CompletionJob`] and returns at once; a
//! [`CompletionWorker`] drains the queue and writes the completion.
//!
//! ## Guarantees
//! - Non-blocking: [`CompletionQueue::submit`] never waits and never fails
//!   the caller; a closed queue is logged and reported as `false`
//! - At-most-once effect: completion is conditional in the store, so a job
//!   for an experiment that already finished is a logged no-op
//! - Operator wins: a job only completes an experiment that is still
//!   `active`; one paused after the analysis stays paused
//! - Off the runtime: store writes run on tokio's blocking pool
//! - Graceful stop: the worker exits once every queue handle is dropped and
//!   the backlog is drained
//!
//! ## NOT Responsible For
//! - Retrying failed completions (the next analysis resubmits)

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::lifecycle;
use super::stats::StatisticalAnalysis;
use crate::error::{EngineError, Result};
use crate::now_ms;
use crate::store::ExperimentStore;

/// Request to complete one experiment from a `declare_winner` analysis.
#[derive(Debug, Clone)]
pub struct CompletionJob {
    pub experiment_id: String,
    pub analysis: StatisticalAnalysis,
}

/// Sending half. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CompletionQueue {
    tx: mpsc::UnboundedSender<CompletionJob>,
}

impl CompletionQueue {
    /// Enqueue a job. Returns `false` if no worker is listening.
    pub fn submit(&self, job: CompletionJob) -> bool {
        let experiment_id = job.experiment_id.clone();
        match self.tx.send(job) {
            Ok(()) => {
                debug!(
                    target: "ab_engine::engine",
                    experiment_id = %experiment_id,
                    "completion queued"
                );
                true
            }
            Err(_) => {
                warn!(
                    target: "ab_engine::engine",
                    experiment_id = %experiment_id,
                    "completion worker is gone, job dropped"
                );
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Counters returned when a worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: u64,
    /// Jobs whose experiment was no longer `active`.
    pub skipped: u64,
    pub failed: u64,
}

/// Receiving half: drains jobs into the store.
pub struct CompletionWorker {
    rx: mpsc::UnboundedReceiver<CompletionJob>,
    store: Arc<dyn ExperimentStore>,
}

impl CompletionWorker {
    /// Process jobs until every [`CompletionQueue`] is dropped.
    pub async fn run(mut self) -> WorkerStats {
        let mut stats = WorkerStats::default();
        while let Some(job) = self.rx.recv().await {
            let experiment_id = job.experiment_id.clone();
            let store = Arc::clone(&self.store);
            let result = tokio::task::spawn_blocking(move || complete(store.as_ref(), &job))
                .await
                .unwrap_or_else(|e| {
                    Err(EngineError::Persistence(format!("completion task aborted: {e}")))
                });
            match result {
                Ok(true) => stats.completed += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    stats.failed += 1;
                    error!(
                        target: "ab_engine::engine",
                        experiment_id = %experiment_id,
                        error = %e,
                        "completion failed"
                    );
                }
            }
        }
        info!(
            target: "ab_engine::engine",
            completed = stats.completed,
            skipped = stats.skipped,
            failed = stats.failed,
            "completion worker stopped"
        );
        stats
    }

    /// Run on the current tokio runtime.
    pub fn spawn(self) -> JoinHandle<WorkerStats> {
        tokio::spawn(self.run())
    }

    /// Apply one job synchronously on the calling thread.
    pub fn process(&self, job: &CompletionJob) -> Result<bool> {
        complete(self.store.as_ref(), job)
    }
}

fn complete(store: &dyn ExperimentStore, job: &CompletionJob) -> Result<bool> {
    lifecycle::finalize(
        store,
        &job.experiment_id,
        lifecycle::DECISION_COMPLETABLE,
        &job.analysis,
        now_ms(),
    )
}

pub(crate) fn channel(store: Arc<dyn ExperimentStore>) -> (CompletionQueue, CompletionWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CompletionQueue { tx }, CompletionWorker { rx, store })
}
