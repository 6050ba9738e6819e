//! Result recording.
//!
//! Each call appends one [`ResultEvent`]; a conversion also bumps the arm's
//! conversion counter inside the same store transaction, unless that would
//! push conversions past visitors or the experiment is already terminal.
//! Recording is not idempotent: callers that retry may append twice.

use tracing::{debug, warn};

use super::model::{RecordOutcome, ResultEvent, ResultInput};
use super::ExperimentEngine;
use crate::error::{EngineError, Result};
use crate::now_ms;

impl ExperimentEngine {
    pub fn record_result(&self, input: ResultInput) -> Result<RecordOutcome> {
        if input.experiment_id.trim().is_empty() {
            return Err(EngineError::validation("experiment_id is required"));
        }
        if input.visitor_id.trim().is_empty() {
            return Err(EngineError::validation("visitor_id is required"));
        }
        if !input.conversion_value.is_finite() {
            return Err(EngineError::validation("conversion_value must be a finite number"));
        }

        let event = ResultEvent {
            experiment_id: input.experiment_id,
            visitor_id: input.visitor_id,
            session_id: input.session_id,
            arm: input.variant,
            converted: input.converted,
            conversion_value: input.conversion_value,
            recorded_at: now_ms(),
        };
        let outcome = self.store.record_result(&event)?;

        if event.converted && !outcome.counted {
            warn!(
                target: "ab_engine::engine",
                experiment_id = %event.experiment_id,
                visitor_id = %event.visitor_id,
                arm = %event.arm,
                "conversion not counted: arm has no unconverted visitors or experiment is closed"
            );
        } else {
            debug!(
                target: "ab_engine::engine",
                experiment_id = %event.experiment_id,
                arm = %event.arm,
                converted = event.converted,
                "result recorded"
            );
        }
        Ok(outcome)
    }
}
