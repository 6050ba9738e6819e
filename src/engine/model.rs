//! # Stage: Data Model
//!
//! ## Responsibility
//! Plain data types shared by the engine, the stores and the HTTP surface:
//! experiments, arms, statuses, assignments and result events.
//!
//! ## Guarantees
//! - Serializable: every type round-trips through JSON with lowercase enum tags
//! - Non-panicking: string parsing returns typed [`EngineError`]s
//!
//! ## NOT Responsible For
//! - Enforcing counter invariants (store transactions do that)
//! - Statistics (see [`super::stats`])

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Arm
// ---------------------------------------------------------------------------

/// One of the two experiment arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arm {
    Control,
    Variant,
}

impl Arm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arm::Control => "control",
            Arm::Variant => "variant",
        }
    }

    /// The opposite arm.
    pub fn other(&self) -> Arm {
        match self {
            Arm::Control => Arm::Variant,
            Arm::Variant => Arm::Control,
        }
    }
}

impl fmt::Display for Arm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "control" => Ok(Arm::Control),
            "variant" => Ok(Arm::Variant),
            "" => Err(EngineError::validation("variant is required")),
            other => Err(EngineError::validation(format!(
                "variant must be 'control' or 'variant', got '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ExperimentStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Active => "active",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Cancelled => "cancelled",
        }
    }

    /// `completed` and `cancelled` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Completed | ExperimentStatus::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `target`.
    ///
    /// ```text
    /// draft ──► active ⇄ paused
    ///             │        │
    ///             ▼        ▼
    ///          completed ◄─┘
    /// draft | active | paused ──► cancelled
    /// ```
    pub fn can_transition_to(&self, target: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, target),
            (Draft, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Completed)
                | (Paused, Completed)
                | (Draft, Cancelled)
                | (Active, Cancelled)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "draft" => Ok(ExperimentStatus::Draft),
            "active" => Ok(ExperimentStatus::Active),
            "paused" => Ok(ExperimentStatus::Paused),
            "completed" => Ok(ExperimentStatus::Completed),
            "cancelled" => Ok(ExperimentStatus::Cancelled),
            other => Err(EngineError::validation(format!("unknown status '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// StatusAction
// ---------------------------------------------------------------------------

/// Operator action requesting a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusAction {
    Pause,
    Resume,
    Start,
    Cancel,
    Complete,
}

impl StatusAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusAction::Pause => "pause",
            StatusAction::Resume => "resume",
            StatusAction::Start => "start",
            StatusAction::Cancel => "cancel",
            StatusAction::Complete => "complete",
        }
    }

    /// Status the action moves an experiment into.
    pub fn target(&self) -> ExperimentStatus {
        match self {
            StatusAction::Pause => ExperimentStatus::Paused,
            StatusAction::Resume | StatusAction::Start => ExperimentStatus::Active,
            StatusAction::Cancel => ExperimentStatus::Cancelled,
            StatusAction::Complete => ExperimentStatus::Completed,
        }
    }
}

impl FromStr for StatusAction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pause" => Ok(StatusAction::Pause),
            "resume" => Ok(StatusAction::Resume),
            "start" => Ok(StatusAction::Start),
            "cancel" => Ok(StatusAction::Cancel),
            "complete" => Ok(StatusAction::Complete),
            "" => Err(EngineError::validation("action is required")),
            other => Err(EngineError::invalid_action(
                other,
                "expected one of pause, resume, start, cancel, complete",
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// TrafficSplit
// ---------------------------------------------------------------------------

/// Percentage of traffic routed to each arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSplit {
    pub control: u32,
    pub variant: u32,
}

impl TrafficSplit {
    pub fn new(control: u32, variant: u32) -> Self {
        Self { control, variant }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.control.saturating_add(self.variant) != 100 {
            return Err(EngineError::validation(format!(
                "traffic split must sum to 100, got {}/{}",
                self.control, self.variant
            )));
        }
        Ok(())
    }
}

impl Default for TrafficSplit {
    fn default() -> Self {
        Self { control: 50, variant: 50 }
    }
}

// ---------------------------------------------------------------------------
// Experiment
// ---------------------------------------------------------------------------

/// Durable experiment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub site_id: String,
    pub name: String,
    /// Free-form tag used to scope assignment (e.g. `"headline"`).
    #[serde(rename = "type")]
    pub kind: String,
    pub control_content: Value,
    pub variant_content: Value,
    pub traffic_split: TrafficSplit,
    /// Creation/start time in ms since the Unix epoch.
    pub start_date: u64,
    pub end_date: Option<u64>,
    pub status: ExperimentStatus,
    pub winner: Option<Arm>,
    pub confidence_level: Option<f64>,
    /// Two-tailed p-value recorded at completion.
    pub statistical_significance: Option<f64>,
    pub improvement_percentage: Option<f64>,
    pub control_visitors: u64,
    pub variant_visitors: u64,
    pub control_conversions: u64,
    pub variant_conversions: u64,
}

impl Experiment {
    pub fn content(&self, arm: Arm) -> &Value {
        match arm {
            Arm::Control => &self.control_content,
            Arm::Variant => &self.variant_content,
        }
    }

    pub fn visitors(&self, arm: Arm) -> u64 {
        match arm {
            Arm::Control => self.control_visitors,
            Arm::Variant => self.variant_visitors,
        }
    }

    pub fn conversions(&self, arm: Arm) -> u64 {
        match arm {
            Arm::Control => self.control_conversions,
            Arm::Variant => self.variant_conversions,
        }
    }
}

/// Input for [`crate::engine::ExperimentEngine::create_experiment`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewExperiment {
    #[serde(default)]
    pub site_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub control_content: Value,
    #[serde(default)]
    pub variant_content: Value,
    #[serde(default)]
    pub traffic_split: Option<TrafficSplit>,
    /// Create in `draft` instead of `active`.
    #[serde(default)]
    pub draft: bool,
}

// ---------------------------------------------------------------------------
// Assignments
// ---------------------------------------------------------------------------

/// Durable `(experiment, visitor) → arm` mapping. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorAssignment {
    pub experiment_id: String,
    pub visitor_id: String,
    pub arm: Arm,
    pub assigned_at: u64,
}

/// Result of the store's atomic check-then-write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignOutcome {
    pub assignment: VisitorAssignment,
    /// `false` when an existing assignment was returned.
    pub created: bool,
}

/// What the caller renders for a visitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub variant: Arm,
    pub content: Option<Value>,
    pub experiment_id: Option<String>,
}

impl Assignment {
    /// Returned when no active experiment applies.
    pub fn neutral() -> Self {
        Self { variant: Arm::Control, content: None, experiment_id: None }
    }

    pub fn is_neutral(&self) -> bool {
        self.experiment_id.is_none()
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Input for [`crate::engine::ExperimentEngine::record_result`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultInput {
    pub experiment_id: String,
    pub visitor_id: String,
    #[serde(default)]
    pub session_id: String,
    pub variant: Arm,
    #[serde(default)]
    pub converted: bool,
    #[serde(default)]
    pub conversion_value: f64,
}

/// One appended outcome observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub experiment_id: String,
    pub visitor_id: String,
    pub session_id: String,
    pub arm: Arm,
    pub converted: bool,
    pub conversion_value: f64,
    pub recorded_at: u64,
}

/// Acknowledgement returned after recording a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    /// Whether the conversion counter was incremented.
    pub counted: bool,
}

/// Audit fields written when an experiment completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub winner: Arm,
    pub confidence_level: f64,
    pub statistical_significance: f64,
    pub improvement_percentage: f64,
    pub end_date: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
