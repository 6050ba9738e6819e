//! # Stage: SQLite Store
//!
//! ## Responsibility
//! Durable [`ExperimentStore`] backed by `rusqlite`.
//!
//! ## Guarantees
//! - Atomic: compound mutations run inside `BEGIN IMMEDIATE`, which takes the
//!   write lock up front so concurrent check-then-write sequences serialize
//! - Counter increments are single `UPDATE ... SET n = n + 1` statements
//! - `conversions <= visitors` is enforced by the increment predicate and a
//!   `CHECK` constraint
//! - Status changes are compare-and-swap on the previous status
//!
//! ## NOT Responsible For
//! - Schema migrations beyond `CREATE TABLE IF NOT EXISTS`

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use tracing::debug;

use super::{ExperimentFilter, ExperimentStore};
use crate::engine::model::{
    Arm, AssignOutcome, Completion, Experiment, ExperimentStatus, RecordOutcome, ResultEvent,
    TrafficSplit, VisitorAssignment,
};
use crate::error::{EngineError, Result};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS experiments (
    seq                      INTEGER PRIMARY KEY AUTOINCREMENT,
    id                       TEXT    NOT NULL UNIQUE,
    site_id                  TEXT    NOT NULL,
    name                     TEXT    NOT NULL,
    type                     TEXT    NOT NULL,
    control_content          TEXT    NOT NULL,
    variant_content          TEXT    NOT NULL,
    split_control            INTEGER NOT NULL,
    split_variant            INTEGER NOT NULL,
    start_date               INTEGER NOT NULL,
    end_date                 INTEGER,
    status                   TEXT    NOT NULL,
    winner                   TEXT,
    confidence_level         REAL,
    statistical_significance REAL,
    improvement_percentage   REAL,
    control_visitors         INTEGER NOT NULL DEFAULT 0,
    variant_visitors         INTEGER NOT NULL DEFAULT 0,
    control_conversions      INTEGER NOT NULL DEFAULT 0,
    variant_conversions      INTEGER NOT NULL DEFAULT 0,
    CHECK (control_conversions <= control_visitors),
    CHECK (variant_conversions <= variant_visitors)
);
CREATE INDEX IF NOT EXISTS idx_experiments_site_status ON experiments (site_id, status);

CREATE TABLE IF NOT EXISTS visitor_assignments (
    experiment_id TEXT    NOT NULL REFERENCES experiments (id),
    visitor_id    TEXT    NOT NULL,
    arm           TEXT    NOT NULL,
    assigned_at   INTEGER NOT NULL,
    PRIMARY KEY (experiment_id, visitor_id)
);

CREATE TABLE IF NOT EXISTS result_events (
    seq              INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_id    TEXT    NOT NULL REFERENCES experiments (id),
    visitor_id       TEXT    NOT NULL,
    session_id       TEXT    NOT NULL,
    arm              TEXT    NOT NULL,
    converted        INTEGER NOT NULL,
    conversion_value REAL    NOT NULL,
    recorded_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_result_events_experiment ON result_events (experiment_id);
"#;

const EXPERIMENT_COLUMNS: &str = "id, site_id, name, type, control_content, variant_content, \
     split_control, split_variant, start_date, end_date, status, winner, confidence_level, \
     statistical_significance, improvement_percentage, control_visitors, variant_visitors, \
     control_conversions, variant_conversions";

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Experiment row as stored; converted with [`TryFrom`] so enum and JSON
/// decoding errors surface as `EngineError` rather than rusqlite errors.
struct ExperimentRow {
    id: String,
    site_id: String,
    name: String,
    kind: String,
    control_content: String,
    variant_content: String,
    split_control: i64,
    split_variant: i64,
    start_date: i64,
    end_date: Option<i64>,
    status: String,
    winner: Option<String>,
    confidence_level: Option<f64>,
    statistical_significance: Option<f64>,
    improvement_percentage: Option<f64>,
    control_visitors: i64,
    variant_visitors: i64,
    control_conversions: i64,
    variant_conversions: i64,
}

impl ExperimentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            site_id: row.get(1)?,
            name: row.get(2)?,
            kind: row.get(3)?,
            control_content: row.get(4)?,
            variant_content: row.get(5)?,
            split_control: row.get(6)?,
            split_variant: row.get(7)?,
            start_date: row.get(8)?,
            end_date: row.get(9)?,
            status: row.get(10)?,
            winner: row.get(11)?,
            confidence_level: row.get(12)?,
            statistical_significance: row.get(13)?,
            improvement_percentage: row.get(14)?,
            control_visitors: row.get(15)?,
            variant_visitors: row.get(16)?,
            control_conversions: row.get(17)?,
            variant_conversions: row.get(18)?,
        })
    }
}

impl TryFrom<ExperimentRow> for Experiment {
    type Error = EngineError;

    fn try_from(r: ExperimentRow) -> Result<Self> {
        let control_content: Value = serde_json::from_str(&r.control_content)?;
        let variant_content: Value = serde_json::from_str(&r.variant_content)?;
        let status = r
            .status
            .parse::<ExperimentStatus>()
            .map_err(|e| EngineError::Persistence(format!("corrupt status for {}: {e}", r.id)))?;
        let winner = r
            .winner
            .as_deref()
            .map(str::parse::<Arm>)
            .transpose()
            .map_err(|e| EngineError::Persistence(format!("corrupt winner for {}: {e}", r.id)))?;
        Ok(Experiment {
            id: r.id,
            site_id: r.site_id,
            name: r.name,
            kind: r.kind,
            control_content,
            variant_content,
            traffic_split: TrafficSplit::new(r.split_control as u32, r.split_variant as u32),
            start_date: r.start_date as u64,
            end_date: r.end_date.map(|d| d as u64),
            status,
            winner,
            confidence_level: r.confidence_level,
            statistical_significance: r.statistical_significance,
            improvement_percentage: r.improvement_percentage,
            control_visitors: r.control_visitors as u64,
            variant_visitors: r.variant_visitors as u64,
            control_conversions: r.control_conversions as u64,
            variant_conversions: r.variant_conversions as u64,
        })
    }
}

fn arm_columns(arm: Arm) -> (&'static str, &'static str) {
    match arm {
        Arm::Control => ("control_visitors", "control_conversions"),
        Arm::Variant => ("variant_visitors", "variant_conversions"),
    }
}

fn parse_arm(s: &str) -> Result<Arm> {
    s.parse::<Arm>()
        .map_err(|e| EngineError::Persistence(format!("corrupt arm '{s}': {e}")))
}

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// SQLite-backed experiment store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a file-backed store.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory store.
    pub fn memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        // WAL for file-backed DBs (no-op for in-memory)
        let _ = conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()));
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Persistence("sqlite connection lock poisoned".into()))
    }

    /// Run `f` inside `BEGIN IMMEDIATE`, committing on `Ok`. The transaction
    /// rolls back when dropped, so an `Err` from `f` or a failed `COMMIT`
    /// never leaves the shared connection mid-transaction.
    fn immediate<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                debug!(target: "ab_engine::store", error = %e, "rolling back transaction");
                Err(e)
            }
        }
    }

    fn status_of(conn: &Connection, id: &str) -> Result<Option<ExperimentStatus>> {
        let status: Option<String> = conn
            .query_row("SELECT status FROM experiments WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        status
            .map(|s| s.parse::<ExperimentStatus>())
            .transpose()
            .map_err(|e| EngineError::Persistence(format!("corrupt status for {id}: {e}")))
    }
}

impl ExperimentStore for SqliteStore {
    fn insert_experiment(&self, e: &Experiment) -> Result<()> {
        let control_content = serde_json::to_string(&e.control_content)?;
        let variant_content = serde_json::to_string(&e.variant_content)?;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO experiments (
                id, site_id, name, type, control_content, variant_content,
                split_control, split_variant, start_date, end_date, status, winner,
                confidence_level, statistical_significance, improvement_percentage,
                control_visitors, variant_visitors, control_conversions, variant_conversions
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            "#,
            params![
                e.id,
                e.site_id,
                e.name,
                e.kind,
                control_content,
                variant_content,
                i64::from(e.traffic_split.control),
                i64::from(e.traffic_split.variant),
                e.start_date as i64,
                e.end_date.map(|d| d as i64),
                e.status.as_str(),
                e.winner.map(|w| w.as_str()),
                e.confidence_level,
                e.statistical_significance,
                e.improvement_percentage,
                e.control_visitors as i64,
                e.variant_visitors as i64,
                e.control_conversions as i64,
                e.variant_conversions as i64,
            ],
        )?;
        Ok(())
    }

    fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE id = ?1"),
                [id],
                ExperimentRow::from_row,
            )
            .optional()?;
        row.map(Experiment::try_from).transpose()
    }

    fn list_experiments(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXPERIMENT_COLUMNS} FROM experiments \
             WHERE (?1 IS NULL OR site_id = ?1) \
               AND (?2 IS NULL OR status = ?2) \
               AND (?3 IS NULL OR type = ?3) \
             ORDER BY start_date DESC, seq DESC"
        ))?;
        let rows = stmt.query_map(
            params![filter.site_id, filter.status.map(|s| s.as_str()), filter.kind],
            ExperimentRow::from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Experiment::try_from(row?)?);
        }
        Ok(out)
    }

    fn update_status(
        &self,
        id: &str,
        expected: ExperimentStatus,
        target: ExperimentStatus,
        end_date: Option<u64>,
    ) -> Result<bool> {
        self.immediate(|conn| {
            if Self::status_of(conn, id)?.is_none() {
                return Err(EngineError::not_found(id));
            }
            let changed = conn.execute(
                "UPDATE experiments SET status = ?1, end_date = COALESCE(?2, end_date) \
                 WHERE id = ?3 AND status = ?4",
                params![target.as_str(), end_date.map(|d| d as i64), id, expected.as_str()],
            )?;
            Ok(changed == 1)
        })
    }

    fn complete_experiment(
        &self,
        id: &str,
        from: &[ExperimentStatus],
        c: &Completion,
    ) -> Result<bool> {
        self.immediate(|conn| {
            let status = Self::status_of(conn, id)?.ok_or_else(|| EngineError::not_found(id))?;
            if !from.contains(&status) {
                return Ok(false);
            }
            let changed = conn.execute(
                "UPDATE experiments SET status = 'completed', winner = ?1, confidence_level = ?2, \
                 statistical_significance = ?3, improvement_percentage = ?4, end_date = ?5 \
                 WHERE id = ?6",
                params![
                    c.winner.as_str(),
                    c.confidence_level,
                    c.statistical_significance,
                    c.improvement_percentage,
                    c.end_date as i64,
                    id,
                ],
            )?;
            Ok(changed == 1)
        })
    }

    fn assign_if_absent(
        &self,
        experiment_id: &str,
        visitor_id: &str,
        arm: Arm,
        now_ms: u64,
    ) -> Result<Option<AssignOutcome>> {
        self.immediate(|conn| {
            let status = Self::status_of(conn, experiment_id)?
                .ok_or_else(|| EngineError::not_found(experiment_id))?;

            let existing: Option<(String, i64)> = conn
                .query_row(
                    "SELECT arm, assigned_at FROM visitor_assignments \
                     WHERE experiment_id = ?1 AND visitor_id = ?2",
                    params![experiment_id, visitor_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((stored_arm, assigned_at)) = existing {
                return Ok(Some(AssignOutcome {
                    assignment: VisitorAssignment {
                        experiment_id: experiment_id.to_string(),
                        visitor_id: visitor_id.to_string(),
                        arm: parse_arm(&stored_arm)?,
                        assigned_at: assigned_at as u64,
                    },
                    created: false,
                }));
            }

            if status != ExperimentStatus::Active {
                return Ok(None);
            }

            conn.execute(
                "INSERT INTO visitor_assignments (experiment_id, visitor_id, arm, assigned_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![experiment_id, visitor_id, arm.as_str(), now_ms as i64],
            )?;
            let (visitors_col, _) = arm_columns(arm);
            conn.execute(
                &format!("UPDATE experiments SET {visitors_col} = {visitors_col} + 1 WHERE id = ?1"),
                [experiment_id],
            )?;

            Ok(Some(AssignOutcome {
                assignment: VisitorAssignment {
                    experiment_id: experiment_id.to_string(),
                    visitor_id: visitor_id.to_string(),
                    arm,
                    assigned_at: now_ms,
                },
                created: true,
            }))
        })
    }

    fn get_assignment(
        &self,
        experiment_id: &str,
        visitor_id: &str,
    ) -> Result<Option<VisitorAssignment>> {
        let conn = self.lock()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT arm, assigned_at FROM visitor_assignments \
                 WHERE experiment_id = ?1 AND visitor_id = ?2",
                params![experiment_id, visitor_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(arm, assigned_at)| {
            Ok(VisitorAssignment {
                experiment_id: experiment_id.to_string(),
                visitor_id: visitor_id.to_string(),
                arm: parse_arm(&arm)?,
                assigned_at: assigned_at as u64,
            })
        })
        .transpose()
    }

    fn record_result(&self, event: &ResultEvent) -> Result<RecordOutcome> {
        self.immediate(|conn| {
            if Self::status_of(conn, &event.experiment_id)?.is_none() {
                return Err(EngineError::not_found(&event.experiment_id));
            }

            conn.execute(
                "INSERT INTO result_events (experiment_id, visitor_id, session_id, arm, converted, \
                 conversion_value, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.experiment_id,
                    event.visitor_id,
                    event.session_id,
                    event.arm.as_str(),
                    event.converted as i32,
                    event.conversion_value,
                    event.recorded_at as i64,
                ],
            )?;

            let mut counted = false;
            if event.converted {
                let (visitors_col, conversions_col) = arm_columns(event.arm);
                let changed = conn.execute(
                    &format!(
                        "UPDATE experiments SET {conversions_col} = {conversions_col} + 1 \
                         WHERE id = ?1 AND {conversions_col} < {visitors_col} \
                           AND status NOT IN ('completed', 'cancelled')"
                    ),
                    [&event.experiment_id],
                )?;
                counted = changed == 1;
            }
            Ok(RecordOutcome { counted })
        })
    }

    fn results_for(&self, experiment_id: &str) -> Result<Vec<ResultEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT visitor_id, session_id, arm, converted, conversion_value, recorded_at \
             FROM result_events WHERE experiment_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map([experiment_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (visitor_id, session_id, arm, converted, conversion_value, recorded_at) = row?;
            out.push(ResultEvent {
                experiment_id: experiment_id.to_string(),
                visitor_id,
                session_id,
                arm: parse_arm(&arm)?,
                converted: converted != 0,
                conversion_value,
                recorded_at: recorded_at as u64,
            });
        }
        Ok(out)
    }
}
