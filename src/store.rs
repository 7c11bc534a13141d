//! SQLite persistence for workspaces, censuses and analysis runs.
//!
//! Only `Store` methods execute SQL; the engine, importer and API layers
//! never touch the database directly.

use std::path::Path;

use chrono::{NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, Row, ToSql, params};
use serde::Serialize;
use thiserror::Error;

use crate::core::{AcpMetrics, BindingRule, Census, Participant, ScenarioResult, TestStatus};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("stored result {run_id}/{seq} is corrupt: {message}")]
    CorruptRow {
        run_id: i64,
        seq: i64,
        message: String,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Scenario,
    Grid,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Scenario => "scenario",
            RunKind::Grid => "grid",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRow {
    pub workspace_id: i64,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CensusRow {
    pub census_id: i64,
    pub workspace_id: i64,
    pub name: String,
    pub plan_year: i32,
    pub participant_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRow {
    pub run_id: i64,
    pub census_id: i64,
    pub kind: RunKind,
    pub status: RunStatus,
    pub params_json: String,
    pub seed: u64,
    pub engine_version: String,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the workspace database at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        // WAL mode: better concurrent read performance.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> StoreResult<()> {
        self.conn
            .execute_batch(include_str!("../migrations/001_schema.sql"))?;
        Ok(())
    }

    // ── Workspaces ─────────────────────────────────────────────

    pub fn create_workspace(&self, name: &str) -> StoreResult<i64> {
        self.conn.execute(
            "INSERT INTO workspace (name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn workspace(&self, workspace_id: i64) -> StoreResult<WorkspaceRow> {
        self.conn
            .query_row(
                "SELECT workspace_id, name, created_at FROM workspace WHERE workspace_id = ?1",
                params![workspace_id],
                map_workspace_row,
            )
            .map_err(|e| not_found_or_sqlite(e, "workspace", workspace_id))
    }

    pub fn list_workspaces(&self) -> StoreResult<Vec<WorkspaceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT workspace_id, name, created_at FROM workspace ORDER BY workspace_id ASC",
        )?;
        let rows = stmt
            .query_map([], map_workspace_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Censuses ───────────────────────────────────────────────

    /// Insert a census and all of its participants in one transaction,
    /// preserving file order.
    pub fn create_census(
        &mut self,
        workspace_id: i64,
        name: &str,
        plan_year: i32,
        participants: &[Participant],
    ) -> StoreResult<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO census (workspace_id, name, plan_year, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![workspace_id, name, plan_year, Utc::now().to_rfc3339()],
        )?;
        let census_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO participant (census_id, external_ref, dob, hire_date,
                     termination_date, compensation_cents, pre_tax_rate, roth_rate,
                     after_tax_rate, match_rate, non_elective_rate, hce_flag)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for participant in participants {
                stmt.execute(params![
                    census_id,
                    participant.external_ref,
                    participant.dob.to_string(),
                    participant.hire_date.to_string(),
                    participant.termination_date.map(|d| d.to_string()),
                    participant.compensation_cents,
                    participant.pre_tax_rate,
                    participant.roth_rate,
                    participant.after_tax_rate,
                    participant.match_rate,
                    participant.non_elective_rate,
                    participant.hce_flag,
                ])?;
            }
        }
        tx.commit()?;
        Ok(census_id)
    }

    pub fn census(&self, census_id: i64) -> StoreResult<CensusRow> {
        self.conn
            .query_row(
                "SELECT c.census_id, c.workspace_id, c.name, c.plan_year, c.created_at,
                        (SELECT COUNT(*) FROM participant p WHERE p.census_id = c.census_id)
                 FROM census c WHERE c.census_id = ?1",
                params![census_id],
                map_census_row,
            )
            .map_err(|e| not_found_or_sqlite(e, "census", census_id))
    }

    pub fn censuses_for_workspace(&self, workspace_id: i64) -> StoreResult<Vec<CensusRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.census_id, c.workspace_id, c.name, c.plan_year, c.created_at,
                    (SELECT COUNT(*) FROM participant p WHERE p.census_id = c.census_id)
             FROM census c WHERE c.workspace_id = ?1
             ORDER BY c.census_id ASC",
        )?;
        let rows = stmt
            .query_map(params![workspace_id], map_census_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Load a census with its participants in insertion order, ready for the
    /// engine.
    pub fn load_census(&self, census_id: i64) -> StoreResult<Census> {
        let row = self.census(census_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT external_ref, dob, hire_date, termination_date, compensation_cents,
                    pre_tax_rate, roth_rate, after_tax_rate, match_rate,
                    non_elective_rate, hce_flag
             FROM participant WHERE census_id = ?1
             ORDER BY participant_id ASC",
        )?;
        let participants = stmt
            .query_map(params![census_id], |row| {
                Ok(Participant {
                    external_ref: row.get(0)?,
                    dob: parse_stored_date(1, row.get(1)?)?,
                    hire_date: parse_stored_date(2, row.get(2)?)?,
                    termination_date: match row.get::<_, Option<String>>(3)? {
                        Some(raw) => Some(parse_stored_date(3, raw)?),
                        None => None,
                    },
                    compensation_cents: row.get(4)?,
                    pre_tax_rate: row.get(5)?,
                    roth_rate: row.get(6)?,
                    after_tax_rate: row.get(7)?,
                    match_rate: row.get(8)?,
                    non_elective_rate: row.get(9)?,
                    hce_flag: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Census {
            plan_year: row.plan_year,
            participants,
        })
    }

    // ── Analysis runs ──────────────────────────────────────────

    pub fn create_run(
        &self,
        census_id: i64,
        kind: RunKind,
        params_json: &str,
        seed: u64,
        engine_version: &str,
    ) -> StoreResult<i64> {
        self.conn.execute(
            "INSERT INTO analysis_run (census_id, kind, status, params_json, seed,
                 engine_version, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                census_id,
                kind,
                RunStatus::Pending,
                params_json,
                seed as i64,
                engine_version,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn mark_run_running(&self, run_id: i64) -> StoreResult<()> {
        let updated = self.conn.execute(
            "UPDATE analysis_run SET status = ?1 WHERE run_id = ?2",
            params![RunStatus::Running, run_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "run",
                id: run_id,
            });
        }
        Ok(())
    }

    /// Persist every result cell and close the run in one transaction.
    pub fn complete_run(&mut self, run_id: i64, results: &[ScenarioResult]) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO scenario_result (run_id, seq, status, adoption_rate,
                     contribution_rate, seed, nhce_acp, hce_acp, limit_125,
                     limit_2pct_uncapped, cap_2x, limit_2pct_capped, effective_limit,
                     margin, binding_rule, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            )?;
            for (seq, result) in results.iter().enumerate() {
                let metrics = result.metrics.as_ref();
                stmt.execute(params![
                    run_id,
                    seq as i64,
                    result.status,
                    result.adoption_rate,
                    result.contribution_rate,
                    result.seed as i64,
                    metrics.map(|m| m.nhce_acp),
                    metrics.map(|m| m.hce_acp),
                    metrics.map(|m| m.limit_125),
                    metrics.map(|m| m.limit_2pct_uncapped),
                    metrics.map(|m| m.cap_2x),
                    metrics.map(|m| m.limit_2pct_capped),
                    metrics.map(|m| m.effective_limit),
                    metrics.map(|m| m.margin),
                    metrics.map(|m| m.binding_rule),
                    result.error,
                ])?;
            }
        }
        tx.execute(
            "UPDATE analysis_run SET status = ?1, finished_at = ?2 WHERE run_id = ?3",
            params![RunStatus::Completed, Utc::now().to_rfc3339(), run_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn fail_run(&self, run_id: i64, error: &str) -> StoreResult<()> {
        let updated = self.conn.execute(
            "UPDATE analysis_run SET status = ?1, error = ?2, finished_at = ?3
             WHERE run_id = ?4",
            params![RunStatus::Failed, error, Utc::now().to_rfc3339(), run_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "run",
                id: run_id,
            });
        }
        Ok(())
    }

    pub fn run(&self, run_id: i64) -> StoreResult<RunRow> {
        self.conn
            .query_row(
                "SELECT run_id, census_id, kind, status, params_json, seed,
                        engine_version, error, started_at, finished_at
                 FROM analysis_run WHERE run_id = ?1",
                params![run_id],
                map_run_row,
            )
            .map_err(|e| not_found_or_sqlite(e, "run", run_id))
    }

    pub fn runs_for_census(&self, census_id: i64) -> StoreResult<Vec<RunRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, census_id, kind, status, params_json, seed,
                    engine_version, error, started_at, finished_at
             FROM analysis_run WHERE census_id = ?1
             ORDER BY run_id ASC",
        )?;
        let rows = stmt
            .query_map(params![census_id], map_run_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Result cells in their original evaluation order.
    pub fn results_for_run(&self, run_id: i64) -> StoreResult<Vec<ScenarioResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, status, adoption_rate, contribution_rate, seed,
                    nhce_acp, hce_acp, limit_125, limit_2pct_uncapped, cap_2x,
                    limit_2pct_capped, effective_limit, margin, binding_rule, error
             FROM scenario_result WHERE run_id = ?1
             ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(StoredResultRow {
                    seq: row.get(0)?,
                    status: row.get(1)?,
                    adoption_rate: row.get(2)?,
                    contribution_rate: row.get(3)?,
                    seed: row.get::<_, i64>(4)? as u64,
                    nhce_acp: row.get(5)?,
                    hce_acp: row.get(6)?,
                    limit_125: row.get(7)?,
                    limit_2pct_uncapped: row.get(8)?,
                    cap_2x: row.get(9)?,
                    limit_2pct_capped: row.get(10)?,
                    effective_limit: row.get(11)?,
                    margin: row.get(12)?,
                    binding_rule: row.get(13)?,
                    error: row.get(14)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|raw| raw.into_result(run_id))
            .collect()
    }
}

struct StoredResultRow {
    seq: i64,
    status: TestStatus,
    adoption_rate: f64,
    contribution_rate: f64,
    seed: u64,
    nhce_acp: Option<f64>,
    hce_acp: Option<f64>,
    limit_125: Option<f64>,
    limit_2pct_uncapped: Option<f64>,
    cap_2x: Option<f64>,
    limit_2pct_capped: Option<f64>,
    effective_limit: Option<f64>,
    margin: Option<f64>,
    binding_rule: Option<BindingRule>,
    error: Option<String>,
}

impl StoredResultRow {
    fn into_result(self, run_id: i64) -> StoreResult<ScenarioResult> {
        let metrics = match (
            self.nhce_acp,
            self.hce_acp,
            self.limit_125,
            self.limit_2pct_uncapped,
            self.cap_2x,
            self.limit_2pct_capped,
            self.effective_limit,
            self.margin,
            self.binding_rule,
        ) {
            (
                Some(nhce_acp),
                Some(hce_acp),
                Some(limit_125),
                Some(limit_2pct_uncapped),
                Some(cap_2x),
                Some(limit_2pct_capped),
                Some(effective_limit),
                Some(margin),
                Some(binding_rule),
            ) => Some(AcpMetrics {
                nhce_acp,
                hce_acp,
                limit_125,
                limit_2pct_uncapped,
                cap_2x,
                limit_2pct_capped,
                effective_limit,
                max_allowed_acp: effective_limit,
                margin,
                binding_rule,
            }),
            (None, None, None, None, None, None, None, None, None) => None,
            _ => {
                return Err(StoreError::CorruptRow {
                    run_id,
                    seq: self.seq,
                    message: "partially populated metrics".to_string(),
                });
            }
        };

        Ok(ScenarioResult {
            status: self.status,
            adoption_rate: self.adoption_rate,
            contribution_rate: self.contribution_rate,
            seed: self.seed,
            metrics,
            error: self.error,
        })
    }
}

fn map_workspace_row(row: &Row<'_>) -> rusqlite::Result<WorkspaceRow> {
    Ok(WorkspaceRow {
        workspace_id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
    })
}

fn map_census_row(row: &Row<'_>) -> rusqlite::Result<CensusRow> {
    Ok(CensusRow {
        census_id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        plan_year: row.get(3)?,
        created_at: row.get(4)?,
        participant_count: row.get(5)?,
    })
}

fn map_run_row(row: &Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        run_id: row.get(0)?,
        census_id: row.get(1)?,
        kind: row.get(2)?,
        status: row.get(3)?,
        params_json: row.get(4)?,
        seed: row.get::<_, i64>(5)? as u64,
        engine_version: row.get(6)?,
        error: row.get(7)?,
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
    })
}

fn not_found_or_sqlite(error: rusqlite::Error, entity: &'static str, id: i64) -> StoreError {
    match error {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound { entity, id },
        other => StoreError::Sqlite(other),
    }
}

fn parse_stored_date(index: usize, raw: String) -> rusqlite::Result<NaiveDate> {
    raw.parse().map_err(|e: chrono::ParseError| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl ToSql for TestStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for TestStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "PASS" => Ok(TestStatus::Pass),
            "RISK" => Ok(TestStatus::Risk),
            "FAIL" => Ok(TestStatus::Fail),
            "ERROR" => Ok(TestStatus::Error),
            other => Err(FromSqlError::Other(
                format!("unknown test status: {other}").into(),
            )),
        }
    }
}

impl ToSql for BindingRule {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for BindingRule {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "1.25x" => Ok(BindingRule::Multiple125),
            "+2.0" => Ok(BindingRule::PlusTwo),
            other => Err(FromSqlError::Other(
                format!("unknown binding rule: {other}").into(),
            )),
        }
    }
}

impl ToSql for RunKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for RunKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "scenario" => Ok(RunKind::Scenario),
            "grid" => Ok(RunKind::Grid),
            other => Err(FromSqlError::Other(
                format!("unknown run kind: {other}").into(),
            )),
        }
    }
}

impl ToSql for RunStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "PENDING" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(FromSqlError::Other(
                format!("unknown run status: {other}").into(),
            )),
        }
    }
}
