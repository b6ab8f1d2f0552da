//! SQLite run ledger.
//!
//! The claim relies on a partial unique index over `fetch_runs(source_id)`
//! restricted to active statuses: creating a second Queued run for a source
//! fails the INSERT itself, so two connections racing to claim the same source
//! cannot both succeed.

use super::{check_transition, not_running, RunLedger};
use crate::error::{HarvestError, Result};
use crate::models::{
    ClaimOutcome, FetchRun, RecordOutcome, RunCounts, RunFailure, RunStatus, Source,
};
use crate::store::{format_timestamp, lock_conn, open_database, parse_timestamp};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const RUN_COLUMNS: &str = "r.id, r.source_id, s.name, r.status, r.started_at, r.completed_at,
     r.fetched, r.created, r.updated, r.no_op, r.error, r.cursor,
     r.error_message, r.error_detail, r.parameters";

/// Raw column values; converted outside the rusqlite row closure.
struct RunRow {
    id: String,
    source_id: String,
    source_name: String,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    counts: [i64; 5],
    cursor: Option<String>,
    error_message: Option<String>,
    error_detail: Option<String>,
    parameters: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_id: row.get(1)?,
            source_name: row.get(2)?,
            status: row.get(3)?,
            started_at: row.get(4)?,
            completed_at: row.get(5)?,
            counts: [row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?, row.get(10)?],
            cursor: row.get(11)?,
            error_message: row.get(12)?,
            error_detail: row.get(13)?,
            parameters: row.get(14)?,
        })
    }

    fn into_run(self) -> Result<FetchRun> {
        let status = RunStatus::parse(&self.status).ok_or_else(|| HarvestError::Database {
            message: format!("Unknown run status '{}' for {}", self.status, self.id),
            source: None,
        })?;
        let [fetched, created, updated, no_op, error] = self.counts.map(|c| c.max(0) as u64);
        Ok(FetchRun {
            status,
            started_at: parse_timestamp(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            counts: RunCounts {
                fetched,
                created,
                updated,
                no_op,
                error,
            },
            parameters: self
                .parameters
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()?,
            id: self.id,
            source_id: self.source_id,
            source_name: self.source_name,
            cursor: self.cursor,
            error_message: self.error_message,
            error_detail: self.error_detail,
        })
    }
}

/// Persistent [`RunLedger`] over SQLite.
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Open (or create) the ledger tables in the database at `db_path`.
    ///
    /// Each call opens its own connection; several ledgers may share one file.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_database(db_path.as_ref())?;
        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = lock_conn(&self.conn)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fetch_runs (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL REFERENCES sources(id),
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                fetched INTEGER NOT NULL DEFAULT 0,
                created INTEGER NOT NULL DEFAULT 0,
                updated INTEGER NOT NULL DEFAULT 0,
                no_op INTEGER NOT NULL DEFAULT 0,
                error INTEGER NOT NULL DEFAULT 0,
                cursor TEXT,
                error_message TEXT,
                error_detail TEXT,
                parameters TEXT
            );

            -- At most one active run per source
            CREATE UNIQUE INDEX IF NOT EXISTS idx_fetch_runs_one_active
                ON fetch_runs(source_id) WHERE status IN ('queued', 'running');

            CREATE INDEX IF NOT EXISTS idx_fetch_runs_source_started
                ON fetch_runs(source_id, started_at);
            "#,
        )
        .map_err(|e| HarvestError::Database {
            message: format!("Failed to initialize ledger schema: {}", e),
            source: Some(e),
        })
    }

    fn query_run(conn: &Connection, run_id: &str) -> Result<Option<FetchRun>> {
        let sql = format!(
            "SELECT {} FROM fetch_runs r JOIN sources s ON s.id = r.source_id WHERE r.id = ?1",
            RUN_COLUMNS
        );
        conn.query_row(&sql, params![run_id], RunRow::from_row)
            .optional()?
            .map(RunRow::into_run)
            .transpose()
    }

    fn require_run(conn: &Connection, run_id: &str) -> Result<FetchRun> {
        Self::query_run(conn, run_id)?.ok_or_else(|| HarvestError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    fn active_run_id(conn: &Connection, source_id: &str) -> Result<Option<String>> {
        Ok(conn
            .query_row(
                "SELECT id FROM fetch_runs
                 WHERE source_id = ?1 AND status IN ('queued', 'running')",
                params![source_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn transition(
        &self,
        run_id: &str,
        to: RunStatus,
        failure: Option<&RunFailure>,
    ) -> Result<FetchRun> {
        let mut conn = lock_conn(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = Self::require_run(&tx, run_id)?;
        check_transition(run_id, current.status, to)?;

        let completed_at = to.is_terminal().then(|| format_timestamp(Utc::now()));
        tx.execute(
            "UPDATE fetch_runs
             SET status = ?2, completed_at = ?3, error_message = ?4, error_detail = ?5
             WHERE id = ?1",
            params![
                run_id,
                to.as_str(),
                completed_at,
                failure.map(|f| f.message.as_str()),
                failure.and_then(|f| f.detail.as_deref())
            ],
        )?;
        let updated = Self::require_run(&tx, run_id)?;
        tx.commit()?;
        Ok(updated)
    }

    fn source_runs(&self, source_name: &str, limit: Option<usize>) -> Result<Vec<FetchRun>> {
        let conn = lock_conn(&self.conn)?;
        let sql = format!(
            "SELECT {} FROM fetch_runs r JOIN sources s ON s.id = r.source_id
             WHERE s.name = ?1 ORDER BY r.started_at DESC, r.rowid DESC LIMIT ?2",
            RUN_COLUMNS
        );
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![source_name, limit], RunRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(RunRow::into_run).collect()
    }
}

impl RunLedger for SqliteLedger {
    fn ensure_source(&self, name: &str) -> Result<Source> {
        let conn = lock_conn(&self.conn)?;
        conn.execute(
            "INSERT OR IGNORE INTO sources (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![
                uuid::Uuid::new_v4().to_string(),
                name,
                format_timestamp(Utc::now())
            ],
        )?;
        let (id, created_at): (String, String) = conn.query_row(
            "SELECT id, created_at FROM sources WHERE name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(Source {
            id,
            name: name.to_string(),
            created_at: parse_timestamp(&created_at)?,
        })
    }

    fn claim(
        &self,
        source: &Source,
        parameters: Option<Value>,
        cursor: Option<String>,
    ) -> Result<ClaimOutcome> {
        let conn = lock_conn(&self.conn)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let parameters = parameters.as_ref().map(serde_json::to_string).transpose()?;

        let inserted = conn.execute(
            "INSERT INTO fetch_runs (id, source_id, status, started_at, cursor, parameters)
             VALUES (?1, ?2, 'queued', ?3, ?4, ?5)",
            params![
                run_id,
                source.id,
                format_timestamp(Utc::now()),
                cursor,
                parameters
            ],
        );

        match inserted.map_err(HarvestError::from) {
            Ok(_) => {
                debug!("Claimed {} with run {}", source.name, run_id);
                Ok(ClaimOutcome::Claimed(Self::require_run(&conn, &run_id)?))
            }
            Err(e) if e.is_constraint_violation() => {
                let active_run_id = Self::active_run_id(&conn, &source.id)?;
                debug!(
                    "Claim for {} skipped, active run {:?}",
                    source.name, active_run_id
                );
                Ok(ClaimOutcome::Skipped { active_run_id })
            }
            Err(e) => Err(e),
        }
    }

    fn mark_running(&self, run_id: &str) -> Result<FetchRun> {
        self.transition(run_id, RunStatus::Running, None)
    }

    fn record_outcome(&self, run_id: &str, outcome: RecordOutcome) -> Result<()> {
        let column = match outcome {
            RecordOutcome::Created => "created",
            RecordOutcome::Updated => "updated",
            RecordOutcome::NoOp => "no_op",
            RecordOutcome::Error => "error",
        };
        let conn = lock_conn(&self.conn)?;
        let changed = conn.execute(
            &format!(
                "UPDATE fetch_runs SET fetched = fetched + 1, {col} = {col} + 1
                 WHERE id = ?1 AND status = 'running'",
                col = column
            ),
            params![run_id],
        )?;
        if changed == 0 {
            let run = Self::require_run(&conn, run_id)?;
            return Err(not_running(run_id, run.status));
        }
        Ok(())
    }

    fn record_cursor(&self, run_id: &str, cursor: &str) -> Result<()> {
        let conn = lock_conn(&self.conn)?;
        let changed = conn.execute(
            "UPDATE fetch_runs SET cursor = ?2 WHERE id = ?1 AND status = 'running'",
            params![run_id, cursor],
        )?;
        if changed == 0 {
            let run = Self::require_run(&conn, run_id)?;
            return Err(not_running(run_id, run.status));
        }
        Ok(())
    }

    fn finalize(
        &self,
        run_id: &str,
        status: RunStatus,
        failure: Option<&RunFailure>,
    ) -> Result<FetchRun> {
        if !status.is_terminal() {
            let current = self.get(run_id)?.ok_or_else(|| HarvestError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
            return Err(HarvestError::InvalidTransition {
                run_id: run_id.to_string(),
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }
        let run = self.transition(run_id, status, failure)?;
        info!(
            "Fetch run {} for {} finalized as {} ({} fetched)",
            run.id, run.source_name, run.status, run.counts.fetched
        );
        Ok(run)
    }

    fn get(&self, run_id: &str) -> Result<Option<FetchRun>> {
        let conn = lock_conn(&self.conn)?;
        Self::query_run(&conn, run_id)
    }

    fn latest_run(&self, source_name: &str) -> Result<Option<FetchRun>> {
        Ok(self.source_runs(source_name, Some(1))?.into_iter().next())
    }

    fn has_running(&self, source_name: &str) -> Result<bool> {
        let conn = lock_conn(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM fetch_runs r JOIN sources s ON s.id = r.source_id
             WHERE s.name = ?1 AND r.status IN ('queued', 'running')",
            params![source_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn list_runs(&self, source_name: &str, limit: usize) -> Result<Vec<FetchRun>> {
        self.source_runs(source_name, Some(limit))
    }

    fn fail_orphaned_runs(&self, message: &str) -> Result<Vec<FetchRun>> {
        let orphan_ids: Vec<String> = {
            let conn = lock_conn(&self.conn)?;
            let mut stmt =
                conn.prepare("SELECT id FROM fetch_runs WHERE status IN ('queued', 'running')")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };

        let failure = RunFailure::new(message);
        let mut failed = Vec::with_capacity(orphan_ids.len());
        for run_id in orphan_ids {
            match self.transition(&run_id, RunStatus::Failed, Some(&failure)) {
                Ok(run) => {
                    warn!("Failed orphaned run {} for {}", run.id, run.source_name);
                    failed.push(run);
                }
                // Finished concurrently by its owner.
                Err(HarvestError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(failed)
    }
}
