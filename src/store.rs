//! Durable test state: SQLite-backed record of every test started,
//! running, and completed, with the recovery queries the orchestrator
//! needs after a service restart.
//!
//! A single connection with serialised write transactions is sufficient
//! for this workload. Every public operation takes the store lock and
//! commits or rolls back before returning; callers always get copied
//! values, never row handles.

use crate::error::StoreError;
use crate::models::{Grading, ProfileId, Summary, TestId, TestRecord, TestState};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Disposition the recovery scan assigned to a previously-running record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDisposition {
    /// Process still alive: record parked as `disconnected`.
    StillAlive,
    /// Process gone: record failed as orphaned.
    Orphaned,
    /// No pid was ever recorded: nothing can be decided.
    Undecidable,
}

/// Stored result payload: the parsed summary plus its grading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultBlob {
    pub summary: Summary,
    pub grading: Option<Grading>,
}

/// Per-state counts and size of the backing database.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreStats {
    pub test_counts: HashMap<String, i64>,
    pub total_tests: i64,
    pub db_size_bytes: u64,
}

/// SQLite-backed state store.
pub struct StateStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl StateStore {
    /// Open (and if necessary create) the store at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = StateStore {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        log::info!("state database initialized: {}", db_path.display());
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS test_runs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                test_type TEXT NOT NULL,
                requested_type TEXT NOT NULL,
                disk_path TEXT NOT NULL,
                size_gb REAL NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT NULL,
                pid INTEGER NULL,
                pgid INTEGER NULL,
                result_json TEXT NULL,
                error_message TEXT NULL,
                estimated_duration INTEGER NOT NULL DEFAULT 0,
                output_file TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS test_metrics (
                test_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                metric_value REAL NOT NULL,
                metric_unit TEXT NULL,
                FOREIGN KEY (test_id) REFERENCES test_runs(id)
            );
            CREATE TABLE IF NOT EXISTS process_tracking (
                test_id TEXT NOT NULL,
                pid INTEGER NOT NULL,
                pgid INTEGER NULL,
                command TEXT NULL,
                started_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                PRIMARY KEY (test_id, pid),
                FOREIGN KEY (test_id) REFERENCES test_runs(id)
            );
            CREATE INDEX IF NOT EXISTS idx_test_runs_status ON test_runs(status);
            CREATE INDEX IF NOT EXISTS idx_test_runs_started ON test_runs(started_at);
            CREATE INDEX IF NOT EXISTS idx_test_metrics_test_id ON test_metrics(test_id);
            CREATE INDEX IF NOT EXISTS idx_process_tracking_status ON process_tracking(status);",
        )?;
        Ok(())
    }

    /// Insert the initial row for an admitted test.
    pub fn save_start(&self, record: &TestRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO test_runs
             (id, status, test_type, requested_type, disk_path, size_gb, started_at,
              pid, pgid, estimated_duration, output_file)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.id.as_str(),
                record.state.as_str(),
                record.profile.as_str(),
                record.requested_profile,
                record.target_path.to_string_lossy().to_string(),
                record.size_gb,
                record.started_at.to_rfc3339(),
                record.pid,
                record.pgid,
                record.estimated_duration_secs as i64,
                record.output_path.to_string_lossy().to_string(),
            ],
        )?;
        log::info!("test start saved: {}", record.id);
        Ok(())
    }

    /// Record the spawned worker and move the row to `running`.
    pub fn mark_running(
        &self,
        id: &TestId,
        pid: i32,
        pgid: i32,
        command: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE test_runs SET status = 'running', pid = ?2, pgid = ?3
             WHERE id = ?1 AND status = 'starting'",
            params![id.as_str(), pid, pgid],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO process_tracking
             (test_id, pid, pgid, command, started_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'running')",
            params![id.as_str(), pid, pgid, command, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Transition a test's state, attaching a result blob and/or error.
    ///
    /// Terminal rows are immutable: the update applies only while the row
    /// is in a non-terminal state, so the first terminal transition wins.
    /// Returns whether the transition was applied.
    pub fn update_state(
        &self,
        id: &TestId,
        new_state: TestState,
        result: Option<&ResultBlob>,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result_json = result.map(serde_json::to_string).transpose()?;
        let completed_at = new_state.is_terminal().then(|| Utc::now().to_rfc3339());

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE test_runs
             SET status = ?2,
                 completed_at = COALESCE(?3, completed_at),
                 result_json = COALESCE(?4, result_json),
                 error_message = COALESCE(?5, error_message)
             WHERE id = ?1
               AND status NOT IN ('completed', 'failed', 'stopped', 'timeout', 'unknown')",
            params![id.as_str(), new_state.as_str(), completed_at, result_json, error],
        )?;
        if changed > 0 {
            tx.execute(
                "UPDATE process_tracking SET status = ?2 WHERE test_id = ?1",
                params![id.as_str(), new_state.as_str()],
            )?;
        }
        tx.commit()?;

        if changed > 0 {
            log::info!("test status updated: {id} -> {new_state}");
        } else {
            log::debug!("ignored state update for terminal test {id} -> {new_state}");
        }
        Ok(changed > 0)
    }

    /// Fetch one record by id.
    pub fn get(&self, id: &TestId) -> Result<Option<TestRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT * FROM test_runs WHERE id = ?1",
                params![id.as_str()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// All rows in a non-terminal state, newest first.
    pub fn list_running(&self) -> Result<Vec<TestRecord>, StoreError> {
        self.query_records(
            "SELECT * FROM test_runs
             WHERE status IN ('starting', 'running', 'disconnected')
             ORDER BY started_at DESC",
        )
    }

    /// Rows parked in background states after a restart.
    pub fn list_background(&self) -> Result<Vec<TestRecord>, StoreError> {
        self.query_records(
            "SELECT * FROM test_runs
             WHERE status IN ('disconnected', 'unknown')
             ORDER BY started_at DESC",
        )
    }

    /// Most recent terminal rows, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<TestRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM test_runs
             WHERE status IN ('completed', 'failed', 'stopped', 'timeout', 'unknown')
             ORDER BY completed_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn query_records(&self, sql: &str) -> Result<Vec<TestRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Reconcile non-terminal rows left behind by a previous service
    /// instance, using the caller-supplied liveness probe.
    ///
    /// Rows older than `min_age_secs` whose process is alive become
    /// `disconnected`; dead processes become `failed` (orphaned); rows
    /// without a pid become `unknown`. Returns each reconciled record with
    /// its disposition.
    pub fn recover_orphans<F>(
        &self,
        min_age_secs: i64,
        liveness: F,
    ) -> Result<Vec<(TestRecord, RecoveryDisposition)>, StoreError>
    where
        F: Fn(i32) -> bool,
    {
        let candidates = self.list_running()?;
        let now = Utc::now();
        let mut reconciled = Vec::new();

        for record in candidates {
            let age_secs = (now - record.started_at).num_seconds();
            if age_secs < min_age_secs {
                continue;
            }

            let disposition = match record.pid {
                Some(pid) if liveness(pid) => {
                    self.update_state(&record.id, TestState::Disconnected, None, None)?;
                    RecoveryDisposition::StillAlive
                }
                Some(_) => {
                    self.update_state(
                        &record.id,
                        TestState::Failed,
                        None,
                        Some("worker process orphaned during service restart"),
                    )?;
                    RecoveryDisposition::Orphaned
                }
                None => {
                    self.update_state(
                        &record.id,
                        TestState::Unknown,
                        None,
                        Some("test status unknown after service restart"),
                    )?;
                    RecoveryDisposition::Undecidable
                }
            };

            let updated = self
                .get(&record.id)?
                .ok_or_else(|| StoreError::NotFound(record.id.to_string()))?;
            reconciled.push((updated, disposition));
        }

        if !reconciled.is_empty() {
            log::warn!("reconciled {} orphaned tests", reconciled.len());
        }
        Ok(reconciled)
    }

    /// Append one live metric sample for a test.
    pub fn record_metric(
        &self,
        id: &TestId,
        name: &str,
        value: f64,
        unit: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO test_metrics (test_id, ts, metric_name, metric_value, metric_unit)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.as_str(), Utc::now().to_rfc3339(), name, value, unit],
        )?;
        Ok(())
    }

    /// Delete one record outright, cascading to processes and metrics.
    ///
    /// Used by background-test cleanup; refuses nothing, so callers gate on
    /// state themselves.
    pub fn delete(&self, id: &TestId) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM test_metrics WHERE test_id = ?1",
            params![id.as_str()],
        )?;
        tx.execute(
            "DELETE FROM process_tracking WHERE test_id = ?1",
            params![id.as_str()],
        )?;
        let deleted = tx.execute("DELETE FROM test_runs WHERE id = ?1", params![id.as_str()])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// Delete terminal rows older than the retention window.
    pub fn prune(&self, older_than_days: i64) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - chrono::Duration::days(older_than_days)).to_rfc3339();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM test_metrics WHERE test_id IN (
                SELECT id FROM test_runs
                WHERE status IN ('completed', 'failed', 'stopped', 'timeout', 'unknown')
                  AND completed_at < ?1)",
            params![cutoff],
        )?;
        tx.execute(
            "DELETE FROM process_tracking WHERE test_id IN (
                SELECT id FROM test_runs
                WHERE status IN ('completed', 'failed', 'stopped', 'timeout', 'unknown')
                  AND completed_at < ?1)",
            params![cutoff],
        )?;
        let pruned = tx.execute(
            "DELETE FROM test_runs
             WHERE status IN ('completed', 'failed', 'stopped', 'timeout', 'unknown')
               AND completed_at < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        if pruned > 0 {
            log::info!("pruned {pruned} old tests");
        }
        Ok(pruned)
    }

    /// Per-state counts and database file size.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stats = StoreStats::default();

        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM test_runs GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            stats.test_counts.insert(status, count);
        }

        stats.total_tests = conn.query_row("SELECT COUNT(*) FROM test_runs", [], |row| {
            row.get::<_, i64>(0)
        })?;
        stats.db_size_bytes = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(stats)
    }
}

/// Decode one `test_runs` row into a record.
fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TestRecord> {
    let state_text: String = row.get("status")?;
    let profile_text: String = row.get("test_type")?;
    let started_at_text: String = row.get("started_at")?;
    let completed_at_text: Option<String> = row.get("completed_at")?;
    let result_json: Option<String> = row.get("result_json")?;
    let target: String = row.get("disk_path")?;
    let output: String = row.get("output_file")?;
    let estimated: i64 = row.get("estimated_duration")?;

    let blob: Option<ResultBlob> =
        result_json.and_then(|text| serde_json::from_str(&text).ok());

    let mut record = TestRecord {
        id: TestId(row.get("id")?),
        state: TestState::parse(&state_text).unwrap_or(TestState::Unknown),
        profile: ProfileId::parse(&profile_text).unwrap_or(ProfileId::QuickMaxMix),
        requested_profile: row.get("requested_type")?,
        target_path: PathBuf::from(target),
        size_gb: row.get("size_gb")?,
        started_at: parse_timestamp(&started_at_text),
        completed_at: completed_at_text.as_deref().map(parse_timestamp),
        pid: row.get("pid")?,
        pgid: row.get("pgid")?,
        estimated_duration_secs: estimated.max(0) as u64,
        output_path: PathBuf::from(output),
        summary: blob.as_ref().map(|b| b.summary.clone()),
        grading: blob.and_then(|b| b.grading),
        error: row.get("error_message")?,
        progress: 0.0,
    };
    record.refresh_progress();
    Ok(record)
}

fn parse_timestamp(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
