//! SQL schema plus row encoding/decoding for every table.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::Query;
use super::models::*;
use crate::errors::StoreError;

pub(crate) fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS phases (
            idx INTEGER PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'pending',
            skip_result INTEGER
        );

        CREATE TABLE IF NOT EXISTS steps (
            phase_index INTEGER NOT NULL,
            idx INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            PRIMARY KEY (phase_index, idx)
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            step_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
        );

        CREATE TABLE IF NOT EXISTS operations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT 'null',
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error TEXT
        );

        CREATE TABLE IF NOT EXISTS singleton_lock (
            resource_id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'idle',
            holder_id TEXT,
            claimed_at TEXT,
            last_heartbeat TEXT
        );

        CREATE TABLE IF NOT EXISTS workflow (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            status TEXT NOT NULL DEFAULT 'running'
        );

        CREATE TABLE IF NOT EXISTS changes (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            row_key TEXT NOT NULL,
            old_partition TEXT,
            new_partition TEXT,
            old_value TEXT,
            new_value TEXT,
            changed_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_steps_phase ON steps(phase_index);
        CREATE INDEX IF NOT EXISTS idx_tasks_step ON tasks(step_id);
        CREATE INDEX IF NOT EXISTS idx_operations_kind ON operations(kind, status, id);
        ",
    )?;
    Ok(())
}

pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(table: Table, key: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| corrupt(table, key, format!("bad timestamp '{}': {}", s, e)))
    })
    .transpose()
}

fn corrupt(table: Table, key: &str, message: impl Into<String>) -> StoreError {
    StoreError::CorruptRow {
        table: table.as_str().to_string(),
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_status<T: std::str::FromStr<Err = String>>(
    table: Table,
    key: &str,
    raw: &str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|e: String| corrupt(table, key, e))
}

// ── Raw rows ──────────────────────────────────────────────────────────
//
// Column values are pulled out inside the rusqlite row closure and decoded
// into typed records afterwards, so decoding errors surface as
// `StoreError::CorruptRow` instead of rusqlite conversion errors.

struct RawPhase(u32, String, Option<bool>);
struct RawStep(u32, u32, String);
struct RawTask(String, Option<String>, String);
struct RawOperation {
    id: i64,
    kind: String,
    payload: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
}
struct RawLock(String, String, Option<String>, Option<String>, Option<String>);

const PHASE_COLUMNS: &str = "SELECT idx, status, skip_result FROM phases";
const STEP_COLUMNS: &str = "SELECT phase_index, idx, status FROM steps";
const TASK_COLUMNS: &str = "SELECT id, step_id, status FROM tasks";
const OPERATION_COLUMNS: &str = "SELECT id, kind, payload, status, created_at, started_at, completed_at, error FROM operations";
const LOCK_COLUMNS: &str =
    "SELECT resource_id, status, holder_id, claimed_at, last_heartbeat FROM singleton_lock";

fn raw_phase(row: &Row<'_>) -> rusqlite::Result<RawPhase> {
    Ok(RawPhase(row.get(0)?, row.get(1)?, row.get(2)?))
}

fn raw_step(row: &Row<'_>) -> rusqlite::Result<RawStep> {
    Ok(RawStep(row.get(0)?, row.get(1)?, row.get(2)?))
}

fn raw_task(row: &Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask(row.get(0)?, row.get(1)?, row.get(2)?))
}

fn raw_operation(row: &Row<'_>) -> rusqlite::Result<RawOperation> {
    Ok(RawOperation {
        id: row.get(0)?,
        kind: row.get(1)?,
        payload: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        error: row.get(7)?,
    })
}

fn raw_lock(row: &Row<'_>) -> rusqlite::Result<RawLock> {
    Ok(RawLock(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

impl RawPhase {
    fn decode(self) -> Result<Record, StoreError> {
        let key = self.0.to_string();
        Ok(Record::Phase(PhaseRow {
            index: self.0,
            status: parse_status(Table::Phases, &key, &self.1)?,
            skip_result: self.2,
        }))
    }
}

impl RawStep {
    fn decode(self) -> Result<Record, StoreError> {
        let key = step_id(self.0, self.1);
        Ok(Record::Step(StepRow {
            phase_index: self.0,
            index: self.1,
            status: parse_status(Table::Steps, &key, &self.2)?,
        }))
    }
}

impl RawTask {
    fn decode(self) -> Result<Record, StoreError> {
        let status = parse_status(Table::Tasks, &self.0, &self.2)?;
        Ok(Record::Task(TaskRow {
            id: self.0,
            step_id: self.1,
            status,
        }))
    }
}

impl RawOperation {
    fn decode(self) -> Result<Record, StoreError> {
        let key = self.id.to_string();
        let t = Table::Operations;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| corrupt(t, &key, format!("bad payload: {}", e)))?;
        let created_at = parse_ts(t, &key, Some(self.created_at))?
            .ok_or_else(|| corrupt(t, &key, "missing created_at"))?;
        Ok(Record::Operation(OperationRow {
            id: self.id,
            kind: self.kind,
            payload,
            status: parse_status(t, &key, &self.status)?,
            created_at,
            started_at: parse_ts(t, &key, self.started_at)?,
            completed_at: parse_ts(t, &key, self.completed_at)?,
            error: self.error,
        }))
    }
}

impl RawLock {
    fn decode(self) -> Result<Record, StoreError> {
        let t = Table::SingletonLock;
        let key = self.0.clone();
        Ok(Record::Lock(LockRow {
            resource_id: self.0,
            status: parse_status(t, &key, &self.1)?,
            holder_id: self.2,
            claimed_at: parse_ts(t, &key, self.3)?,
            last_heartbeat: parse_ts(t, &key, self.4)?,
        }))
    }
}

fn collect<R, F, D>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: F,
    decode: D,
) -> Result<Vec<Record>, StoreError>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<R>,
    D: Fn(R) -> Result<Record, StoreError>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(decode(row?)?);
    }
    Ok(out)
}

fn bad_key(key: &RowKey) -> StoreError {
    corrupt(key.table, &key.key, "malformed row key")
}

/// Load a single row by identity.
pub(crate) fn load(conn: &Connection, key: &RowKey) -> Result<Option<Record>, StoreError> {
    let mut rows = select(conn, &Query::Row(key.clone()))?;
    Ok(rows.pop())
}

/// Evaluate a query against the current database state.
pub(crate) fn select(conn: &Connection, query: &Query) -> Result<Vec<Record>, StoreError> {
    match query {
        Query::Table(table) => select_table(conn, *table),
        Query::Partition { table, partition } => match table {
            Table::Steps => {
                let phase: u32 = partition
                    .parse()
                    .map_err(|_| corrupt(*table, partition, "malformed partition"))?;
                collect(
                    conn,
                    &format!("{} WHERE phase_index = ?1 ORDER BY idx", STEP_COLUMNS),
                    params![phase],
                    raw_step,
                    RawStep::decode,
                )
            }
            Table::Tasks => collect(
                conn,
                &format!("{} WHERE step_id = ?1 ORDER BY id", TASK_COLUMNS),
                params![partition],
                raw_task,
                RawTask::decode,
            ),
            Table::Operations => collect(
                conn,
                &format!("{} WHERE kind = ?1 ORDER BY id", OPERATION_COLUMNS),
                params![partition],
                raw_operation,
                RawOperation::decode,
            ),
            // Tables without a partition column have a single implicit partition.
            _ => select_table(conn, *table),
        },
        Query::Row(key) => match key.table {
            Table::Phases => {
                let idx: u32 = key.key.parse().map_err(|_| bad_key(key))?;
                collect(
                    conn,
                    &format!("{} WHERE idx = ?1", PHASE_COLUMNS),
                    params![idx],
                    raw_phase,
                    RawPhase::decode,
                )
            }
            Table::Steps => {
                let (phase, step) = parse_step_id(&key.key).ok_or_else(|| bad_key(key))?;
                collect(
                    conn,
                    &format!("{} WHERE phase_index = ?1 AND idx = ?2", STEP_COLUMNS),
                    params![phase, step],
                    raw_step,
                    RawStep::decode,
                )
            }
            Table::Tasks => collect(
                conn,
                &format!("{} WHERE id = ?1", TASK_COLUMNS),
                params![key.key],
                raw_task,
                RawTask::decode,
            ),
            Table::Operations => {
                let id: i64 = key.key.parse().map_err(|_| bad_key(key))?;
                collect(
                    conn,
                    &format!("{} WHERE id = ?1", OPERATION_COLUMNS),
                    params![id],
                    raw_operation,
                    RawOperation::decode,
                )
            }
            Table::SingletonLock => collect(
                conn,
                &format!("{} WHERE resource_id = ?1", LOCK_COLUMNS),
                params![key.key],
                raw_lock,
                RawLock::decode,
            ),
            Table::Workflow => load_workflow(conn),
        },
    }
}

fn select_table(conn: &Connection, table: Table) -> Result<Vec<Record>, StoreError> {
    match table {
        Table::Phases => collect(
            conn,
            &format!("{} ORDER BY idx", PHASE_COLUMNS),
            [],
            raw_phase,
            RawPhase::decode,
        ),
        Table::Steps => collect(
            conn,
            &format!("{} ORDER BY phase_index, idx", STEP_COLUMNS),
            [],
            raw_step,
            RawStep::decode,
        ),
        Table::Tasks => collect(
            conn,
            &format!("{} ORDER BY id", TASK_COLUMNS),
            [],
            raw_task,
            RawTask::decode,
        ),
        Table::Operations => collect(
            conn,
            &format!("{} ORDER BY id", OPERATION_COLUMNS),
            [],
            raw_operation,
            RawOperation::decode,
        ),
        Table::SingletonLock => collect(
            conn,
            &format!("{} ORDER BY resource_id", LOCK_COLUMNS),
            [],
            raw_lock,
            RawLock::decode,
        ),
        Table::Workflow => load_workflow(conn),
    }
}

fn load_workflow(conn: &Connection) -> Result<Vec<Record>, StoreError> {
    let status: Option<String> = conn
        .query_row("SELECT status FROM workflow WHERE id = 0", [], |row| {
            row.get(0)
        })
        .optional()?;
    match status {
        Some(raw) => Ok(vec![Record::Workflow(WorkflowRow {
            status: parse_status(Table::Workflow, WORKFLOW_KEY, &raw)?,
        })]),
        None => Ok(Vec::new()),
    }
}

/// Upsert a record by identity.
pub(crate) fn save(conn: &Connection, record: &Record) -> Result<(), StoreError> {
    match record {
        Record::Phase(p) => {
            conn.execute(
                "INSERT INTO phases (idx, status, skip_result) VALUES (?1, ?2, ?3)
                 ON CONFLICT(idx) DO UPDATE SET status = excluded.status, skip_result = excluded.skip_result",
                params![p.index, p.status.as_str(), p.skip_result],
            )?;
        }
        Record::Step(s) => {
            conn.execute(
                "INSERT INTO steps (phase_index, idx, status) VALUES (?1, ?2, ?3)
                 ON CONFLICT(phase_index, idx) DO UPDATE SET status = excluded.status",
                params![s.phase_index, s.index, s.status.as_str()],
            )?;
        }
        Record::Task(t) => {
            conn.execute(
                "INSERT INTO tasks (id, step_id, status) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET step_id = excluded.step_id, status = excluded.status",
                params![t.id, t.step_id, t.status.as_str()],
            )?;
        }
        Record::Operation(o) => {
            conn.execute(
                "INSERT INTO operations (id, kind, payload, status, created_at, started_at, completed_at, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    payload = excluded.payload,
                    status = excluded.status,
                    created_at = excluded.created_at,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    error = excluded.error",
                params![
                    o.id,
                    o.kind,
                    serde_json::to_string(&o.payload)?,
                    o.status.as_str(),
                    fmt_ts(&o.created_at),
                    o.started_at.as_ref().map(fmt_ts),
                    o.completed_at.as_ref().map(fmt_ts),
                    o.error,
                ],
            )?;
        }
        Record::Lock(l) => {
            conn.execute(
                "INSERT INTO singleton_lock (resource_id, status, holder_id, claimed_at, last_heartbeat)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(resource_id) DO UPDATE SET
                    status = excluded.status,
                    holder_id = excluded.holder_id,
                    claimed_at = excluded.claimed_at,
                    last_heartbeat = excluded.last_heartbeat",
                params![
                    l.resource_id,
                    l.status.as_str(),
                    l.holder_id,
                    l.claimed_at.as_ref().map(fmt_ts),
                    l.last_heartbeat.as_ref().map(fmt_ts),
                ],
            )?;
        }
        Record::Workflow(w) => {
            conn.execute(
                "INSERT INTO workflow (id, status) VALUES (0, ?1)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status",
                params![w.status.as_str()],
            )?;
        }
    }
    Ok(())
}

/// Insert a new operation row, letting SQLite allocate the id.
pub(crate) fn insert_operation(
    conn: &Connection,
    kind: &str,
    payload: &serde_json::Value,
    created_at: &DateTime<Utc>,
) -> Result<OperationRow, StoreError> {
    conn.execute(
        "INSERT INTO operations (kind, payload, status, created_at) VALUES (?1, ?2, 'pending', ?3)",
        params![kind, serde_json::to_string(payload)?, fmt_ts(created_at)],
    )?;
    Ok(OperationRow {
        id: conn.last_insert_rowid(),
        kind: kind.to_string(),
        payload: payload.clone(),
        status: OperationStatus::Pending,
        created_at: *created_at,
        started_at: None,
        completed_at: None,
        error: None,
    })
}
