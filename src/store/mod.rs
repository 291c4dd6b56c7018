//! Durable reactive row store.
//!
//! Every piece of shared state lives in one SQLite database. Writes go
//! through [`Store::compare_and_swap`], which checks the current row against
//! an expected prior value inside an `IMMEDIATE` transaction, so the check
//! and the write are atomic across threads and across processes sharing the
//! file. Each applied write appends to the `changes` log in the same
//! transaction; subscriptions are fed from that log, which makes local and
//! foreign writes flow through the same exactly-once delivery path.

pub mod models;
mod schema;
mod subscriptions;

pub use models::*;
pub use subscriptions::SubscriptionId;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior, params};
use serde::Serialize;
use tracing::{debug, trace};

use crate::errors::StoreError;
use subscriptions::{Listener, Registry};

/// A read filter. Subscriptions are keyed by the same type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    /// A single row by identity.
    Row(RowKey),
    /// Rows of a table sharing a partition value (see [`Record::partition`]).
    Partition { table: Table, partition: String },
    /// Every row of a table.
    Table(Table),
}

impl Query {
    pub fn partition(table: Table, partition: impl Into<String>) -> Self {
        Self::Partition {
            table,
            partition: partition.into(),
        }
    }

    pub fn steps_of_phase(phase_index: u32) -> Self {
        Self::partition(Table::Steps, phase_index.to_string())
    }

    pub fn tasks_of_step(phase_index: u32, step_index: u32) -> Self {
        Self::partition(Table::Tasks, step_id(phase_index, step_index))
    }

    pub fn operations_of_kind(kind: &str) -> Self {
        Self::partition(Table::Operations, kind)
    }
}

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Applied,
    /// The row did not match the expected prior value. `current` is what
    /// the store holds now (`None` if the row is absent).
    Conflict { current: Option<Record> },
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// One entry of the durable transition log.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEntry {
    pub seq: i64,
    pub key: RowKey,
    pub old: Option<Record>,
    pub new: Option<Record>,
    pub changed_at: DateTime<Utc>,
}

/// Lightweight change header used for dispatch.
struct ChangeHeader {
    seq: i64,
    key: RowKey,
    old_partition: Option<String>,
    new_partition: Option<String>,
}

struct StoreInner {
    conn: Mutex<Connection>,
    registry: Mutex<Registry>,
    /// Highest change sequence already dispatched by this handle.
    cursor: Mutex<i64>,
    /// Set while some thread is delivering notifications. Writes issued from
    /// inside a callback leave their change to the running delivery loop.
    dispatching: AtomicBool,
    path: Option<PathBuf>,
}

struct DispatchGuard<'a>(&'a AtomicBool);

impl<'a> DispatchGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cloneable handle to the store. Each `Store::open` call is an
/// independent connection with its own subscriptions and change cursor;
/// clones share both.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open (or create) a store at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Create an in-memory store (for tests and dry runs).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        schema::run_migrations(&conn)?;
        let cursor: i64 =
            conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM changes", [], |row| {
                row.get(0)
            })?;
        debug!(path = ?path, cursor, "store opened");
        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                registry: Mutex::new(Registry::default()),
                cursor: Mutex::new(cursor),
                dispatching: AtomicBool::new(false),
                path,
            }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.inner.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn registry(&self) -> Result<MutexGuard<'_, Registry>, StoreError> {
        self.inner
            .registry
            .lock()
            .map_err(|_| StoreError::LockPoisoned)
    }

    /// Run blocking store access on tokio's blocking pool.
    pub async fn call<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&Store) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| E::from(StoreError::TaskPanicked(e.to_string())))?
    }

    // ── Reads ─────────────────────────────────────────────────────────

    /// Consistent snapshot of the rows matching `query`, ordered by key.
    pub fn read(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn()?;
        schema::select(&conn, query)
    }

    pub fn get(&self, key: &RowKey) -> Result<Option<Record>, StoreError> {
        let conn = self.conn()?;
        schema::load(&conn, key)
    }

    /// Several queries evaluated under one read transaction.
    pub fn read_many(&self, queries: &[Query]) -> Result<Vec<Vec<Record>>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let mut out = Vec::with_capacity(queries.len());
        for query in queries {
            out.push(schema::select(&tx, query)?);
        }
        tx.commit()?;
        Ok(out)
    }

    // ── Writes ────────────────────────────────────────────────────────

    /// Atomically replace the row identified by `next` if it currently
    /// equals `expected` (`None` meaning "absent").
    pub fn compare_and_swap(
        &self,
        next: &Record,
        expected: Option<&Record>,
    ) -> Result<CasOutcome, StoreError> {
        let key = next.key();
        debug_assert!(expected.is_none_or(|e| e.key() == key));
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = schema::load(&tx, &key)?;
            if current.as_ref() != expected {
                trace!(%key, "cas conflict");
                return Ok(CasOutcome::Conflict { current });
            }
            schema::save(&tx, next)?;
            log_change(&tx, &key, current.as_ref(), Some(next))?;
            tx.commit()?;
        }
        trace!(%key, "cas applied");
        self.dispatch_pending()?;
        Ok(CasOutcome::Applied)
    }

    /// Insert a row only if nothing with the same identity exists.
    pub fn insert_if_absent(&self, record: &Record) -> Result<CasOutcome, StoreError> {
        self.compare_and_swap(record, None)
    }

    /// Append a new Pending operation. Ids are allocated by the database and
    /// increase monotonically across all processes sharing the file.
    pub fn append_operation(
        &self,
        kind: &str,
        payload: &serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<OperationRow, StoreError> {
        let row = {
            let mut conn = self.conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let row = schema::insert_operation(&tx, kind, payload, &created_at)?;
            let record = Record::Operation(row.clone());
            log_change(&tx, &record.key(), None, Some(&record))?;
            tx.commit()?;
            row
        };
        self.dispatch_pending()?;
        Ok(row)
    }

    /// Highest operation id allocated so far (0 when none exist).
    pub fn last_operation_id(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let id = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM operations", [], |row| {
            row.get(0)
        })?;
        Ok(id)
    }

    // ── Subscriptions ─────────────────────────────────────────────────

    /// Register `callback` for `query`. The current rowset is delivered
    /// before this returns; afterwards the callback fires once per committed
    /// change touching a matching row.
    pub fn subscribe<F>(&self, query: Query, callback: F) -> Result<SubscriptionId, StoreError>
    where
        F: FnMut(&[Record]) + Send + 'static,
    {
        // The rowset and the change-log head come from one snapshot, and the
        // listener is registered before the connection is released, so every
        // change is either in `rows` or delivered later, never both.
        let (listener, rows) = {
            let mut conn = self.conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let rows = schema::select(&tx, &query)?;
            let head = change_head(&tx)?;
            tx.commit()?;
            let listener = self
                .registry()?
                .insert(query.clone(), Box::new(callback), head);
            (listener, rows)
        };
        match DispatchGuard::acquire(&self.inner.dispatching) {
            Some(guard) => {
                listener.deliver(&rows);
                drop(guard);
                self.dispatch_pending()?;
            }
            None => listener.deliver(&rows),
        }
        Ok(listener.id)
    }

    /// Remove a subscription. No callback for it starts after this returns.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, StoreError> {
        Ok(self.registry()?.remove(id))
    }

    /// Deliver changes committed by other connections (other processes or
    /// other `Store::open` handles on the same file). Returns the number of
    /// changes dispatched.
    pub fn sync(&self) -> Result<usize, StoreError> {
        self.dispatch_pending()
    }

    fn dispatch_pending(&self) -> Result<usize, StoreError> {
        let mut total = 0;
        loop {
            let Some(guard) = DispatchGuard::acquire(&self.inner.dispatching) else {
                return Ok(total);
            };
            loop {
                let delivered = self.dispatch_batch()?;
                if delivered == 0 {
                    break;
                }
                total += delivered;
            }
            drop(guard);
            // A writer on another thread may have committed between our last
            // batch and releasing the flag.
            if !self.has_pending()? {
                return Ok(total);
            }
        }
    }

    fn has_pending(&self) -> Result<bool, StoreError> {
        let head = change_head(&*self.conn()?)?;
        let cursor = *self
            .inner
            .cursor
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(head > cursor)
    }

    fn dispatch_batch(&self) -> Result<usize, StoreError> {
        let changes = {
            let conn = self.conn()?;
            let mut cursor = self
                .inner
                .cursor
                .lock()
                .map_err(|_| StoreError::LockPoisoned)?;
            let changes = load_headers_since(&conn, *cursor)?;
            if let Some(last) = changes.last() {
                *cursor = last.seq;
            }
            changes
        };
        for change in &changes {
            let listeners = self.registry()?.affected(
                &change.key,
                &[
                    change.old_partition.as_deref(),
                    change.new_partition.as_deref(),
                ],
            );
            for listener in listeners.iter().filter(|l| change.seq > l.since) {
                self.deliver(listener)?;
            }
        }
        Ok(changes.len())
    }

    fn deliver(&self, listener: &Listener) -> Result<(), StoreError> {
        let rows = self.read(&listener.query)?;
        listener.deliver(&rows);
        Ok(())
    }

    // ── Audit ─────────────────────────────────────────────────────────

    /// Transition log entries with `seq > since`, oldest first.
    pub fn changes_since(&self, since: i64, limit: usize) -> Result<Vec<ChangeEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT seq, table_name, row_key, old_value, new_value, changed_at
             FROM changes WHERE seq > ?1 ORDER BY seq LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (seq, table, key, old, new, changed_at) = row?;
            let table: Table = table.parse().map_err(|e: String| StoreError::CorruptRow {
                table: "changes".into(),
                key: seq.to_string(),
                message: e,
            })?;
            let changed_at = DateTime::parse_from_rfc3339(&changed_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StoreError::CorruptRow {
                    table: "changes".into(),
                    key: seq.to_string(),
                    message: e.to_string(),
                })?;
            out.push(ChangeEntry {
                seq,
                key: RowKey::new(table, key),
                old: old.map(|s| serde_json::from_str(&s)).transpose()?,
                new: new.map(|s| serde_json::from_str(&s)).transpose()?,
                changed_at,
            });
        }
        Ok(out)
    }
}

fn log_change(
    conn: &Connection,
    key: &RowKey,
    old: Option<&Record>,
    new: Option<&Record>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO changes (table_name, row_key, old_partition, new_partition, old_value, new_value, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            key.table.as_str(),
            key.key,
            old.and_then(Record::partition),
            new.and_then(Record::partition),
            old.map(serde_json::to_string).transpose()?,
            new.map(serde_json::to_string).transpose()?,
            schema::fmt_ts(&Utc::now()),
        ],
    )?;
    Ok(())
}

fn change_head(conn: &Connection) -> Result<i64, StoreError> {
    let head = conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM changes", [], |row| {
        row.get(0)
    })?;
    Ok(head)
}

fn load_headers_since(conn: &Connection, since: i64) -> Result<Vec<ChangeHeader>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT seq, table_name, row_key, old_partition, new_partition
         FROM changes WHERE seq > ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![since], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (seq, table, key, old_partition, new_partition) = row?;
        let table: Table = table.parse().map_err(|e: String| StoreError::CorruptRow {
            table: "changes".into(),
            key: seq.to_string(),
            message: e,
        })?;
        out.push(ChangeHeader {
            seq,
            key: RowKey::new(table, key),
            old_partition,
            new_partition,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn recorder() -> (Arc<Mutex<Vec<Vec<Record>>>>, impl FnMut(&[Record]) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |rows: &[Record]| sink.lock().unwrap().push(rows.to_vec()))
    }

    #[test]
    fn test_insert_if_absent_then_conflict() -> Result<(), StoreError> {
        let store = Store::open_in_memory()?;
        let phase = Record::Phase(PhaseRow::pending(0));
        assert!(store.insert_if_absent(&phase)?.is_applied());

        let active = Record::Phase(PhaseRow::pending(0).with_status(PhaseStatus::Active));
        match store.insert_if_absent(&active)? {
            CasOutcome::Conflict { current } => assert_eq!(current, Some(phase.clone())),
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(store.get(&RowKey::phase(0))?, Some(phase));
        Ok(())
    }

    #[test]
    fn test_cas_rejects_stale_expected_value() -> Result<(), StoreError> {
        let store = Store::open_in_memory()?;
        let pending = Record::Step(StepRow::pending(0, 0));
        store.insert_if_absent(&pending)?;

        let active = Record::Step(StepRow::pending(0, 0).with_status(StepStatus::Active));
        assert!(store.compare_and_swap(&active, Some(&pending))?.is_applied());

        // Second writer still believes the row is pending.
        let completed = Record::Step(StepRow::pending(0, 0).with_status(StepStatus::Completed));
        let outcome = store.compare_and_swap(&completed, Some(&pending))?;
        assert_eq!(
            outcome,
            CasOutcome::Conflict {
                current: Some(active.clone())
            }
        );
        assert_eq!(store.get(&RowKey::step(0, 0))?, Some(active));
        Ok(())
    }

    #[test]
    fn test_subscribe_delivers_initial_then_each_matching_write() -> Result<(), StoreError> {
        let store = Store::open_in_memory()?;
        let (seen, callback) = recorder();
        store.subscribe(Query::tasks_of_step(0, 0), callback)?;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(seen.lock().unwrap()[0].is_empty());

        let task = Record::Task(TaskRow::new("t-1", Some(step_id(0, 0))));
        store.insert_if_absent(&task)?;
        // Unrelated partition and unrelated table
        store.insert_if_absent(&Record::Task(TaskRow::new("t-2", Some(step_id(1, 0)))))?;
        store.insert_if_absent(&Record::Phase(PhaseRow::pending(0)))?;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], vec![task]);
        Ok(())
    }

    #[test]
    fn test_conflicting_write_does_not_notify() -> Result<(), StoreError> {
        let store = Store::open_in_memory()?;
        let phase = Record::Phase(PhaseRow::pending(0));
        store.insert_if_absent(&phase)?;
        let (seen, callback) = recorder();
        store.subscribe(Query::Row(RowKey::phase(0)), callback)?;

        store.insert_if_absent(&phase)?;
        assert_eq!(seen.lock().unwrap().len(), 1);
        Ok(())
    }

    #[test]
    fn test_unsubscribe_stops_delivery() -> Result<(), StoreError> {
        let store = Store::open_in_memory()?;
        let (seen, callback) = recorder();
        let id = store.subscribe(Query::Table(Table::Phases), callback)?;
        store.insert_if_absent(&Record::Phase(PhaseRow::pending(0)))?;
        assert!(store.unsubscribe(id)?);
        store.insert_if_absent(&Record::Phase(PhaseRow::pending(1)))?;
        assert_eq!(seen.lock().unwrap().len(), 2);
        Ok(())
    }

    #[test]
    fn test_task_moving_between_steps_notifies_both_partitions() -> Result<(), StoreError> {
        let store = Store::open_in_memory()?;
        let task = TaskRow::new("t-1", Some(step_id(0, 0)));
        store.insert_if_absent(&Record::Task(task.clone()))?;

        let (old_side, cb_old) = recorder();
        let (new_side, cb_new) = recorder();
        store.subscribe(Query::tasks_of_step(0, 0), cb_old)?;
        store.subscribe(Query::tasks_of_step(0, 1), cb_new)?;

        let moved = TaskRow {
            step_id: Some(step_id(0, 1)),
            ..task.clone()
        };
        store.compare_and_swap(&Record::Task(moved), Some(&Record::Task(task)))?;

        assert_eq!(old_side.lock().unwrap().len(), 2);
        assert!(old_side.lock().unwrap()[1].is_empty());
        assert_eq!(new_side.lock().unwrap().len(), 2);
        assert_eq!(new_side.lock().unwrap()[1].len(), 1);
        Ok(())
    }

    #[test]
    fn test_callback_may_write_back_into_store() -> Result<(), StoreError> {
        let store = Store::open_in_memory()?;
        let writer = store.clone();
        store.subscribe(Query::Row(RowKey::phase(0)), move |rows| {
            if let Some(Record::Phase(p)) = rows.first()
                && p.status == PhaseStatus::Pending
            {
                let next = Record::Phase(p.with_status(PhaseStatus::Active));
                writer
                    .compare_and_swap(&next, rows.first())
                    .expect("nested write");
            }
        })?;
        store.insert_if_absent(&Record::Phase(PhaseRow::pending(0)))?;
        let row = store.get(&RowKey::phase(0))?.unwrap();
        assert_eq!(row.as_phase().unwrap().status, PhaseStatus::Active);
        Ok(())
    }

    #[test]
    fn test_append_operation_assigns_increasing_ids() -> Result<(), StoreError> {
        let store = Store::open_in_memory()?;
        let a = store.append_operation("vcs", &serde_json::json!({"msg": "a"}), Utc::now())?;
        let b = store.append_operation("vcs", &serde_json::json!({"msg": "b"}), Utc::now())?;
        assert!(b.id > a.id);
        let rows = store.read(&Query::operations_of_kind("vcs"))?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], Record::Operation(a));
        Ok(())
    }

    #[test]
    fn test_second_handle_sees_foreign_writes_on_sync() -> Result<(), StoreError> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        let a = Store::open(&path)?;
        let b = Store::open(&path)?;

        let (seen, callback) = recorder();
        b.subscribe(Query::Table(Table::Phases), callback)?;

        a.insert_if_absent(&Record::Phase(PhaseRow::pending(0)))?;
        a.insert_if_absent(&Record::Phase(PhaseRow::pending(1)))?;
        assert_eq!(seen.lock().unwrap().len(), 1, "no delivery before sync");

        assert_eq!(b.sync()?, 2);
        assert_eq!(seen.lock().unwrap().len(), 3);
        // Settled: a second sync has nothing new.
        assert_eq!(b.sync()?, 0);
        assert_eq!(seen.lock().unwrap().len(), 3);
        Ok(())
    }

    #[test]
    fn test_subscribe_behind_cursor_delivers_existing_rows_once() -> Result<(), StoreError> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        let a = Store::open(&path)?;
        let b = Store::open(&path)?;
        a.insert_if_absent(&Record::Phase(PhaseRow::pending(0)))?;

        let (seen, callback) = recorder();
        b.subscribe(Query::Table(Table::Phases), callback)?;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap()[0].len(), 1);
        b.sync()?;
        assert_eq!(seen.lock().unwrap().len(), 1, "initial rows redelivered");

        a.insert_if_absent(&Record::Phase(PhaseRow::pending(1)))?;
        assert_eq!(b.sync()?, 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].len(), 2);
        Ok(())
    }

    #[test]
    fn test_cas_is_atomic_across_handles() -> Result<(), StoreError> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        let a = Store::open(&path)?;
        let b = Store::open(&path)?;
        let idle = Record::Lock(LockRow::idle("build"));
        a.insert_if_absent(&idle)?;

        let now = Utc::now();
        let claim_a = Record::Lock(LockRow::claimed("build", "a", now));
        let claim_b = Record::Lock(LockRow::claimed("build", "b", now));
        assert!(a.compare_and_swap(&claim_a, Some(&idle))?.is_applied());
        match b.compare_and_swap(&claim_b, Some(&idle))? {
            CasOutcome::Conflict { current } => assert_eq!(current, Some(claim_a)),
            other => panic!("expected conflict, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_change_log_records_transitions() -> Result<(), StoreError> {
        let store = Store::open_in_memory()?;
        let pending = Record::Phase(PhaseRow::pending(0));
        store.insert_if_absent(&pending)?;
        let active = Record::Phase(PhaseRow::pending(0).with_status(PhaseStatus::Active));
        store.compare_and_swap(&active, Some(&pending))?;

        let log = store.changes_since(0, 100)?;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].old, None);
        assert_eq!(log[1].old, Some(pending));
        assert_eq!(log[1].new, Some(active));
        assert_eq!(store.changes_since(log[0].seq, 100)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_operation_timestamps_round_trip() -> Result<(), StoreError> {
        let store = Store::open_in_memory()?;
        let op = store.append_operation("vcs", &serde_json::Value::Null, Utc::now())?;
        let running = OperationRow {
            status: OperationStatus::Running,
            started_at: Some(Utc::now()),
            ..op.clone()
        };
        let outcome =
            store.compare_and_swap(&Record::Operation(running.clone()), Some(&Record::Operation(op)))?;
        assert!(outcome.is_applied());
        assert_eq!(
            store.get(&RowKey::operation(running.id))?,
            Some(Record::Operation(running))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_call_runs_on_blocking_pool() -> Result<(), StoreError> {
        let store = Store::open_in_memory()?;
        let rows = store
            .call(|s| {
                s.insert_if_absent(&Record::Phase(PhaseRow::pending(4)))?;
                s.read(&Query::Table(Table::Phases))
            })
            .await?;
        assert_eq!(rows.len(), 1);
        Ok(())
    }
}
