//! Operation serialization queue.
//!
//! Side effects against a shared external resource (the VCS, a deploy
//! target) are appended as operation rows and executed strictly in id order
//! by the single worker holding that kind's lease. The lease is a
//! [`SingletonLock`] on `queue:<kind>`; every status change of an operation
//! is a CAS, so a worker that lost its lease cannot silently overwrite
//! someone else's progress.

mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{DispatchPolicy, LockConfig, QueueConfig, generate_holder_id};
use crate::errors::{LockError, QueueError, StoreError};
use crate::lock::SingletonLock;
use crate::store::{CasOutcome, OperationRow, OperationStatus, Query, Record, RowKey, Store, Table};

/// Error recorded on operations found Running when a worker takes the lease.
pub const LEASE_LOST: &str = "worker lease lost";

/// Executes operations of one resource class.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, op: &OperationRow) -> anyhow::Result<()>;
}

/// Counts from one [`OperationQueue::drain`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub done: usize,
    pub failed: usize,
    /// Operations of a dead worker marked Failed during recovery.
    pub recovered: usize,
}

#[derive(Default)]
struct Shared {
    /// Highest operation id eligible for batched kinds.
    boundary: AtomicI64,
    wakers: Mutex<HashMap<String, Arc<Notify>>>,
    /// One drain loop per kind within this process.
    draining: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Clone)]
pub struct OperationQueue {
    store: Store,
    config: Arc<QueueConfig>,
    lock_config: LockConfig,
    holder_id: String,
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,
}

impl OperationQueue {
    pub fn new(store: Store, config: QueueConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            lock_config: LockConfig::default(),
            holder_id: generate_holder_id(),
            clock: Arc::new(SystemClock),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn with_holder(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    pub fn with_lock_config(mut self, lock_config: LockConfig) -> Self {
        self.lock_config = lock_config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Append a Pending operation and return its id. Never waits for
    /// execution; an immediate-policy worker for `kind` is woken.
    pub fn enqueue(&self, kind: &str, payload: serde_json::Value) -> Result<i64, QueueError> {
        let row = self
            .store
            .append_operation(kind, &payload, self.clock.now())?;
        info!(op_id = row.id, kind, "operation enqueued");
        if self.config.policy_for(kind) == DispatchPolicy::Immediate {
            self.waker(kind).notify_one();
        }
        Ok(row.id)
    }

    /// Record the batch boundary: every operation enqueued so far becomes
    /// eligible for batched kinds. Returns the boundary id.
    pub fn tick_boundary(&self) -> Result<i64, QueueError> {
        let last = self.store.last_operation_id()?;
        let previous = self.shared.boundary.fetch_max(last, Ordering::AcqRel);
        if last > previous {
            debug!(boundary = last, "batch boundary advanced");
            let wakers = self
                .shared
                .wakers
                .lock()
                .map_err(|_| StoreError::LockPoisoned)?;
            for (kind, waker) in wakers.iter() {
                if self.config.policy_for(kind) == DispatchPolicy::Batched {
                    waker.notify_one();
                }
            }
        }
        Ok(last.max(previous))
    }

    pub fn boundary(&self) -> i64 {
        self.shared.boundary.load(Ordering::Acquire)
    }

    pub fn get(&self, id: i64) -> Result<Option<OperationRow>, QueueError> {
        Ok(self
            .store
            .get(&RowKey::operation(id))?
            .and_then(|r| r.as_operation().cloned()))
    }

    /// Operations ordered by id, optionally filtered.
    pub fn list(
        &self,
        kind: Option<&str>,
        status: Option<OperationStatus>,
    ) -> Result<Vec<OperationRow>, QueueError> {
        let query = match kind {
            Some(kind) => Query::operations_of_kind(kind),
            None => Query::Table(Table::Operations),
        };
        Ok(self
            .store
            .read(&query)?
            .iter()
            .filter_map(Record::as_operation)
            .filter(|op| status.is_none_or(|s| op.status == s))
            .cloned()
            .collect())
    }

    /// Re-enqueue a Failed operation as a new Pending operation with the
    /// same kind and payload. Returns the new id.
    pub fn retry(&self, id: i64) -> Result<i64, QueueError> {
        let op = self.get(id)?.ok_or(QueueError::OperationNotFound { id })?;
        if op.status != OperationStatus::Failed {
            return Err(QueueError::NotRetryable {
                id,
                status: op.status.to_string(),
            });
        }
        let new_id = self.enqueue(&op.kind, op.payload)?;
        info!(op_id = id, new_op_id = new_id, kind = %op.kind, "failed operation re-enqueued");
        Ok(new_id)
    }

    /// The lease a worker must hold to drain `kind`.
    pub fn lease(&self, kind: &str) -> SingletonLock {
        SingletonLock::new(
            self.store.clone(),
            lease_resource(kind),
            self.holder_id.clone(),
            self.lock_config.stale_after(),
        )
        .with_clock(self.clock.clone())
    }

    /// Claim (or confirm) the worker lease for `kind`, taking over from a
    /// holder that stopped heartbeating.
    pub fn acquire_lease(&self, kind: &str) -> Result<SingletonLock, QueueError> {
        let lease = self.lease(kind);
        let outcome = match lease.try_claim() {
            Err(LockError::ConflictRejected { stale: true, .. }) => lease.reclaim_stale(),
            other => other,
        };
        match outcome {
            Ok(claim) => {
                if let Some(prior) = claim.reclaimed_from {
                    warn!(kind, stale_holder = %prior, "took over worker lease");
                }
                Ok(lease)
            }
            Err(LockError::ConflictRejected { holder, .. } | LockError::NotStale { holder, .. }) => {
                Err(QueueError::WorkerLeaseHeld {
                    kind: kind.to_string(),
                    holder,
                })
            }
            Err(LockError::Store(e)) => Err(e.into()),
            Err(e) => Err(QueueError::WorkerLeaseHeld {
                kind: kind.to_string(),
                holder: e.to_string(),
            }),
        }
    }

    /// Execute eligible Pending operations of `kind` one at a time in id
    /// order until none remain. Requires the worker lease.
    pub async fn drain(
        &self,
        kind: &str,
        executor: &dyn OperationExecutor,
    ) -> Result<DrainReport, QueueError> {
        let gate = self.drain_gate(kind)?;
        let _draining = gate.lock().await;

        let kind_owned = kind.to_string();
        let lease = self
            .blocking(move |q| q.acquire_lease(&kind_owned))
            .await?;
        let (heartbeat, lease_lost) =
            lease.spawn_heartbeat_watched(self.lock_config.heartbeat_interval());
        let result = self.drain_leased(kind, executor, &lease_lost).await;
        heartbeat.abort();
        result
    }

    async fn drain_leased(
        &self,
        kind: &str,
        executor: &dyn OperationExecutor,
        lease_lost: &watch::Receiver<bool>,
    ) -> Result<DrainReport, QueueError> {
        let mut report = DrainReport::default();
        let k = kind.to_string();
        report.recovered = self.blocking(move |q| q.recover_orphans(&k)).await?;

        loop {
            if *lease_lost.borrow() {
                warn!(kind, "worker lease heartbeat failed; drain stopped");
                return Err(QueueError::LeaseLost {
                    kind: kind.to_string(),
                });
            }
            let k = kind.to_string();
            let Some(op) = self.blocking(move |q| q.start_next(&k)).await? else {
                break;
            };
            debug!(op_id = op.id, kind, "executing operation");
            let outcome = executor.execute(&op).await;
            let finished = self.blocking(move |q| q.finish(op, outcome)).await?;
            match finished.status {
                OperationStatus::Done => report.done += 1,
                _ => report.failed += 1,
            }
        }
        Ok(report)
    }

    /// Mark Running operations of `kind` as Failed. Only called while
    /// holding the lease and not executing anything, so any Running row
    /// belongs to a worker that is gone.
    fn recover_orphans(&self, kind: &str) -> Result<usize, QueueError> {
        let mut recovered = 0;
        for op in self.list(Some(kind), Some(OperationStatus::Running))? {
            let failed = OperationRow {
                status: OperationStatus::Failed,
                completed_at: Some(self.clock.now()),
                error: Some(LEASE_LOST.to_string()),
                ..op.clone()
            };
            if self.cas(&failed, &op)?.is_applied() {
                warn!(op_id = op.id, kind, "orphaned running operation marked failed");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Fail with `WorkerLeaseHeld` unless this holder still owns the lease.
    fn ensure_lease(&self, kind: &str) -> Result<(), QueueError> {
        let row = self
            .store
            .get(&RowKey::lock(&lease_resource(kind)))?
            .and_then(|record| record.as_lock().cloned());
        match row {
            Some(row) if row.is_held_by(&self.holder_id) => Ok(()),
            row => {
                let holder = row.and_then(|r| r.holder_id).unwrap_or_default();
                warn!(kind, holder = %holder, "worker lease lost mid-drain");
                Err(QueueError::WorkerLeaseHeld {
                    kind: kind.to_string(),
                    holder,
                })
            }
        }
    }

    /// CAS the oldest eligible Pending operation to Running. Re-checks the
    /// lease first so a worker that stalled past the timeout stops here.
    fn start_next(&self, kind: &str) -> Result<Option<OperationRow>, QueueError> {
        self.ensure_lease(kind)?;
        let limit = match self.config.policy_for(kind) {
            DispatchPolicy::Immediate => i64::MAX,
            DispatchPolicy::Batched => self.boundary(),
        };
        loop {
            let next = self
                .list(Some(kind), Some(OperationStatus::Pending))?
                .into_iter()
                .next();
            let Some(op) = next.filter(|op| op.id <= limit) else {
                return Ok(None);
            };
            let running = OperationRow {
                status: OperationStatus::Running,
                started_at: Some(self.clock.now()),
                ..op.clone()
            };
            match self.cas(&running, &op)? {
                CasOutcome::Applied => return Ok(Some(running)),
                CasOutcome::Conflict { .. } => continue,
            }
        }
    }

    fn finish(
        &self,
        running: OperationRow,
        outcome: anyhow::Result<()>,
    ) -> Result<OperationRow, QueueError> {
        let finished = match outcome {
            Ok(()) => OperationRow {
                status: OperationStatus::Done,
                completed_at: Some(self.clock.now()),
                ..running.clone()
            },
            Err(e) => {
                warn!(op_id = running.id, kind = %running.kind, error = %e, "operation failed");
                OperationRow {
                    status: OperationStatus::Failed,
                    completed_at: Some(self.clock.now()),
                    error: Some(format!("{:#}", e)),
                    ..running.clone()
                }
            }
        };
        match self.cas(&finished, &running)? {
            CasOutcome::Applied => {
                info!(op_id = finished.id, kind = %finished.kind, status = %finished.status, "operation finished");
            }
            CasOutcome::Conflict { current } => {
                warn!(op_id = running.id, current = ?current, "operation changed under the worker; result dropped");
            }
        }
        Ok(finished)
    }

    fn cas(&self, next: &OperationRow, expected: &OperationRow) -> Result<CasOutcome, StoreError> {
        self.store.compare_and_swap(
            &Record::Operation(next.clone()),
            Some(&Record::Operation(expected.clone())),
        )
    }

    pub(crate) fn waker(&self, kind: &str) -> Arc<Notify> {
        let mut wakers = self
            .shared
            .wakers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        wakers.entry(kind.to_string()).or_default().clone()
    }

    fn drain_gate(&self, kind: &str) -> Result<Arc<tokio::sync::Mutex<()>>, QueueError> {
        let mut gates = self
            .shared
            .draining
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(gates.entry(kind.to_string()).or_default().clone())
    }

    async fn blocking<R, F>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&OperationQueue) -> Result<R, QueueError> + Send + 'static,
        R: Send + 'static,
    {
        let queue = self.clone();
        tokio::task::spawn_blocking(move || f(&queue))
            .await
            .map_err(|e| QueueError::from(StoreError::TaskPanicked(e.to_string())))?
    }
}

fn lease_resource(kind: &str) -> String {
    format!("queue:{}", kind)
}
