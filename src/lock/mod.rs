//! Singleton lock: leader-election style mutual exclusion over one store row.
//!
//! Safety comes from CAS on the expected holder; liveness from the
//! heartbeat timeout. A claim whose `last_heartbeat` is older than
//! `stale_after` may be force-reclaimed by anyone.

pub mod remediation;

pub use remediation::{Remediation, RemediationReport, Remediator};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::errors::{LockError, StoreError};
use crate::store::{CasOutcome, LockRow, LockStatus, Record, RowKey, Store};

const MAX_CLAIM_RACES: u32 = 8;

/// Proof of a successful claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub resource_id: String,
    pub holder_id: String,
    pub claimed_at: DateTime<Utc>,
    /// Set when the claim replaced a stale holder.
    pub reclaimed_from: Option<String>,
}

#[derive(Clone)]
pub struct SingletonLock {
    store: Store,
    resource_id: String,
    holder_id: String,
    stale_after: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl SingletonLock {
    pub fn new(
        store: Store,
        resource_id: impl Into<String>,
        holder_id: impl Into<String>,
        stale_after: TimeDelta,
    ) -> Self {
        Self {
            store,
            resource_id: resource_id.into(),
            holder_id: holder_id.into(),
            stale_after,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Current lock row, creating it as Idle the first time the resource is seen.
    pub fn status(&self) -> Result<LockRow, LockError> {
        let key = RowKey::lock(&self.resource_id);
        if let Some(Record::Lock(row)) = self.store.get(&key)? {
            return Ok(row);
        }
        // Losing this insert race is fine: somebody else created the row.
        self.store
            .insert_if_absent(&Record::Lock(LockRow::idle(&self.resource_id)))?;
        match self.store.get(&key)? {
            Some(Record::Lock(row)) => Ok(row),
            _ => Err(StoreError::CorruptRow {
                table: "singleton_lock".into(),
                key: self.resource_id.clone(),
                message: "lock row missing after insert".into(),
            }
            .into()),
        }
    }

    /// Whether the holder of `row` has stopped heartbeating for longer than
    /// the staleness timeout. A row already marked Stale is always expired.
    pub fn is_expired(&self, row: &LockRow) -> bool {
        match row.status {
            LockStatus::Idle => false,
            LockStatus::Stale => true,
            LockStatus::Claimed => match row.last_heartbeat.or(row.claimed_at) {
                Some(hb) => self.clock.now() - hb > self.stale_after,
                None => true,
            },
        }
    }

    /// Attempt `Idle → Claimed(self)`.
    ///
    /// Fails with `ConflictRejected` (carrying the current holder) when
    /// somebody else holds the lock; `stale` tells the caller whether a
    /// [`reclaim_stale`](Self::reclaim_stale) would be accepted.
    pub fn try_claim(&self) -> Result<Claim, LockError> {
        for _ in 0..MAX_CLAIM_RACES {
            let row = self.status()?;
            match row.status {
                LockStatus::Idle => {
                    let now = self.clock.now();
                    let next = LockRow::claimed(&self.resource_id, &self.holder_id, now);
                    match self.cas(&next, &row)? {
                        CasOutcome::Applied => {
                            info!(resource = %self.resource_id, holder = %self.holder_id, "lock claimed");
                            return Ok(self.claim(now, None));
                        }
                        CasOutcome::Conflict { .. } => continue,
                    }
                }
                _ if row.is_held_by(&self.holder_id) => {
                    return Ok(self.claim(row.claimed_at.unwrap_or_else(|| self.clock.now()), None));
                }
                _ => return Err(self.rejected(&row)),
            }
        }
        let row = self.status()?;
        Err(self.rejected(&row))
    }

    /// Persist `Claimed → Stale` once the holder's heartbeat has expired, so
    /// observers can see the abandoned claim. Returns whether this call
    /// made the transition.
    pub fn mark_stale_if_expired(&self) -> Result<bool, LockError> {
        let row = self.status()?;
        if row.status != LockStatus::Claimed || !self.is_expired(&row) {
            return Ok(false);
        }
        let next = LockRow {
            status: LockStatus::Stale,
            ..row.clone()
        };
        let applied = self.cas(&next, &row)?.is_applied();
        if applied {
            warn!(resource = %self.resource_id, holder = ?row.holder_id, "lock marked stale");
        }
        Ok(applied)
    }

    /// Force-reclaim a claim whose holder stopped heartbeating. The CAS is
    /// keyed on the stale holder's row, so two reclaimers cannot both win.
    pub fn reclaim_stale(&self) -> Result<Claim, LockError> {
        let row = self.status()?;
        if row.status == LockStatus::Idle || row.is_held_by(&self.holder_id) {
            return self.try_claim();
        }
        let prior = row.holder_id.clone().unwrap_or_default();
        if !self.is_expired(&row) {
            return Err(LockError::NotStale {
                resource: self.resource_id.clone(),
                holder: prior,
            });
        }
        let now = self.clock.now();
        let next = LockRow::claimed(&self.resource_id, &self.holder_id, now);
        match self.cas(&next, &row)? {
            CasOutcome::Applied => {
                warn!(
                    resource = %self.resource_id,
                    holder = %self.holder_id,
                    stale_holder = %prior,
                    "reclaimed stale lock"
                );
                Ok(self.claim(now, Some(prior)))
            }
            CasOutcome::Conflict { current } => {
                let current = match current {
                    Some(Record::Lock(row)) => row,
                    _ => self.status()?,
                };
                Err(self.rejected(&current))
            }
        }
    }

    /// Refresh `last_heartbeat` on our own claim.
    pub fn heartbeat(&self) -> Result<(), LockError> {
        let row = self.status()?;
        if !row.is_held_by(&self.holder_id) {
            return Err(self.not_holder());
        }
        let next = LockRow {
            last_heartbeat: Some(self.clock.now()),
            ..row.clone()
        };
        match self.cas(&next, &row)? {
            CasOutcome::Applied => {
                debug!(resource = %self.resource_id, "lock heartbeat");
                Ok(())
            }
            CasOutcome::Conflict { .. } => Err(self.not_holder()),
        }
    }

    /// `Claimed(self) → Idle`.
    pub fn release(&self) -> Result<(), LockError> {
        let row = self.status()?;
        if !row.is_held_by(&self.holder_id) {
            return Err(self.not_holder());
        }
        match self.cas(&LockRow::idle(&self.resource_id), &row)? {
            CasOutcome::Applied => {
                info!(resource = %self.resource_id, holder = %self.holder_id, "lock released");
                Ok(())
            }
            CasOutcome::Conflict { .. } => Err(self.not_holder()),
        }
    }

    /// Operator override: return the lock to Idle whoever holds it.
    /// Returns the evicted holder, if any.
    pub fn force_release(&self) -> Result<Option<String>, LockError> {
        for _ in 0..MAX_CLAIM_RACES {
            let row = self.status()?;
            if row.status == LockStatus::Idle {
                return Ok(None);
            }
            if self.cas(&LockRow::idle(&self.resource_id), &row)?.is_applied() {
                warn!(
                    resource = %self.resource_id,
                    holder = ?row.holder_id,
                    by = %self.holder_id,
                    "lock force-released"
                );
                return Ok(row.holder_id);
            }
        }
        Err(LockError::ConflictRejected {
            resource: self.resource_id.clone(),
            holder: self.status()?.holder_id.unwrap_or_default(),
            stale: false,
        })
    }

    /// Heartbeat on `interval` until the returned handle is aborted.
    pub fn spawn_heartbeat(&self, interval: Duration) -> JoinHandle<()> {
        self.spawn_heartbeat_watched(interval).0
    }

    /// Like [`spawn_heartbeat`](Self::spawn_heartbeat), plus a receiver that
    /// flips to `true` once a heartbeat fails and the claim can no longer
    /// be trusted.
    pub fn spawn_heartbeat_watched(
        &self,
        interval: Duration,
    ) -> (JoinHandle<()>, watch::Receiver<bool>) {
        let (lost_tx, lost_rx) = watch::channel(false);
        let lock = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let beat = lock.clone();
                match tokio::task::spawn_blocking(move || beat.heartbeat()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(resource = %lock.resource_id, error = %e, "heartbeat failed; stopping");
                        lost_tx.send_replace(true);
                        return;
                    }
                    Err(e) => {
                        warn!(resource = %lock.resource_id, error = %e, "heartbeat task panicked");
                        lost_tx.send_replace(true);
                        return;
                    }
                }
            }
        });
        (handle, lost_rx)
    }

    fn cas(&self, next: &LockRow, expected: &LockRow) -> Result<CasOutcome, StoreError> {
        self.store.compare_and_swap(
            &Record::Lock(next.clone()),
            Some(&Record::Lock(expected.clone())),
        )
    }

    fn claim(&self, claimed_at: DateTime<Utc>, reclaimed_from: Option<String>) -> Claim {
        Claim {
            resource_id: self.resource_id.clone(),
            holder_id: self.holder_id.clone(),
            claimed_at,
            reclaimed_from,
        }
    }

    fn rejected(&self, row: &LockRow) -> LockError {
        let holder = row.holder_id.clone().unwrap_or_default();
        debug!(resource = %self.resource_id, %holder, "claim rejected");
        LockError::ConflictRejected {
            resource: self.resource_id.clone(),
            holder,
            stale: self.is_expired(row),
        }
    }

    fn not_holder(&self) -> LockError {
        LockError::NotHolder {
            resource: self.resource_id.clone(),
        }
    }
}
