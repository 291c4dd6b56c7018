//! Sole-fixer protocol around a [`SingletonLock`].
//!
//! A process whose triggering action fails (e.g. a commit rejected by a
//! broken build) tries to become the sole fixer. The winner remediates while
//! heartbeating; everyone else backs off and retries the triggering action,
//! never the remediation.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Claim, SingletonLock};
use crate::config::LockConfig;
use crate::errors::{LockError, StoreError};

/// The idempotent shared fix performed by whichever process holds the lock.
#[async_trait]
pub trait Remediation: Send + Sync {
    async fn remediate(&self) -> anyhow::Result<()>;
}

/// Outcome of a successful [`Remediator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationReport<T> {
    pub value: T,
    /// Number of times the triggering action ran.
    pub attempts: u32,
    /// Times this process performed the remediation as sole fixer.
    pub remediations: u32,
    /// Times this process backed off because another process held the lock.
    pub waits: u32,
}

pub struct Remediator {
    lock: SingletonLock,
    backoff: Duration,
    heartbeat_interval: Duration,
    max_attempts: u32,
}

impl Remediator {
    pub fn new(lock: SingletonLock, config: &LockConfig) -> Self {
        Self {
            lock,
            backoff: config.backoff(),
            heartbeat_interval: config.heartbeat_interval(),
            max_attempts: config.max_attempts,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn lock(&self) -> &SingletonLock {
        &self.lock
    }

    /// Run `trigger` until it succeeds, coordinating remediation of its
    /// failure condition with other processes through the lock.
    ///
    /// Any error from `trigger` is treated as the triggering condition.
    /// Remediation failure leaves the lock Claimed and is returned as
    /// `RemediationFailed`; recovery is an operator decision or the
    /// staleness reclaim.
    pub async fn run<T, F, Fut>(
        &self,
        mut trigger: F,
        remediation: &dyn Remediation,
    ) -> Result<RemediationReport<T>, LockError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let resource = self.lock.resource_id().to_string();
        let (mut attempts, mut remediations, mut waits) = (0u32, 0u32, 0u32);

        while attempts < self.max_attempts {
            attempts += 1;
            let condition = match trigger().await {
                Ok(value) => {
                    return Ok(RemediationReport {
                        value,
                        attempts,
                        remediations,
                        waits,
                    });
                }
                Err(e) => e,
            };
            debug!(%resource, attempt = attempts, error = %condition, "trigger failed");

            let claim = match self.blocking(|lock| lock.try_claim()).await {
                Ok(claim) => Some(claim),
                Err(LockError::ConflictRejected { stale: true, holder, .. }) => {
                    info!(%resource, %holder, "holder stopped heartbeating; reclaiming");
                    match self.blocking(|lock| lock.reclaim_stale()).await {
                        Ok(claim) => Some(claim),
                        Err(LockError::ConflictRejected { .. } | LockError::NotStale { .. }) => None,
                        Err(e) => return Err(e),
                    }
                }
                Err(LockError::ConflictRejected { holder, .. }) => {
                    info!(%resource, %holder, backoff = ?self.backoff, "another process is fixing; waiting");
                    None
                }
                Err(e) => return Err(e),
            };

            match claim {
                Some(claim) => {
                    self.remediate(&claim, remediation).await?;
                    remediations += 1;
                }
                None => {
                    waits += 1;
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }

        Err(LockError::AttemptsExhausted { resource, attempts })
    }

    async fn remediate(&self, claim: &Claim, remediation: &dyn Remediation) -> Result<(), LockError> {
        info!(resource = %claim.resource_id, holder = %claim.holder_id, "remediating as sole fixer");
        let heartbeat = self.lock.spawn_heartbeat(self.heartbeat_interval);
        let result = remediation.remediate().await;
        heartbeat.abort();

        match result {
            Ok(()) => {
                self.blocking(|lock| lock.release()).await?;
                info!(resource = %claim.resource_id, "remediation succeeded");
                Ok(())
            }
            Err(source) => {
                warn!(resource = %claim.resource_id, error = %source, "remediation failed; lock left claimed");
                Err(LockError::RemediationFailed {
                    resource: claim.resource_id.clone(),
                    source,
                })
            }
        }
    }

    async fn blocking<R, F>(&self, f: F) -> Result<R, LockError>
    where
        F: FnOnce(&SingletonLock) -> Result<R, LockError> + Send + 'static,
        R: Send + 'static,
    {
        let lock = self.lock.clone();
        tokio::task::spawn_blocking(move || f(&lock))
            .await
            .map_err(|e| LockError::from(StoreError::TaskPanicked(e.to_string())))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{LockStatus, Store};
    use chrono::{TimeDelta, Utc};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FixBuild {
        broken: Arc<AtomicBool>,
        delay: Duration,
        succeed: bool,
        runs: AtomicU32,
    }

    #[async_trait]
    impl Remediation for FixBuild {
        async fn remediate(&self) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.succeed {
                self.broken.store(false, Ordering::SeqCst);
                Ok(())
            } else {
                anyhow::bail!("build still red")
            }
        }
    }

    fn fix(broken: &Arc<AtomicBool>, delay: Duration, succeed: bool) -> FixBuild {
        FixBuild {
            broken: broken.clone(),
            delay,
            succeed,
            runs: AtomicU32::new(0),
        }
    }

    fn commit(broken: Arc<AtomicBool>) -> impl FnMut() -> std::future::Ready<anyhow::Result<&'static str>> {
        move || {
            std::future::ready(if broken.load(Ordering::SeqCst) {
                Err(anyhow::anyhow!("pre-commit: build broken"))
            } else {
                Ok("committed")
            })
        }
    }

    fn remediator(store: &Store, holder: &str) -> Remediator {
        let lock = SingletonLock::new(store.clone(), "build", holder, TimeDelta::minutes(15));
        Remediator::new(lock, &LockConfig::default())
            .with_backoff(Duration::from_millis(150))
            .with_heartbeat_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_trigger_success_needs_no_lock() {
        let store = Store::open_in_memory().unwrap();
        let broken = Arc::new(AtomicBool::new(false));
        let report = remediator(&store, "agent-a")
            .run(commit(broken.clone()), &fix(&broken, Duration::ZERO, true))
            .await
            .unwrap();
        assert_eq!(report.value, "committed");
        assert_eq!(report.attempts, 1);
        assert_eq!(report.remediations, 0);
    }

    #[tokio::test]
    async fn test_sole_fixer_remediates_then_retries_trigger() {
        let store = Store::open_in_memory().unwrap();
        let broken = Arc::new(AtomicBool::new(true));
        let remedy = fix(&broken, Duration::from_millis(10), true);
        let r = remediator(&store, "agent-a");
        let report = r.run(commit(broken.clone()), &remedy).await.unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(report.remediations, 1);
        assert_eq!(remedy.runs.load(Ordering::SeqCst), 1);
        assert_eq!(r.lock().status().unwrap().status, LockStatus::Idle);
    }

    #[tokio::test]
    async fn test_loser_waits_and_retries_trigger_not_remediation() {
        let store = Store::open_in_memory().unwrap();
        let broken = Arc::new(AtomicBool::new(true));

        let a = remediator(&store, "agent-a");
        let b = remediator(&store, "agent-b");
        let remedy_a = fix(&broken, Duration::from_millis(60), true);
        let remedy_b = fix(&broken, Duration::ZERO, true);

        // A claims first so that B deterministically loses.
        a.lock().try_claim().unwrap();
        let (ra, rb) = tokio::join!(
            a.run(commit(broken.clone()), &remedy_a),
            b.run(commit(broken.clone()), &remedy_b),
        );
        let ra = ra.unwrap();
        let rb = rb.unwrap();
        assert_eq!(ra.remediations, 1);
        assert_eq!(rb.remediations, 0);
        assert_eq!(rb.waits, 1);
        assert_eq!(rb.attempts, 2);
        assert_eq!(remedy_b.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_remediation_leaves_lock_claimed() {
        let store = Store::open_in_memory().unwrap();
        let broken = Arc::new(AtomicBool::new(true));
        let r = remediator(&store, "agent-a");
        let err = r
            .run(commit(broken.clone()), &fix(&broken, Duration::ZERO, false))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::RemediationFailed { .. }));
        let row = r.lock().status().unwrap();
        assert!(row.is_held_by("agent-a"));
    }

    #[tokio::test]
    async fn test_stale_holder_is_reclaimed() {
        let store = Store::open_in_memory().unwrap();
        let clock = ManualClock::new(Utc::now());
        let broken = Arc::new(AtomicBool::new(true));

        let dead = SingletonLock::new(store.clone(), "build", "agent-dead", TimeDelta::minutes(15))
            .with_clock(Arc::new(clock.clone()));
        dead.try_claim().unwrap();
        clock.advance(TimeDelta::minutes(16));

        let lock = SingletonLock::new(store.clone(), "build", "agent-b", TimeDelta::minutes(15))
            .with_clock(Arc::new(clock.clone()));
        let r = Remediator::new(lock, &LockConfig::default())
            .with_heartbeat_interval(Duration::from_millis(20));
        let report = r
            .run(commit(broken.clone()), &fix(&broken, Duration::ZERO, true))
            .await
            .unwrap();
        assert_eq!(report.remediations, 1);
        assert_eq!(report.waits, 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let store = Store::open_in_memory().unwrap();
        let broken = Arc::new(AtomicBool::new(true));
        let other = SingletonLock::new(store.clone(), "build", "agent-a", TimeDelta::minutes(15));
        other.try_claim().unwrap();

        let r = remediator(&store, "agent-b")
            .with_backoff(Duration::from_millis(5))
            .with_max_attempts(3);
        let err = r
            .run(commit(broken.clone()), &fix(&broken, Duration::ZERO, true))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::AttemptsExhausted { attempts: 3, .. }));
    }

    /// Two agents hit a broken build at t=0. A becomes sole fixer and
    /// finishes at t=2min; B backs off 5min and its retried commit succeeds.
    #[tokio::test(start_paused = true)]
    async fn test_broken_build_timeline() {
        let store = Store::open_in_memory().unwrap();
        let config = LockConfig::default();
        let broken = Arc::new(AtomicBool::new(true));
        let lock = |holder: &str| {
            SingletonLock::new(store.clone(), "build", holder, config.stale_after())
        };
        let a = Remediator::new(lock("agent-a"), &config);
        let b = Remediator::new(lock("agent-b"), &config);
        let remedy_a = fix(&broken, Duration::from_secs(120), true);
        let remedy_b = fix(&broken, Duration::ZERO, true);

        let start = tokio::time::Instant::now();
        let committed_at = Arc::new(std::sync::Mutex::new(Vec::new()));
        let commit_b = {
            let broken = broken.clone();
            let committed_at = committed_at.clone();
            move || {
                let ok = !broken.load(Ordering::SeqCst);
                if ok {
                    committed_at.lock().unwrap().push(start.elapsed());
                }
                std::future::ready(if ok {
                    Ok("committed")
                } else {
                    Err(anyhow::anyhow!("pre-commit: build broken"))
                })
            }
        };

        a.lock().try_claim().unwrap();
        let (ra, rb) = tokio::join!(
            a.run(commit(broken.clone()), &remedy_a),
            b.run(commit_b, &remedy_b),
        );

        let ra = ra.unwrap();
        assert_eq!((ra.attempts, ra.remediations, ra.waits), (2, 1, 0));
        let rb = rb.unwrap();
        assert_eq!(rb.value, "committed");
        assert_eq!(rb.waits, 1);
        assert_eq!(rb.attempts, 2);
        assert_eq!(rb.remediations, 0);
        assert_eq!(remedy_a.runs.load(Ordering::SeqCst), 1);
        assert_eq!(remedy_b.runs.load(Ordering::SeqCst), 0);

        let committed_at = committed_at.lock().unwrap().clone();
        assert_eq!(committed_at.len(), 1);
        assert!(committed_at[0] >= config.backoff());
        assert!(committed_at[0] < config.backoff() + Duration::from_secs(1));
        assert_eq!(a.lock().status().unwrap().status, LockStatus::Idle);
    }
}
