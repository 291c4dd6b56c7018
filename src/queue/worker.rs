use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{OperationExecutor, OperationQueue};
use crate::errors::{QueueError, StoreError};

impl OperationQueue {
    /// Run a long-lived worker for `kind`.
    ///
    /// The worker claims the kind's lease up front (a second worker is
    /// refused with `WorkerLeaseHeld`), heartbeats it for its whole life and
    /// drains whenever it is woken: by `enqueue` for immediate kinds, by
    /// `tick_boundary` for batched kinds, and on the poll interval. The
    /// lease is released when `shutdown` flips to `true`.
    pub fn spawn_worker(
        &self,
        kind: impl Into<String>,
        executor: Arc<dyn OperationExecutor>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<(), QueueError>> {
        let queue = self.clone();
        let kind = kind.into();
        tokio::spawn(async move {
            let k = kind.clone();
            let lease = queue.blocking(move |q| q.acquire_lease(&k)).await?;
            info!(%kind, holder = %queue.holder_id, "queue worker started");
            let heartbeat = lease.spawn_heartbeat(queue.lock_config.heartbeat_interval());
            let waker = queue.waker(&kind);
            let poll = queue.config.poll_interval();

            let result = loop {
                if *shutdown.borrow() {
                    break Ok(());
                }
                if let Err(e) = queue.drain(&kind, executor.as_ref()).await {
                    break Err(e);
                }
                tokio::select! {
                    _ = waker.notified() => {}
                    _ = tokio::time::sleep(poll) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break Ok(());
                        }
                    }
                }
            };

            heartbeat.abort();
            let released = tokio::task::spawn_blocking(move || lease.release())
                .await
                .map_err(|e| QueueError::from(StoreError::TaskPanicked(e.to_string())))?;
            if let Err(e) = released {
                warn!(%kind, error = %e, "could not release worker lease");
            }
            match &result {
                Ok(()) => info!(%kind, "queue worker stopped"),
                Err(e) => warn!(%kind, error = %e, "queue worker stopped"),
            }
            result
        })
    }
}
