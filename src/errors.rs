//! Typed error hierarchy for the tickflow engine.
//!
//! Four top-level enums cover the four subsystems:
//! - `StoreError` - persistence and row decoding failures
//! - `SchedulerError` - illegal phase/step transitions
//! - `QueueError` - operation queue failures
//! - `LockError` - singleton lock and remediation failures
//!
//! A lost compare-and-swap race is not an error at the store level; it is
//! reported as `CasOutcome::Conflict` and translated by the callers.

use thiserror::Error;

/// Errors from the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode row: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row {table}/{key}: {message}")]
    CorruptRow {
        table: String,
        key: String,
        message: String,
    },

    #[error("Store connection lock poisoned")]
    LockPoisoned,

    #[error("Store task panicked: {0}")]
    TaskPanicked(String),
}

/// Errors from the phase/step scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invariant violation on {entity}: expected {expected}, found {found}")]
    InvariantViolation {
        entity: String,
        expected: String,
        found: String,
    },

    #[error("Phase {index} is not part of the workflow")]
    UnknownPhase { index: u32 },

    #[error("Step {phase}:{step} is not part of the workflow")]
    UnknownStep { phase: u32, step: u32 },

    #[error("Gave up after {attempts} conflicting writes")]
    ConflictLimit { attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SchedulerError {
    pub fn violation(
        entity: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::InvariantViolation {
            entity: entity.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }
}

/// Errors from the operation serialization queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Operation {id} not found")]
    OperationNotFound { id: i64 },

    #[error("Operation {id} is {status}; only failed operations can be retried")]
    NotRetryable { id: i64, status: String },

    #[error("Another worker ({holder}) is draining '{kind}'")]
    WorkerLeaseHeld { kind: String, holder: String },

    #[error("Worker lease for '{kind}' lost while draining")]
    LeaseLost { kind: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the singleton lock and the remediation protocol.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock '{resource}' already claimed by {holder}")]
    ConflictRejected {
        resource: String,
        holder: String,
        stale: bool,
    },

    #[error("Lock '{resource}' held by {holder} is not stale yet")]
    NotStale { resource: String, holder: String },

    #[error("Lock '{resource}' is not held by this process")]
    NotHolder { resource: String },

    #[error("Remediation of '{resource}' failed: {source}")]
    RemediationFailed {
        resource: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Giving up on '{resource}' after {attempts} attempts")]
    AttemptsExhausted { resource: String, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}
