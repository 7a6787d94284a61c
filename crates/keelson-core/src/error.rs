//! Error taxonomy shared by the execution core.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by batching, commit, timer, and rollback operations.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A collaborator broke the protocol (mutating a sealed batch, unbalanced
    /// context release, rollback without checkpoint). Always a bug.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),

    /// Commit was requested with no ambient transaction active.
    #[error("no ambient transaction is active")]
    TransactionUnavailable,

    /// A pending-work participant failed while committing its items.
    #[error("participant '{participant}' failed: {message}")]
    ParticipantFailure { participant: String, message: String },

    /// A participant raised an error the host classified as process-fatal.
    #[error(transparent)]
    Irrecoverable(anyhow::Error),

    /// Rollback aborted before the instance swap; nothing was installed.
    #[error("rollback failed: {0}")]
    RollbackFailure(String),

    /// The execution tree could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The serialized execution tree exceeds the configured limit.
    #[error("snapshot of {size} bytes exceeds limit of {max} bytes")]
    SnapshotTooLarge { size: usize, max: usize },

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),
}

impl ExecutionError {
    pub(crate) fn misuse(message: impl Into<String>) -> Self {
        ExecutionError::ProtocolMisuse(message.into())
    }

    /// Whether the error must halt the enclosing operation unconditionally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecutionError::ProtocolMisuse(_)
                | ExecutionError::Irrecoverable(_)
                | ExecutionError::RollbackFailure(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Irrecoverable classification
// ---------------------------------------------------------------------------

/// Marker error a participant returns (or wraps) to signal a process-fatal
/// condition. The default [`IrrecoverablePolicy`] recognizes it anywhere in
/// the error chain.
#[derive(Debug, Error)]
#[error("irrecoverable fault: {0}")]
pub struct IrrecoverableFault(pub String);

/// Predicate separating process-fatal participant errors from ordinary ones.
///
/// Supplied by the host; cloning shares the same predicate.
#[derive(Clone)]
pub struct IrrecoverablePolicy {
    classify: Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>,
}

impl IrrecoverablePolicy {
    pub fn new(classify: impl Fn(&anyhow::Error) -> bool + Send + Sync + 'static) -> Self {
        Self {
            classify: Arc::new(classify),
        }
    }

    /// A policy that treats every participant error as recoverable.
    pub fn never() -> Self {
        Self::new(|_| false)
    }

    pub fn is_irrecoverable(&self, error: &anyhow::Error) -> bool {
        (self.classify)(error)
    }
}

impl Default for IrrecoverablePolicy {
    fn default() -> Self {
        Self::new(|error| {
            error
                .chain()
                .any(|cause| cause.downcast_ref::<IrrecoverableFault>().is_some())
        })
    }
}

impl std::fmt::Debug for IrrecoverablePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrrecoverablePolicy").finish_non_exhaustive()
    }
}
