//! Host transactions and the commit lifecycle of an instance's pending work.
//!
//! - `ambient` -- the thread-scoped default transaction provider
//! - `coordinator` -- `TransactionalCommitCoordinator`: commit, complete, fault

use std::any::Any;
use std::sync::Arc;

use uuid::Uuid;

pub mod ambient;
pub mod coordinator;

pub use ambient::{ThreadTransactionProvider, TransactionScope};
pub use coordinator::TransactionalCommitCoordinator;

/// A transaction owned by the host. The core never begins, commits or aborts
/// it; it only hands it to participants.
pub trait Transaction: Send + Sync {
    fn id(&self) -> Uuid;

    /// Access to the concrete transaction for participants that know it.
    fn as_any(&self) -> &dyn Any;
}

/// Source of the transaction implicitly active for the calling thread.
pub trait AmbientTransactionProvider: Send + Sync {
    fn current_transaction(&self) -> Option<Arc<dyn Transaction>>;
}
