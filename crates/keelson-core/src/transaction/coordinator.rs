//! Drives an instance's pending work through the host transaction.
//!
//! The lifecycle is `commit` (inside the host transaction), then `complete`
//! once the host knows the outcome, or `handle_fault` if the commit failed.
//! `commit_and_complete` runs the whole sequence for hosts that do not manage
//! the transaction boundary themselves.

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::batch::{BatchRegistry, WorkItemBatch};
use crate::error::ExecutionError;

use super::AmbientTransactionProvider;

/// Commit coordinator for one instance's batch registry.
pub struct TransactionalCommitCoordinator {
    instance_id: Uuid,
    registry: Arc<BatchRegistry>,
    transactions: Arc<dyn AmbientTransactionProvider>,
    /// Merged batch between `commit` and `complete`/`handle_fault`.
    merged: Mutex<Option<Arc<WorkItemBatch>>>,
}

impl TransactionalCommitCoordinator {
    pub fn new(
        instance_id: Uuid,
        registry: Arc<BatchRegistry>,
        transactions: Arc<dyn AmbientTransactionProvider>,
    ) -> Self {
        Self {
            instance_id,
            registry,
            transactions,
            merged: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<BatchRegistry> {
        &self.registry
    }

    /// Whether the registry holds work that must be committed.
    pub fn is_dirty(&self) -> Result<bool, ExecutionError> {
        self.registry.is_dirty()
    }

    /// Whether a committed batch is waiting for `complete`.
    pub fn has_outstanding_commit(&self) -> bool {
        self.merged
            .lock()
            .expect("coordinator lock poisoned")
            .is_some()
    }

    /// Merge every pending batch and commit it in the ambient transaction.
    pub fn commit(&self) -> Result<(), ExecutionError> {
        let transaction = self
            .transactions
            .current_transaction()
            .ok_or(ExecutionError::TransactionUnavailable)?;

        let merged = self.registry.merged_batch()?;
        if let Some(stale) = self.replace_merged(Some(Arc::clone(&merged))) {
            stale.dispose();
        }

        tracing::debug!(
            instance_id = %self.instance_id,
            transaction_id = %transaction.id(),
            items = merged.len(),
            "committing pending work"
        );
        merged.commit(&*transaction)
    }

    /// Report a successful commit to every participant, then release all
    /// pending work. Cleanup runs even if a participant fails
    /// irrecoverably or panics.
    pub fn complete(&self) -> Result<(), ExecutionError> {
        let merged = self
            .replace_merged(None)
            .ok_or_else(|| ExecutionError::misuse("complete called without a prior commit"))?;

        let cleanup = Cleanup {
            registry: &self.registry,
            merged: &merged,
        };
        let result = cleanup.merged.complete(true);
        drop(cleanup);

        tracing::debug!(
            instance_id = %self.instance_id,
            ok = result.is_ok(),
            "pending work completed"
        );
        result
    }

    /// Abandon the outstanding commit after a fault. Participants are not
    /// told; scope batches stay registered and the transient batch is
    /// discarded.
    pub fn handle_fault(&self) {
        if let Some(merged) = self.replace_merged(None) {
            merged.dispose();
        }
        self.registry.discard_transient();
        tracing::debug!(instance_id = %self.instance_id, "commit fault handled");
    }

    /// `commit` then `complete`; on commit failure run `handle_fault` and
    /// return the commit error.
    pub fn commit_and_complete(&self) -> Result<(), ExecutionError> {
        if let Err(e) = self.commit() {
            tracing::warn!(instance_id = %self.instance_id, error = %e, "commit failed");
            self.handle_fault();
            return Err(e);
        }
        self.complete()
    }

    fn replace_merged(&self, merged: Option<Arc<WorkItemBatch>>) -> Option<Arc<WorkItemBatch>> {
        let mut slot = self.merged.lock().expect("coordinator lock poisoned");
        std::mem::replace(&mut *slot, merged)
    }
}

impl std::fmt::Debug for TransactionalCommitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalCommitCoordinator")
            .field("instance_id", &self.instance_id)
            .field("outstanding_commit", &self.has_outstanding_commit())
            .finish()
    }
}

/// Releases the merged batch and every sub-batch when dropped.
struct Cleanup<'a> {
    registry: &'a BatchRegistry,
    merged: &'a WorkItemBatch,
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        self.merged.dispose();
        self.registry.clear_sub_batches();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::PendingWorkParticipant;
    use crate::error::IrrecoverableFault;
    use crate::testing::{RecordingParticipant, TestTransaction};
    use crate::transaction::{ThreadTransactionProvider, Transaction, TransactionScope};
    use keelson_types::scope::ScopeKey;

    fn coordinator() -> TransactionalCommitCoordinator {
        TransactionalCommitCoordinator::new(
            Uuid::now_v7(),
            Arc::new(BatchRegistry::default()),
            Arc::new(ThreadTransactionProvider),
        )
    }

    fn participant(name: &str) -> (Arc<RecordingParticipant>, Arc<dyn PendingWorkParticipant>) {
        let concrete = RecordingParticipant::new(name);
        let dynamic: Arc<dyn PendingWorkParticipant> = concrete.clone();
        (concrete, dynamic)
    }

    #[test]
    fn commit_without_transaction_is_unavailable() {
        let coordinator = coordinator();
        assert!(matches!(
            coordinator.commit(),
            Err(ExecutionError::TransactionUnavailable)
        ));
        assert!(!coordinator.has_outstanding_commit());
    }

    #[test]
    fn commit_then_complete_delivers_all_scopes() {
        let coordinator = coordinator();
        let registry = Arc::clone(coordinator.registry());
        let (w1, w1_dyn) = participant("w1");
        let s1 = ScopeKey::scope(Uuid::now_v7(), "root.a");

        registry.get_or_create_batch(&s1).add(&w1_dyn, Arc::new(1u8)).unwrap();
        registry.transient_batch().add(&w1_dyn, Arc::new(2u8)).unwrap();

        let txn = TestTransaction::new();
        let _scope = TransactionScope::enter(txn.clone());
        coordinator.commit().unwrap();
        assert!(coordinator.has_outstanding_commit());
        assert_eq!(w1.committed(), vec![vec![1, 2]]);
        assert_eq!(w1.last_transaction(), Some(txn.id()));

        coordinator.complete().unwrap();
        assert_eq!(w1.completed(), vec![(true, vec![1, 2])]);
        assert!(!coordinator.has_outstanding_commit());
        assert!(!registry.has_pending_work());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn complete_without_commit_is_misuse() {
        let coordinator = coordinator();
        assert!(matches!(
            coordinator.complete(),
            Err(ExecutionError::ProtocolMisuse(_))
        ));
    }

    #[test]
    fn complete_cleans_up_after_irrecoverable_failure() {
        let coordinator = coordinator();
        let registry = Arc::clone(coordinator.registry());
        let (w1, w1_dyn) = participant("w1");
        w1.fail_complete(|| IrrecoverableFault("fatal".to_string()).into());
        registry.transient_batch().add(&w1_dyn, Arc::new(1u8)).unwrap();

        let _scope = TransactionScope::enter(TestTransaction::new());
        coordinator.commit().unwrap();

        assert!(matches!(
            coordinator.complete(),
            Err(ExecutionError::Irrecoverable(_))
        ));
        assert!(!coordinator.has_outstanding_commit());
        assert!(!registry.has_pending_work());
    }

    #[test]
    fn handle_fault_keeps_scope_batches() {
        let coordinator = coordinator();
        let registry = Arc::clone(coordinator.registry());
        let (w1, w1_dyn) = participant("w1");
        w1.fail_commit(|| anyhow::anyhow!("deadlock victim"));
        let s1 = ScopeKey::scope(Uuid::now_v7(), "root.a");

        registry.get_or_create_batch(&s1).add(&w1_dyn, Arc::new(1u8)).unwrap();
        registry.transient_batch().add(&w1_dyn, Arc::new(2u8)).unwrap();

        let _scope = TransactionScope::enter(TestTransaction::new());
        let err = coordinator.commit_and_complete().unwrap_err();
        assert!(matches!(err, ExecutionError::ParticipantFailure { .. }));

        assert!(w1.completed().is_empty());
        assert!(!coordinator.has_outstanding_commit());
        assert_eq!(registry.batch(&s1).unwrap().len(), 1);
        assert!(registry.transient_batch().is_empty());
    }

    #[test]
    fn commit_and_complete_happy_path() {
        let coordinator = coordinator();
        let (w1, w1_dyn) = participant("w1");
        coordinator
            .registry()
            .transient_batch()
            .add(&w1_dyn, Arc::new(1u8))
            .unwrap();

        let _scope = TransactionScope::enter(TestTransaction::new());
        coordinator.commit_and_complete().unwrap();
        assert_eq!(w1.completed(), vec![(true, vec![1])]);
    }
}
