//! Ambient transaction provider backed by the thread-scoped context stack.

use std::sync::Arc;

use crate::ambient::{self, ContextGuard};

use super::{AmbientTransactionProvider, Transaction};

struct AmbientTransaction(Arc<dyn Transaction>);

/// Publishes a transaction as ambient for the current thread.
pub struct TransactionScope;

impl TransactionScope {
    /// `transaction` is the ambient transaction until the guard is released.
    pub fn enter(transaction: Arc<dyn Transaction>) -> ContextGuard {
        tracing::trace!(transaction_id = %transaction.id(), "entering transaction scope");
        ambient::push(Arc::new(AmbientTransaction(transaction)))
    }
}

/// Resolves the transaction entered with [`TransactionScope::enter`] on the
/// calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadTransactionProvider;

impl AmbientTransactionProvider for ThreadTransactionProvider {
    fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        ambient::retrieve::<AmbientTransaction>().map(|ambient| Arc::clone(&ambient.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestTransaction;

    #[test]
    fn provider_sees_innermost_transaction() {
        let provider = ThreadTransactionProvider;
        assert!(provider.current_transaction().is_none());

        let outer = TestTransaction::new();
        let inner = TestTransaction::new();

        let outer_guard = TransactionScope::enter(outer.clone());
        assert_eq!(provider.current_transaction().unwrap().id(), outer.id());
        {
            let _inner_guard = TransactionScope::enter(inner.clone());
            assert_eq!(provider.current_transaction().unwrap().id(), inner.id());
        }
        assert_eq!(provider.current_transaction().unwrap().id(), outer.id());
        outer_guard.release().unwrap();

        assert!(provider.current_transaction().is_none());
    }

    #[test]
    fn as_any_recovers_concrete_type() {
        let txn = TestTransaction::new();
        let _guard = TransactionScope::enter(txn.clone());

        let current = ThreadTransactionProvider.current_transaction().unwrap();
        let concrete = current.as_any().downcast_ref::<TestTransaction>().unwrap();
        assert_eq!(concrete.id(), txn.id());
    }
}
