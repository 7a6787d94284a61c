//! Per-instance registry of work batches, keyed by scope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use keelson_types::batch::BatchState;
use keelson_types::scope::ScopeKey;

use crate::error::{ExecutionError, IrrecoverablePolicy};

use super::work::WorkItemBatch;

// ---------------------------------------------------------------------------
// OrderSequence
// ---------------------------------------------------------------------------

/// Monotonic source of work item order ids. The first id issued is 1.
///
/// Shared by every batch of a registry, and carried over to the registry that
/// replaces it on rollback, so ids are never reused within an instance.
#[derive(Debug, Default)]
pub struct OrderSequence {
    last: AtomicU64,
}

impl OrderSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently issued id, or 0 if none has been issued.
    pub fn last_issued(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// BatchRegistry
// ---------------------------------------------------------------------------

type Entries = Vec<(ScopeKey, Arc<WorkItemBatch>)>;

/// Scope key -> batch map for one instance.
///
/// Batches are kept in registration order. The transient batch is always
/// present; every operation that removes it puts a fresh one back.
pub struct BatchRegistry {
    sequence: Arc<OrderSequence>,
    policy: IrrecoverablePolicy,
    batches: Mutex<Entries>,
}

impl BatchRegistry {
    pub fn new(policy: IrrecoverablePolicy) -> Self {
        Self::with_sequence(Arc::new(OrderSequence::new()), policy)
    }

    pub fn with_sequence(sequence: Arc<OrderSequence>, policy: IrrecoverablePolicy) -> Self {
        let registry = Self {
            sequence,
            policy,
            batches: Mutex::new(Vec::new()),
        };
        {
            let mut batches = registry.lock();
            registry.ensure_transient(&mut batches);
        }
        registry
    }

    /// Build a registry around batches migrated from another registry.
    ///
    /// Every batch must draw ids from `sequence` and still be open; scope keys
    /// must be distinct. A transient batch is created if none was migrated.
    pub fn adopt(
        sequence: Arc<OrderSequence>,
        migrated: Vec<Arc<WorkItemBatch>>,
        policy: IrrecoverablePolicy,
    ) -> Result<Self, ExecutionError> {
        let mut entries: Entries = Vec::with_capacity(migrated.len() + 1);
        for batch in migrated {
            if !batch.shares_sequence(&sequence) {
                return Err(ExecutionError::misuse(format!(
                    "batch for scope {} belongs to a different order sequence",
                    batch.scope()
                )));
            }
            if batch.state() == BatchState::Completed {
                return Err(ExecutionError::misuse(format!(
                    "cannot adopt completed batch for scope {}",
                    batch.scope()
                )));
            }
            if entries.iter().any(|(key, _)| key == batch.scope()) {
                return Err(ExecutionError::misuse(format!(
                    "duplicate batch for scope {}",
                    batch.scope()
                )));
            }
            entries.push((batch.scope().clone(), batch));
        }

        let registry = Self {
            sequence,
            policy,
            batches: Mutex::new(entries),
        };
        {
            let mut batches = registry.lock();
            registry.ensure_transient(&mut batches);
        }
        Ok(registry)
    }

    pub fn sequence(&self) -> &Arc<OrderSequence> {
        &self.sequence
    }

    pub fn policy(&self) -> &IrrecoverablePolicy {
        &self.policy
    }

    /// The batch for `scope`, created empty on first use.
    pub fn get_or_create_batch(&self, scope: &ScopeKey) -> Arc<WorkItemBatch> {
        let mut batches = self.lock();
        if let Some((_, batch)) = batches.iter().find(|(key, _)| key == scope) {
            return Arc::clone(batch);
        }

        let batch = self.new_batch(scope.clone());
        batches.push((scope.clone(), Arc::clone(&batch)));
        tracing::trace!(scope = %scope, "work batch created");
        batch
    }

    pub fn transient_batch(&self) -> Arc<WorkItemBatch> {
        self.get_or_create_batch(&ScopeKey::Transient)
    }

    /// The batch for `scope`, if one is registered.
    pub fn batch(&self, scope: &ScopeKey) -> Option<Arc<WorkItemBatch>> {
        self.lock()
            .iter()
            .find(|(key, _)| key == scope)
            .map(|(_, batch)| Arc::clone(batch))
    }

    /// Registered batches in registration order.
    pub fn batches(&self) -> Vec<Arc<WorkItemBatch>> {
        self.lock().iter().map(|(_, batch)| Arc::clone(batch)).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A fresh, unregistered batch holding every registered batch's items.
    pub fn merged_batch(&self) -> Result<Arc<WorkItemBatch>, ExecutionError> {
        let merged = self.new_batch(ScopeKey::Transient);
        for batch in self.batches() {
            merged.merge(&batch)?;
        }
        Ok(merged)
    }

    /// Complete `scope`'s batch with `succeeded = false` and drop it.
    ///
    /// A scope without a batch is a no-op.
    pub fn rollback_batch(&self, scope: &ScopeKey) -> Result<(), ExecutionError> {
        let removed = {
            let mut batches = self.lock();
            let position = batches.iter().position(|(key, _)| key == scope);
            let removed = position.map(|index| batches.remove(index).1);
            self.ensure_transient(&mut batches);
            removed
        };

        match removed {
            Some(batch) => {
                tracing::debug!(scope = %scope, items = batch.len(), "rolling back work batch");
                Self::roll_back(&batch)
            }
            None => Ok(()),
        }
    }

    /// Roll back every registered batch, leaving only a fresh transient one.
    ///
    /// Every batch is rolled back even if an earlier one fails; the first
    /// error is returned.
    pub fn rollback_all(&self) -> Result<(), ExecutionError> {
        let removed = self.take_all();
        let mut first_error = None;
        for batch in removed {
            if let Err(e) = Self::roll_back(&batch) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Dispose every batch without completion; keep a fresh transient one.
    pub fn clear_sub_batches(&self) {
        for batch in self.take_all() {
            batch.dispose();
        }
    }

    /// Dispose the transient batch and replace it with an empty one.
    pub fn discard_transient(&self) {
        let discarded = {
            let mut batches = self.lock();
            let position = batches.iter().position(|(key, _)| key.is_transient());
            let discarded = position.map(|index| batches.remove(index).1);
            self.ensure_transient(&mut batches);
            discarded
        };
        if let Some(batch) = discarded {
            tracing::debug!(items = batch.len(), "transient work batch discarded");
            batch.dispose();
        }
    }

    /// Unregister `migrated` without completing or disposing them; their new
    /// owner is the registry that adopted them. Other batches stay, and a
    /// fresh transient batch replaces a migrated one.
    pub(crate) fn detach(&self, migrated: &[Arc<WorkItemBatch>]) {
        let mut batches = self.lock();
        batches.retain(|(_, batch)| !migrated.iter().any(|moved| Arc::ptr_eq(moved, batch)));
        self.ensure_transient(&mut batches);
    }

    /// Whether any registered batch needs a transaction commit.
    pub fn is_dirty(&self) -> Result<bool, ExecutionError> {
        for batch in self.batches() {
            if batch.is_dirty()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether any registered batch holds at least one item.
    pub fn has_pending_work(&self) -> bool {
        self.batches().iter().any(|batch| !batch.is_empty())
    }

    fn roll_back(batch: &WorkItemBatch) -> Result<(), ExecutionError> {
        let result = batch.complete(false);
        batch.dispose();
        result
    }

    fn take_all(&self) -> Vec<Arc<WorkItemBatch>> {
        let mut batches = self.lock();
        let removed = batches.drain(..).map(|(_, batch)| batch).collect();
        self.ensure_transient(&mut batches);
        removed
    }

    fn ensure_transient(&self, batches: &mut Entries) {
        if !batches.iter().any(|(key, _)| key.is_transient()) {
            batches.push((ScopeKey::Transient, self.new_batch(ScopeKey::Transient)));
        }
    }

    fn new_batch(&self, scope: ScopeKey) -> Arc<WorkItemBatch> {
        Arc::new(WorkItemBatch::new(
            scope,
            Arc::clone(&self.sequence),
            self.policy.clone(),
        ))
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.batches.lock().expect("batch registry lock poisoned")
    }
}

impl Default for BatchRegistry {
    fn default() -> Self {
        Self::new(IrrecoverablePolicy::default())
    }
}

impl std::fmt::Debug for BatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scopes: Vec<String> = self.lock().iter().map(|(key, _)| key.to_string()).collect();
        f.debug_struct("BatchRegistry")
            .field("scopes", &scopes)
            .field("last_order_id", &self.sequence.last_issued())
            .finish()
    }
}
