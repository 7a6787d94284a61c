//! A single scope's pending work, grouped by submitter.
//!
//! Items are keyed by their registry-wide order id, so merging batches from
//! several scopes yields per-submitter sequences in global enlistment order.
//! Participant callbacks run against a snapshot taken under the lock; the
//! lock is never held while a participant executes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use keelson_types::batch::BatchState;
use keelson_types::scope::ScopeKey;

use crate::error::{ExecutionError, IrrecoverablePolicy};
use crate::transaction::Transaction;

use super::participant::{same_participant, PendingWorkParticipant, WorkItem, WorkPayload};
use super::registry::OrderSequence;

struct SubmitterEntry {
    participant: Arc<dyn PendingWorkParticipant>,
    items: BTreeMap<u64, WorkPayload>,
}

impl SubmitterEntry {
    fn work_items(&self) -> Vec<WorkItem> {
        self.items
            .iter()
            .map(|(order_id, payload)| WorkItem {
                order_id: *order_id,
                payload: Arc::clone(payload),
            })
            .collect()
    }
}

struct BatchInner {
    state: BatchState,
    /// Submitters in first-enlistment order.
    entries: Vec<SubmitterEntry>,
}

impl BatchInner {
    fn entry_mut(&mut self, participant: &Arc<dyn PendingWorkParticipant>) -> &mut SubmitterEntry {
        let position = self
            .entries
            .iter()
            .position(|entry| same_participant(&entry.participant, participant));
        let index = match position {
            Some(index) => index,
            None => {
                self.entries.push(SubmitterEntry {
                    participant: Arc::clone(participant),
                    items: BTreeMap::new(),
                });
                self.entries.len() - 1
            }
        };
        &mut self.entries[index]
    }
}

type Snapshot = Vec<(Arc<dyn PendingWorkParticipant>, Vec<WorkItem>)>;

// ---------------------------------------------------------------------------
// WorkItemBatch
// ---------------------------------------------------------------------------

/// Ordered pending work of one scope.
pub struct WorkItemBatch {
    scope: ScopeKey,
    sequence: Arc<OrderSequence>,
    policy: IrrecoverablePolicy,
    inner: Mutex<BatchInner>,
}

impl WorkItemBatch {
    pub(crate) fn new(scope: ScopeKey, sequence: Arc<OrderSequence>, policy: IrrecoverablePolicy) -> Self {
        Self {
            scope,
            sequence,
            policy,
            inner: Mutex::new(BatchInner {
                state: BatchState::Usable,
                entries: Vec::new(),
            }),
        }
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn state(&self) -> BatchState {
        self.lock().state
    }

    /// Total number of items across all submitters.
    pub fn len(&self) -> usize {
        self.lock().entries.iter().map(|entry| entry.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn submitter_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub(crate) fn shares_sequence(&self, sequence: &Arc<OrderSequence>) -> bool {
        Arc::ptr_eq(&self.sequence, sequence)
    }

    /// Enlist `payload` for `submitter`. Returns the assigned order id.
    pub fn add(
        &self,
        submitter: &Arc<dyn PendingWorkParticipant>,
        payload: WorkPayload,
    ) -> Result<u64, ExecutionError> {
        let mut inner = self.lock();
        if inner.state != BatchState::Usable {
            return Err(ExecutionError::misuse(format!(
                "cannot add work to {} batch for scope {}",
                inner.state, self.scope
            )));
        }

        let order_id = self.sequence.next_id();
        inner.entry_mut(submitter).items.insert(order_id, payload);

        tracing::trace!(
            scope = %self.scope,
            participant = submitter.name(),
            order_id,
            "work item enlisted"
        );
        Ok(order_id)
    }

    /// Items enlisted by `submitter`, ascending by order id.
    pub fn items_for(&self, submitter: &Arc<dyn PendingWorkParticipant>) -> Vec<WorkItem> {
        self.lock()
            .entries
            .iter()
            .find(|entry| same_participant(&entry.participant, submitter))
            .map(SubmitterEntry::work_items)
            .unwrap_or_default()
    }

    /// Whether any submitter needs a transaction commit for its items.
    ///
    /// A submitter that errors counts as "no"; irrecoverable errors propagate.
    pub fn is_dirty(&self) -> Result<bool, ExecutionError> {
        for (participant, items) in self.snapshot() {
            match participant.must_commit(&items) {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) if self.policy.is_irrecoverable(&e) => {
                    return Err(ExecutionError::Irrecoverable(e));
                }
                Err(e) => {
                    tracing::warn!(
                        scope = %self.scope,
                        participant = participant.name(),
                        error = %e,
                        "must_commit failed, treating as clean"
                    );
                }
            }
        }
        Ok(false)
    }

    /// Deliver every submitter's items to its commit operation.
    pub fn commit(&self, transaction: &dyn Transaction) -> Result<(), ExecutionError> {
        if self.state() == BatchState::Completed {
            return Err(ExecutionError::misuse(format!(
                "cannot commit completed batch for scope {}",
                self.scope
            )));
        }

        for (participant, items) in self.snapshot() {
            participant.commit(transaction, &items).map_err(|e| {
                if self.policy.is_irrecoverable(&e) {
                    ExecutionError::Irrecoverable(e)
                } else {
                    ExecutionError::ParticipantFailure {
                        participant: participant.name().to_string(),
                        message: format!("{e:#}"),
                    }
                }
            })?;
        }

        tracing::debug!(
            scope = %self.scope,
            transaction_id = %transaction.id(),
            "batch committed"
        );
        Ok(())
    }

    /// Tell every submitter whether the transaction succeeded, then release
    /// the batch's storage.
    ///
    /// Ordinary participant errors are logged and skipped so later
    /// participants still hear the outcome; irrecoverable ones propagate.
    pub fn complete(&self, succeeded: bool) -> Result<(), ExecutionError> {
        if self.state() == BatchState::Completed {
            return Err(ExecutionError::misuse(format!(
                "batch for scope {} already completed",
                self.scope
            )));
        }

        for (participant, items) in self.snapshot() {
            if let Err(e) = participant.complete(succeeded, &items) {
                if self.policy.is_irrecoverable(&e) {
                    return Err(ExecutionError::Irrecoverable(e));
                }
                tracing::warn!(
                    scope = %self.scope,
                    participant = participant.name(),
                    succeeded,
                    error = %e,
                    "participant completion failed"
                );
            }
        }

        self.dispose();
        tracing::debug!(scope = %self.scope, succeeded, "batch completed");
        Ok(())
    }

    /// Fold every item of `other` into this batch, keeping order ids.
    ///
    /// This batch becomes `Merged` and accepts no further `add`s.
    pub fn merge(&self, other: &WorkItemBatch) -> Result<(), ExecutionError> {
        if std::ptr::eq(self, other) {
            return Err(ExecutionError::misuse("cannot merge a batch into itself"));
        }

        let incoming = other.snapshot();
        let mut inner = self.lock();
        if !inner.state.can_transition_to(BatchState::Merged) {
            return Err(ExecutionError::misuse(format!(
                "cannot merge into {} batch for scope {}",
                inner.state, self.scope
            )));
        }

        for (participant, items) in incoming {
            let entry = inner.entry_mut(&participant);
            for item in items {
                entry.items.insert(item.order_id, item.payload);
            }
        }
        inner.state = BatchState::Merged;
        Ok(())
    }

    /// Release the batch's storage without delivering completion.
    pub fn dispose(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.state = BatchState::Completed;
    }

    fn snapshot(&self) -> Snapshot {
        self.lock()
            .entries
            .iter()
            .map(|entry| (Arc::clone(&entry.participant), entry.work_items()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, BatchInner> {
        self.inner.lock().expect("work batch lock poisoned")
    }
}

impl std::fmt::Debug for WorkItemBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("WorkItemBatch")
            .field("scope", &self.scope)
            .field("state", &inner.state)
            .field("submitters", &inner.entries.len())
            .finish()
    }
}
