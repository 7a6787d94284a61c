//! Participants that own pending work and know how to commit it.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::transaction::Transaction;

/// Opaque payload of a work item. Participants downcast to their own type.
pub type WorkPayload = Arc<dyn Any + Send + Sync>;

/// One unit of pending work, tagged with its registry-wide order id.
#[derive(Clone)]
pub struct WorkItem {
    pub order_id: u64,
    pub payload: WorkPayload,
}

impl WorkItem {
    /// Borrow the payload as `T`, if it is one.
    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("order_id", &self.order_id)
            .finish_non_exhaustive()
    }
}

/// A collaborator that enlists side-effecting work in a batch.
///
/// Every method receives the participant's own items only, sorted by order
/// id. Implementations are shared across threads and must not call back into
/// the batch they are being driven by.
pub trait PendingWorkParticipant: Send + Sync {
    /// Name used in logs and error messages.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Whether these items require a transaction commit.
    fn must_commit(&self, items: &[WorkItem]) -> anyhow::Result<bool>;

    /// Apply the items inside `transaction`.
    fn commit(&self, transaction: &dyn Transaction, items: &[WorkItem]) -> anyhow::Result<()>;

    /// Told whether the enclosing transaction committed.
    fn complete(&self, succeeded: bool, items: &[WorkItem]) -> anyhow::Result<()>;
}

/// Identity comparison for participants (same allocation).
pub(crate) fn same_participant(
    a: &Arc<dyn PendingWorkParticipant>,
    b: &Arc<dyn PendingWorkParticipant>,
) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_as_downcasts() {
        let item = WorkItem {
            order_id: 3,
            payload: Arc::new(String::from("row-17")),
        };
        assert_eq!(item.payload_as::<String>().map(String::as_str), Some("row-17"));
        assert!(item.payload_as::<u32>().is_none());
    }

    #[test]
    fn identity_is_by_allocation() {
        use crate::testing::RecordingParticipant;

        let a: Arc<dyn PendingWorkParticipant> = RecordingParticipant::new("a");
        let a2 = Arc::clone(&a);
        let b: Arc<dyn PendingWorkParticipant> = RecordingParticipant::new("a");

        assert!(same_participant(&a, &a2));
        assert!(!same_participant(&a, &b));
    }
}
