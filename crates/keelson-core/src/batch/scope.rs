//! Ambient "current batch scope" for the running step.

use std::sync::Arc;

use keelson_types::scope::ScopeKey;

use crate::ambient::{self, ContextGuard};
use crate::error::ExecutionError;

use super::participant::{PendingWorkParticipant, WorkPayload};
use super::registry::BatchRegistry;
use super::work::WorkItemBatch;

/// The registry and scope key that new work on this thread belongs to.
#[derive(Debug)]
pub struct ActiveScope {
    registry: Arc<BatchRegistry>,
    scope: ScopeKey,
}

impl ActiveScope {
    /// Make `scope` of `registry` the current batch scope until the guard is
    /// released.
    pub fn enter(registry: Arc<BatchRegistry>, scope: ScopeKey) -> ContextGuard {
        tracing::trace!(scope = %scope, "entering batch scope");
        ambient::push(Arc::new(ActiveScope { registry, scope }))
    }

    pub fn current() -> Option<Arc<ActiveScope>> {
        ambient::retrieve::<ActiveScope>()
    }

    /// The batch for the current scope, created on demand.
    pub fn current_batch() -> Option<Arc<WorkItemBatch>> {
        Self::current().map(|active| active.batch())
    }

    /// Enlist `payload` in the current scope's batch.
    pub fn enlist(
        submitter: &Arc<dyn PendingWorkParticipant>,
        payload: WorkPayload,
    ) -> Result<u64, ExecutionError> {
        let batch = Self::current_batch()
            .ok_or_else(|| ExecutionError::misuse("no batch scope is active on this thread"))?;
        batch.add(submitter, payload)
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn registry(&self) -> &Arc<BatchRegistry> {
        &self.registry
    }

    pub fn batch(&self) -> Arc<WorkItemBatch> {
        self.registry.get_or_create_batch(&self.scope)
    }
}
