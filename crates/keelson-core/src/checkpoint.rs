//! In-memory checkpoint and rollback of a workflow instance.
//!
//! A checkpoint captures the serialized execution tree, the definition it
//! runs, completed-scope bookkeeping and pending timers. Rolling back builds a
//! brand-new instance from that image, carries the live pending work over to
//! it, and swaps it into the instance table. The swap is the only externally
//! visible step: every failure before it leaves the old instance in place.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use keelson_types::config::CheckpointConfig;
use keelson_types::scope::{ScopeKey, ScopeRef};
use keelson_types::timer::TimerSubscription;
use serde::Serialize;
use uuid::Uuid;

use crate::batch::{BatchRegistry, WorkItemBatch};
use crate::error::ExecutionError;
use crate::instance::{ExecutionInstance, ExecutionTree, InstanceTable};
use crate::timer::TimerSubscriptionRegistry;

/// Replays work at the resume point of a freshly loaded tree. Receives the
/// tree, the resume scope and the argument given to `request_rollback`.
pub type RollbackCallback<T> =
    Box<dyn FnOnce(&mut T, &ScopeRef, serde_json::Value) -> anyhow::Result<()> + Send>;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

struct CheckpointSnapshot<D> {
    image: Vec<u8>,
    definition: Arc<D>,
    definition_id: Uuid,
    completed_scopes: BTreeMap<Uuid, Vec<u8>>,
    timers: Vec<TimerSubscription>,
    taken_at: DateTime<Utc>,
}

/// Summary of the outstanding checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub definition_id: Uuid,
    pub size_bytes: usize,
    pub pending_timers: usize,
    pub completed_scopes: usize,
    pub taken_at: DateTime<Utc>,
}

impl<D> CheckpointSnapshot<D> {
    fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            definition_id: self.definition_id,
            size_bytes: self.image.len(),
            pending_timers: self.timers.len(),
            completed_scopes: self.completed_scopes.len(),
            taken_at: self.taken_at,
        }
    }
}

struct RollbackRequest<T> {
    resume: ScopeRef,
    callback: RollbackCallback<T>,
    argument: serde_json::Value,
    suspend_after: bool,
    suspend_reason: Option<String>,
}

struct ControllerState<T: ExecutionTree> {
    checkpoint: Option<Arc<CheckpointSnapshot<T::Definition>>>,
    request: Option<RollbackRequest<T>>,
}

// ---------------------------------------------------------------------------
// CheckpointRollbackController
// ---------------------------------------------------------------------------

/// Checkpoint/rollback for one instance id.
///
/// The controller resolves the instance through the table on every call, so
/// it keeps working for the instance that replaces the original after a
/// rollback.
pub struct CheckpointRollbackController<T: ExecutionTree> {
    instance_id: Uuid,
    table: Arc<dyn InstanceTable<T>>,
    max_snapshot_bytes: usize,
    state: Mutex<ControllerState<T>>,
}

impl<T: ExecutionTree> CheckpointRollbackController<T> {
    pub fn new(instance_id: Uuid, table: Arc<dyn InstanceTable<T>>, config: &CheckpointConfig) -> Self {
        Self {
            instance_id,
            table,
            max_snapshot_bytes: config.max_snapshot_bytes,
            state: Mutex::new(ControllerState {
                checkpoint: None,
                request: None,
            }),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Snapshot the instance's execution state, superseding any earlier
    /// checkpoint.
    ///
    /// Must be taken at a quiescent point: a commit awaiting completion is
    /// rejected as misuse.
    pub fn checkpoint(&self) -> Result<SnapshotInfo, ExecutionError> {
        let instance = self.instance()?;
        if instance.coordinator().has_outstanding_commit() {
            return Err(ExecutionError::misuse(format!(
                "cannot checkpoint instance {} while a commit is outstanding",
                self.instance_id
            )));
        }

        let (image, definition, definition_id) = {
            let tree = instance.tree();
            let mut image = Vec::new();
            tree.save(&mut image)
                .map_err(|e| ExecutionError::Serialization(format!("{e:#}")))?;
            (image, Arc::clone(tree.definition()), tree.definition_id())
        };

        if image.len() > self.max_snapshot_bytes {
            return Err(ExecutionError::SnapshotTooLarge {
                size: image.len(),
                max: self.max_snapshot_bytes,
            });
        }

        let snapshot = CheckpointSnapshot {
            image,
            definition,
            definition_id,
            completed_scopes: instance.completed_scopes(),
            timers: instance.timers().subscriptions(),
            taken_at: Utc::now(),
        };
        let info = snapshot.info();

        let superseded = self.lock().checkpoint.replace(Arc::new(snapshot)).is_some();
        tracing::info!(
            instance_id = %self.instance_id,
            size_bytes = info.size_bytes,
            pending_timers = info.pending_timers,
            superseded,
            "checkpoint taken"
        );
        Ok(info)
    }

    pub fn has_checkpoint(&self) -> bool {
        self.lock().checkpoint.is_some()
    }

    pub fn snapshot_info(&self) -> Option<SnapshotInfo> {
        self.lock().checkpoint.as_ref().map(|snapshot| snapshot.info())
    }

    /// Drop the checkpoint and any pending rollback request.
    pub fn dispose_checkpoint(&self) {
        let mut state = self.lock();
        state.checkpoint = None;
        state.request = None;
    }

    /// Record a rollback to `resume` and ask the instance's scheduler to stop.
    ///
    /// The rollback itself happens in [`perform_rollback`] once the host's
    /// run loop has yielded. A later request replaces an earlier one.
    ///
    /// [`perform_rollback`]: Self::perform_rollback
    pub fn request_rollback(
        &self,
        resume: ScopeRef,
        callback: RollbackCallback<T>,
        argument: serde_json::Value,
        suspend_after: bool,
        suspend_reason: Option<String>,
    ) -> Result<(), ExecutionError> {
        let instance = self.instance()?;
        {
            let mut state = self.lock();
            if state.checkpoint.is_none() {
                return Err(ExecutionError::misuse(format!(
                    "rollback requested for instance {} without a checkpoint",
                    self.instance_id
                )));
            }
            tracing::info!(
                instance_id = %self.instance_id,
                resume = %resume,
                suspend_after,
                "rollback requested"
            );
            state.request = Some(RollbackRequest {
                resume,
                callback,
                argument,
                suspend_after,
                suspend_reason,
            });
        }

        instance.scheduler().stop();
        Ok(())
    }

    pub fn is_rollback_requested(&self) -> bool {
        self.lock().request.is_some()
    }

    /// Carry out the requested rollback and return the installed instance.
    ///
    /// On failure the table still holds the old instance, the request is
    /// consumed and the checkpoint is kept.
    pub fn perform_rollback(&self) -> Result<Arc<ExecutionInstance<T>>, ExecutionError> {
        let (snapshot, request) = {
            let mut state = self.lock();
            let snapshot = state.checkpoint.clone().ok_or_else(|| {
                ExecutionError::misuse(format!(
                    "rollback of instance {} without a checkpoint",
                    self.instance_id
                ))
            })?;
            let request = state.request.take().ok_or_else(|| {
                ExecutionError::misuse(format!(
                    "no rollback requested for instance {}",
                    self.instance_id
                ))
            })?;
            (snapshot, request)
        };

        let old = self.instance()?;
        let suspend_after = request.suspend_after;
        let suspend_reason = request.suspend_reason.clone();

        let (new, migrated) = match self.rebuild(&old, &snapshot, request) {
            Ok((new, migrated)) => (Arc::new(new), migrated),
            Err(e) => {
                tracing::error!(instance_id = %self.instance_id, error = %e, "rollback aborted");
                return Err(e);
            }
        };

        self.table.replace_instance(self.instance_id, &old, Arc::clone(&new))?;

        // The retired instance must not reach pending work it handed over.
        old.registry().detach(&migrated);

        old.timers().suspend_delivery();
        new.timers().resume_delivery();
        if suspend_after {
            new.scheduler()
                .suspend(suspend_reason.as_deref().unwrap_or("suspended after rollback"));
        } else {
            new.scheduler().resume();
        }

        self.lock().checkpoint = None;
        tracing::info!(
            instance_id = %self.instance_id,
            checkpoint_taken_at = %snapshot.taken_at,
            suspended = suspend_after,
            "instance rolled back"
        );
        Ok(new)
    }

    /// Build the replacement instance and return it with the batches it took
    /// over from `old`. Nothing here is visible outside the returned value;
    /// `old` keeps its batches until the caller detaches them.
    fn rebuild(
        &self,
        old: &ExecutionInstance<T>,
        snapshot: &CheckpointSnapshot<T::Definition>,
        request: RollbackRequest<T>,
    ) -> Result<(ExecutionInstance<T>, Vec<Arc<WorkItemBatch>>), ExecutionError> {
        let mut reader: &[u8] = &snapshot.image;
        let mut tree = T::load(&mut reader, Arc::clone(&snapshot.definition)).map_err(|e| {
            ExecutionError::RollbackFailure(format!("failed to load checkpoint image: {e:#}"))
        })?;

        if !tree.contains_scope(&request.resume) {
            return Err(ExecutionError::RollbackFailure(format!(
                "resume scope {} not found in checkpoint",
                request.resume
            )));
        }
        (request.callback)(&mut tree, &request.resume, request.argument).map_err(|e| {
            ExecutionError::RollbackFailure(format!(
                "rollback callback failed at {}: {e:#}",
                request.resume
            ))
        })?;

        let batches = old.registry().batches();
        for batch in &batches {
            if let ScopeKey::Scope(scope) = batch.scope() {
                if !tree.contains_scope(scope) {
                    return Err(ExecutionError::RollbackFailure(format!(
                        "pending work scope {scope} not found in checkpoint"
                    )));
                }
            }
        }
        let services = old.services().clone();
        let registry = BatchRegistry::adopt(
            Arc::clone(old.registry().sequence()),
            batches.clone(),
            services.policy.clone(),
        )
        .map_err(|e| ExecutionError::RollbackFailure(e.to_string()))?;

        let timers = TimerSubscriptionRegistry::with_subscriptions(
            self.instance_id,
            Arc::clone(&services.timer_service),
            Arc::clone(&services.timer_callback),
            &services.timer_config,
            snapshot.timers.clone(),
        )
        .map_err(|e| ExecutionError::RollbackFailure(e.to_string()))?;

        let instance = ExecutionInstance::from_parts(
            self.instance_id,
            tree,
            Arc::new(registry),
            Arc::new(timers),
            snapshot.completed_scopes.clone(),
            services,
        );
        Ok((instance, batches))
    }

    fn instance(&self) -> Result<Arc<ExecutionInstance<T>>, ExecutionError> {
        self.table
            .get(self.instance_id)
            .ok_or(ExecutionError::InstanceNotFound(self.instance_id))
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState<T>> {
        self.state.lock().expect("checkpoint controller lock poisoned")
    }
}

impl<T: ExecutionTree> std::fmt::Debug for CheckpointRollbackController<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointRollbackController")
            .field("instance_id", &self.instance_id)
            .field("checkpoint", &self.snapshot_info())
            .field("rollback_requested", &self.is_rollback_requested())
            .finish()
    }
}
