//! A live workflow instance and the collaborators it is wired to.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use keelson_types::config::TimerConfig;
use uuid::Uuid;

use crate::batch::BatchRegistry;
use crate::error::IrrecoverablePolicy;
use crate::timer::{ExternalTimerService, TimerCallback, TimerSubscriptionRegistry};
use crate::transaction::{AmbientTransactionProvider, TransactionalCommitCoordinator};

use super::scheduler::SchedulerControl;
use super::ExecutionTree;

// ---------------------------------------------------------------------------
// InstanceServices
// ---------------------------------------------------------------------------

/// Host collaborators of an instance. A rolled-back instance inherits its
/// predecessor's services unchanged.
#[derive(Clone)]
pub struct InstanceServices {
    pub transactions: Arc<dyn AmbientTransactionProvider>,
    pub timer_service: Arc<dyn ExternalTimerService>,
    pub timer_callback: TimerCallback,
    pub scheduler: Arc<dyn SchedulerControl>,
    pub policy: IrrecoverablePolicy,
    pub timer_config: TimerConfig,
}

impl std::fmt::Debug for InstanceServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceServices")
            .field("policy", &self.policy)
            .field("timer_config", &self.timer_config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ExecutionInstance
// ---------------------------------------------------------------------------

/// One workflow instance: its execution tree plus the pending work and timer
/// state the core manages for it.
pub struct ExecutionInstance<T: ExecutionTree> {
    id: Uuid,
    tree: Mutex<T>,
    registry: Arc<BatchRegistry>,
    coordinator: TransactionalCommitCoordinator,
    timers: Arc<TimerSubscriptionRegistry>,
    /// Saved state of completed nested scopes, by scope id.
    completed_scopes: Mutex<BTreeMap<Uuid, Vec<u8>>>,
    services: InstanceServices,
}

impl<T: ExecutionTree> ExecutionInstance<T> {
    /// A fresh instance with empty batches and live timer delivery.
    pub fn new(id: Uuid, tree: T, services: InstanceServices) -> Self {
        let registry = Arc::new(BatchRegistry::new(services.policy.clone()));
        let timers = Arc::new(TimerSubscriptionRegistry::new(
            id,
            Arc::clone(&services.timer_service),
            Arc::clone(&services.timer_callback),
            &services.timer_config,
        ));
        Self::from_parts(id, tree, registry, timers, BTreeMap::new(), services)
    }

    pub(crate) fn from_parts(
        id: Uuid,
        tree: T,
        registry: Arc<BatchRegistry>,
        timers: Arc<TimerSubscriptionRegistry>,
        completed_scopes: BTreeMap<Uuid, Vec<u8>>,
        services: InstanceServices,
    ) -> Self {
        let coordinator = TransactionalCommitCoordinator::new(
            id,
            Arc::clone(&registry),
            Arc::clone(&services.transactions),
        );
        Self {
            id,
            tree: Mutex::new(tree),
            registry,
            coordinator,
            timers,
            completed_scopes: Mutex::new(completed_scopes),
            services,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn registry(&self) -> &Arc<BatchRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &TransactionalCommitCoordinator {
        &self.coordinator
    }

    pub fn timers(&self) -> &Arc<TimerSubscriptionRegistry> {
        &self.timers
    }

    pub fn scheduler(&self) -> &Arc<dyn SchedulerControl> {
        &self.services.scheduler
    }

    pub fn services(&self) -> &InstanceServices {
        &self.services
    }

    /// Exclusive access to the execution tree.
    pub fn tree(&self) -> MutexGuard<'_, T> {
        self.tree.lock().expect("execution tree lock poisoned")
    }

    pub fn record_completed_scope(&self, scope_id: Uuid, state: Vec<u8>) {
        self.completed_scopes
            .lock()
            .expect("completed scopes lock poisoned")
            .insert(scope_id, state);
    }

    /// Copy of the completed-scope bookkeeping.
    pub fn completed_scopes(&self) -> BTreeMap<Uuid, Vec<u8>> {
        self.completed_scopes
            .lock()
            .expect("completed scopes lock poisoned")
            .clone()
    }
}

impl<T: ExecutionTree> std::fmt::Debug for ExecutionInstance<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionInstance")
            .field("id", &self.id)
            .field("registry", &self.registry)
            .field("timers", &self.timers)
            .finish_non_exhaustive()
    }
}
