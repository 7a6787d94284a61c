//! Recording fakes shared by the unit tests.

use std::any::Any;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{DateTime, Utc};
use keelson_types::config::TimerConfig;
use keelson_types::scope::ScopeRef;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::{PendingWorkParticipant, WorkItem};
use crate::error::IrrecoverablePolicy;
use crate::instance::{CooperativeScheduler, ExecutionTree, InstanceServices};
use crate::timer::{ExternalTimerService, TimerCallback};
use crate::transaction::{ThreadTransactionProvider, Transaction};

pub(crate) fn order_ids(items: &[WorkItem]) -> Vec<u64> {
    items.iter().map(|item| item.order_id).collect()
}

// ---------------------------------------------------------------------------
// Participants and transactions
// ---------------------------------------------------------------------------

type FailWith = Box<dyn Fn() -> anyhow::Error + Send + Sync>;

/// Participant that records every callback and fails on demand.
pub(crate) struct RecordingParticipant {
    name: String,
    must_commit: AtomicBool,
    must_commit_calls: AtomicUsize,
    committed: Mutex<Vec<Vec<u64>>>,
    completed: Mutex<Vec<(bool, Vec<u64>)>>,
    last_transaction: Mutex<Option<Uuid>>,
    fail_must_commit: Mutex<Option<FailWith>>,
    fail_commit: Mutex<Option<FailWith>>,
    fail_complete: Mutex<Option<FailWith>>,
}

impl RecordingParticipant {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            must_commit: AtomicBool::new(false),
            must_commit_calls: AtomicUsize::new(0),
            committed: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            last_transaction: Mutex::new(None),
            fail_must_commit: Mutex::new(None),
            fail_commit: Mutex::new(None),
            fail_complete: Mutex::new(None),
        })
    }

    pub(crate) fn set_must_commit(&self, value: bool) {
        self.must_commit.store(value, Ordering::SeqCst);
    }

    pub(crate) fn fail_must_commit(&self, error: impl Fn() -> anyhow::Error + Send + Sync + 'static) {
        *self.fail_must_commit.lock().unwrap() = Some(Box::new(error));
    }

    pub(crate) fn fail_commit(&self, error: impl Fn() -> anyhow::Error + Send + Sync + 'static) {
        *self.fail_commit.lock().unwrap() = Some(Box::new(error));
    }

    pub(crate) fn fail_complete(&self, error: impl Fn() -> anyhow::Error + Send + Sync + 'static) {
        *self.fail_complete.lock().unwrap() = Some(Box::new(error));
    }

    pub(crate) fn must_commit_calls(&self) -> usize {
        self.must_commit_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn committed(&self) -> Vec<Vec<u64>> {
        self.committed.lock().unwrap().clone()
    }

    pub(crate) fn completed(&self) -> Vec<(bool, Vec<u64>)> {
        self.completed.lock().unwrap().clone()
    }

    pub(crate) fn last_transaction(&self) -> Option<Uuid> {
        *self.last_transaction.lock().unwrap()
    }

    fn failure(slot: &Mutex<Option<FailWith>>) -> anyhow::Result<()> {
        match slot.lock().unwrap().as_ref() {
            Some(error) => Err(error()),
            None => Ok(()),
        }
    }
}

impl PendingWorkParticipant for RecordingParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    fn must_commit(&self, _items: &[WorkItem]) -> anyhow::Result<bool> {
        self.must_commit_calls.fetch_add(1, Ordering::SeqCst);
        Self::failure(&self.fail_must_commit)?;
        Ok(self.must_commit.load(Ordering::SeqCst))
    }

    fn commit(&self, transaction: &dyn Transaction, items: &[WorkItem]) -> anyhow::Result<()> {
        Self::failure(&self.fail_commit)?;
        *self.last_transaction.lock().unwrap() = Some(transaction.id());
        self.committed.lock().unwrap().push(order_ids(items));
        Ok(())
    }

    fn complete(&self, succeeded: bool, items: &[WorkItem]) -> anyhow::Result<()> {
        Self::failure(&self.fail_complete)?;
        self.completed.lock().unwrap().push((succeeded, order_ids(items)));
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct TestTransaction {
    id: Uuid,
}

impl TestTransaction {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self { id: Uuid::now_v7() })
    }
}

impl Transaction for TestTransaction {
    fn id(&self) -> Uuid {
        self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Timer service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerCall {
    Schedule(Uuid),
    Cancel(Uuid),
}

struct Registration {
    subscription_id: Uuid,
    instance_id: Uuid,
    callback: TimerCallback,
}

/// Timer service that records calls and fires only when told to.
#[derive(Default)]
pub(crate) struct RecordingTimerService {
    calls: Mutex<Vec<TimerCall>>,
    outstanding: Mutex<Vec<Registration>>,
}

impl RecordingTimerService {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn calls(&self) -> Vec<TimerCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Forget the call log; outstanding registrations are kept.
    pub(crate) fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Subscription ids currently registered, in registration order.
    pub(crate) fn outstanding(&self) -> Vec<Uuid> {
        self.outstanding
            .lock()
            .unwrap()
            .iter()
            .map(|registration| registration.subscription_id)
            .collect()
    }

    /// Fire the registration for `subscription_id`, as if it expired.
    pub(crate) fn fire(&self, subscription_id: Uuid) {
        let registration = {
            let mut outstanding = self.outstanding.lock().unwrap();
            let index = outstanding
                .iter()
                .position(|registration| registration.subscription_id == subscription_id)
                .expect("no such registration");
            outstanding.remove(index)
        };
        (registration.callback)(registration.instance_id);
    }
}

impl ExternalTimerService for RecordingTimerService {
    fn schedule_timer(
        &self,
        callback: TimerCallback,
        instance_id: Uuid,
        _expires_at: DateTime<Utc>,
        subscription_id: Uuid,
    ) {
        self.calls.lock().unwrap().push(TimerCall::Schedule(subscription_id));
        self.outstanding.lock().unwrap().push(Registration {
            subscription_id,
            instance_id,
            callback,
        });
    }

    fn cancel_timer(&self, subscription_id: Uuid) {
        self.calls.lock().unwrap().push(TimerCall::Cancel(subscription_id));
        self.outstanding
            .lock()
            .unwrap()
            .retain(|registration| registration.subscription_id != subscription_id);
    }
}

// ---------------------------------------------------------------------------
// Execution tree
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct TestDefinition {
    id: Uuid,
    reject_loads: AtomicBool,
}

impl TestDefinition {
    /// Make every later `TestTree::load` against this definition fail.
    pub(crate) fn reject_loads(&self) {
        self.reject_loads.store(true, Ordering::SeqCst);
    }
}

#[derive(Serialize, Deserialize)]
struct TreeImage {
    scopes: Vec<ScopeRef>,
    counter: i64,
    log: Vec<String>,
}

/// Minimal execution tree: a flat list of scopes plus some mutable state.
pub(crate) struct TestTree {
    definition: Arc<TestDefinition>,
    scopes: Vec<ScopeRef>,
    pub(crate) counter: i64,
    pub(crate) log: Vec<String>,
    pub(crate) fail_save: bool,
}

impl TestTree {
    pub(crate) fn with_scopes(paths: &[&str]) -> Self {
        let definition = Arc::new(TestDefinition {
            id: Uuid::now_v7(),
            reject_loads: AtomicBool::new(false),
        });
        Self {
            definition,
            scopes: paths
                .iter()
                .map(|path| ScopeRef::new(Uuid::now_v7(), *path))
                .collect(),
            counter: 0,
            log: Vec::new(),
            fail_save: false,
        }
    }

    pub(crate) fn scope(&self, path: &str) -> Option<ScopeRef> {
        self.scopes
            .iter()
            .find(|scope| scope.qualified_path == path)
            .cloned()
    }

    pub(crate) fn add_scope(&mut self, path: &str) -> ScopeRef {
        let scope = ScopeRef::new(Uuid::now_v7(), path);
        self.scopes.push(scope.clone());
        scope
    }
}

impl ExecutionTree for TestTree {
    type Definition = TestDefinition;

    fn definition(&self) -> &Arc<TestDefinition> {
        &self.definition
    }

    fn definition_id(&self) -> Uuid {
        self.definition.id
    }

    fn save(&self, writer: &mut dyn Write) -> anyhow::Result<()> {
        if self.fail_save {
            anyhow::bail!("tree holds a non-serializable activity");
        }
        let image = TreeImage {
            scopes: self.scopes.clone(),
            counter: self.counter,
            log: self.log.clone(),
        };
        serde_json::to_writer(writer, &image).context("writing tree image")
    }

    fn load(reader: &mut dyn Read, definition: Arc<TestDefinition>) -> anyhow::Result<Self> {
        if definition.reject_loads.load(Ordering::SeqCst) {
            anyhow::bail!("definition {} no longer loadable", definition.id);
        }
        let image: TreeImage = serde_json::from_reader(reader).context("reading tree image")?;
        Ok(Self {
            definition,
            scopes: image.scopes,
            counter: image.counter,
            log: image.log,
            fail_save: false,
        })
    }

    fn contains_scope(&self, scope: &ScopeRef) -> bool {
        self.scopes.contains(scope)
    }
}

// ---------------------------------------------------------------------------
// Instance services
// ---------------------------------------------------------------------------

/// Services wired to recording fakes, plus handles to inspect them.
pub(crate) fn test_services() -> (
    InstanceServices,
    Arc<RecordingTimerService>,
    Arc<CooperativeScheduler>,
) {
    let timer_service = RecordingTimerService::new();
    let scheduler = Arc::new(CooperativeScheduler::new());
    let services = InstanceServices {
        transactions: Arc::new(ThreadTransactionProvider),
        timer_service: timer_service.clone(),
        timer_callback: Arc::new(|_: Uuid| {}),
        scheduler: scheduler.clone(),
        policy: IrrecoverablePolicy::default(),
        timer_config: TimerConfig::default(),
    };
    (services, timer_service, scheduler)
}
