//! Per-instance timer subscription registry.
//!
//! Subscriptions live in a [`KeyedPriorityQueue`] ordered by expiry. A
//! head-changed listener keeps the external timer service in step with the
//! queue: whenever the earliest subscription changes it cancels the
//! outstanding registration and registers the new earliest one. While
//! delivery is suspended the listener makes no external calls, and the queue
//! keeps every subscription.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeDelta, Utc};
use keelson_types::config::TimerConfig;
use keelson_types::timer::TimerSubscription;
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::queue::KeyedPriorityQueue;

use super::{ExternalTimerService, TimerCallback};

type SubscriptionQueue = KeyedPriorityQueue<Uuid, TimerSubscription, DateTime<Utc>>;

/// Link between the queue and the external timer service.
struct TimerBinding {
    service: Arc<dyn ExternalTimerService>,
    callback: TimerCallback,
    instance_id: Uuid,
    /// Subscription id of the outstanding external registration.
    registered: Mutex<Option<Uuid>>,
    delivering: AtomicBool,
}

impl TimerBinding {
    /// Replace the outstanding registration with one for `head`.
    fn reconcile(&self, head: Option<&TimerSubscription>) {
        if !self.delivering.load(Ordering::SeqCst) {
            return;
        }

        let mut registered = self.registered();
        if let Some(subscription_id) = registered.take() {
            tracing::trace!(instance_id = %self.instance_id, subscription_id = %subscription_id, "cancelling timer");
            self.service.cancel_timer(subscription_id);
        }
        if let Some(head) = head {
            tracing::trace!(
                instance_id = %self.instance_id,
                subscription_id = %head.subscription_id,
                expires_at = %head.expires_at,
                "scheduling timer"
            );
            self.service.schedule_timer(
                Arc::clone(&self.callback),
                self.instance_id,
                head.expires_at,
                head.subscription_id,
            );
            *registered = Some(head.subscription_id);
        }
    }

    fn cancel_outstanding(&self) {
        if let Some(subscription_id) = self.registered().take() {
            self.service.cancel_timer(subscription_id);
        }
    }

    fn registered(&self) -> MutexGuard<'_, Option<Uuid>> {
        self.registered.lock().expect("timer binding lock poisoned")
    }
}

// ---------------------------------------------------------------------------
// TimerSubscriptionRegistry
// ---------------------------------------------------------------------------

/// Timer subscriptions of one instance.
pub struct TimerSubscriptionRegistry {
    instance_id: Uuid,
    binding: Arc<TimerBinding>,
    tolerance: TimeDelta,
    queue: Mutex<SubscriptionQueue>,
}

impl TimerSubscriptionRegistry {
    /// A registry that talks to `service` immediately.
    pub fn new(
        instance_id: Uuid,
        service: Arc<dyn ExternalTimerService>,
        callback: TimerCallback,
        config: &TimerConfig,
    ) -> Self {
        Self::build(instance_id, service, callback, config, true)
    }

    /// A registry that makes no external calls until [`resume_delivery`].
    ///
    /// Fill it first and then resume to have only the earliest subscription
    /// ever registered with the service. A registry built with [`new`] instead
    /// registers each new head as it is enqueued.
    ///
    /// [`resume_delivery`]: Self::resume_delivery
    /// [`new`]: Self::new
    pub fn new_suspended(
        instance_id: Uuid,
        service: Arc<dyn ExternalTimerService>,
        callback: TimerCallback,
        config: &TimerConfig,
    ) -> Self {
        Self::build(instance_id, service, callback, config, false)
    }

    /// A suspended registry pre-filled with `subscriptions` (instance load or
    /// rollback).
    pub fn with_subscriptions(
        instance_id: Uuid,
        service: Arc<dyn ExternalTimerService>,
        callback: TimerCallback,
        config: &TimerConfig,
        subscriptions: Vec<TimerSubscription>,
    ) -> Result<Self, ExecutionError> {
        let registry = Self::new_suspended(instance_id, service, callback, config);
        for subscription in subscriptions {
            registry.enqueue(subscription)?;
        }
        Ok(registry)
    }

    fn build(
        instance_id: Uuid,
        service: Arc<dyn ExternalTimerService>,
        callback: TimerCallback,
        config: &TimerConfig,
        delivering: bool,
    ) -> Self {
        let binding = Arc::new(TimerBinding {
            service,
            callback,
            instance_id,
            registered: Mutex::new(None),
            delivering: AtomicBool::new(delivering),
        });

        let mut queue = SubscriptionQueue::new();
        let listener = Arc::clone(&binding);
        queue.on_head_changed(move |change| listener.reconcile(change.current));

        Self {
            instance_id,
            binding,
            tolerance: TimeDelta::milliseconds(
                i64::try_from(config.delivery_tolerance_ms).unwrap_or(i64::MAX),
            ),
            queue: Mutex::new(queue),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Add a subscription. Its id must be new to this registry and it must
    /// belong to this registry's instance.
    pub fn enqueue(&self, subscription: TimerSubscription) -> Result<(), ExecutionError> {
        if subscription.instance_id != self.instance_id {
            return Err(ExecutionError::misuse(format!(
                "subscription {} belongs to instance {}, not {}",
                subscription.subscription_id, subscription.instance_id, self.instance_id
            )));
        }

        let mut queue = self.lock();
        if queue.contains_key(&subscription.subscription_id) {
            return Err(ExecutionError::misuse(format!(
                "subscription {} is already registered",
                subscription.subscription_id
            )));
        }

        tracing::debug!(
            instance_id = %self.instance_id,
            subscription_id = %subscription.subscription_id,
            expires_at = %subscription.expires_at,
            "timer subscription added"
        );
        let (key, priority) = (subscription.subscription_id, subscription.expires_at);
        queue.enqueue(key, subscription, priority);
        Ok(())
    }

    /// Remove and return the earliest subscription.
    pub fn dequeue(&self) -> Option<TimerSubscription> {
        self.lock().dequeue()
    }

    pub fn remove(&self, subscription_id: Uuid) -> Option<TimerSubscription> {
        let removed = self.lock().remove(&subscription_id);
        if removed.is_some() {
            tracing::debug!(
                instance_id = %self.instance_id,
                subscription_id = %subscription_id,
                "timer subscription removed"
            );
        }
        removed
    }

    pub fn peek(&self) -> Option<TimerSubscription> {
        self.lock().peek().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Every subscription, earliest first.
    pub fn subscriptions(&self) -> Vec<TimerSubscription> {
        let mut all: Vec<TimerSubscription> = self.lock().values().cloned().collect();
        all.sort_by_key(|subscription| subscription.expires_at);
        all
    }

    /// Dequeue every subscription due at `now` plus the delivery tolerance,
    /// earliest first. A tolerance reaching past the last representable
    /// instant makes every subscription due.
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<TimerSubscription> {
        let cutoff = now
            .checked_add_signed(self.tolerance)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut queue = self.lock();
        let mut expired = Vec::new();
        while queue.peek().is_some_and(|head| head.is_due(cutoff)) {
            if let Some(subscription) = queue.dequeue() {
                expired.push(subscription);
            }
        }
        if !expired.is_empty() {
            tracing::debug!(
                instance_id = %self.instance_id,
                count = expired.len(),
                "expired timer subscriptions taken"
            );
        }
        expired
    }

    /// Stop talking to the timer service and cancel the outstanding
    /// registration. Subscriptions are kept.
    pub fn suspend_delivery(&self) {
        let _queue = self.lock();
        self.binding.delivering.store(false, Ordering::SeqCst);
        self.binding.cancel_outstanding();
        tracing::debug!(instance_id = %self.instance_id, "timer delivery suspended");
    }

    /// Register the earliest subscription with the timer service again.
    pub fn resume_delivery(&self) {
        let queue = self.lock();
        self.binding.delivering.store(true, Ordering::SeqCst);
        self.binding.reconcile(queue.peek());
        tracing::debug!(
            instance_id = %self.instance_id,
            pending = queue.len(),
            "timer delivery resumed"
        );
    }

    pub fn is_delivering(&self) -> bool {
        self.binding.delivering.load(Ordering::SeqCst)
    }

    /// Subscription id of the outstanding external registration, if any.
    pub fn outstanding_registration(&self) -> Option<Uuid> {
        *self.binding.registered()
    }

    fn lock(&self) -> MutexGuard<'_, SubscriptionQueue> {
        self.queue.lock().expect("timer registry lock poisoned")
    }
}

impl std::fmt::Debug for TimerSubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerSubscriptionRegistry")
            .field("instance_id", &self.instance_id)
            .field("pending", &self.len())
            .field("delivering", &self.is_delivering())
            .finish()
    }
}
