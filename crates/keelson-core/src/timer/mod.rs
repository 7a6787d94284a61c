//! Timer subscriptions and the external timer service that fires them.
//!
//! - `registry` -- `TimerSubscriptionRegistry`, one per instance, keeping
//!   exactly one external registration outstanding for the earliest
//!   subscription

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod registry;

pub use registry::TimerSubscriptionRegistry;

/// Invoked by the timer service when a registration fires. Receives the id of
/// the instance to wake.
pub type TimerCallback = Arc<dyn Fn(Uuid) + Send + Sync>;

/// Host-provided timer facility.
///
/// Both calls are made while the registry's lock is held and must not block.
/// Cancelling an unknown or already-fired registration is a no-op.
pub trait ExternalTimerService: Send + Sync {
    fn schedule_timer(
        &self,
        callback: TimerCallback,
        instance_id: Uuid,
        expires_at: DateTime<Utc>,
        subscription_id: Uuid,
    );

    fn cancel_timer(&self, subscription_id: Uuid);
}
