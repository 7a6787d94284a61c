//! Timer subscription types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request to wake an instance at `expires_at`.
///
/// Identity is `subscription_id`. Several subscriptions may target the same
/// `queue_key` (the workflow queue that receives the wake-up event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSubscription {
    pub subscription_id: Uuid,
    /// Instance that owns the subscription.
    pub instance_id: Uuid,
    /// Name of the instance queue the expiry is delivered to.
    pub queue_key: String,
    pub expires_at: DateTime<Utc>,
}

impl TimerSubscription {
    /// Create a subscription with a fresh UUIDv7 id.
    pub fn new(instance_id: Uuid, queue_key: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            subscription_id: Uuid::now_v7(),
            instance_id,
            queue_key: queue_key.into(),
            expires_at,
        }
    }

    /// Whether the subscription is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let sub = TimerSubscription::new(Uuid::now_v7(), "approval", now);
        assert!(sub.is_due(now));
        assert!(sub.is_due(now + Duration::seconds(1)));
        assert!(!sub.is_due(now - Duration::seconds(1)));
    }

    #[test]
    fn test_new_assigns_distinct_ids() {
        let instance = Uuid::now_v7();
        let now = Utc::now();
        let a = TimerSubscription::new(instance, "q", now);
        let b = TimerSubscription::new(instance, "q", now);
        assert_ne!(a.subscription_id, b.subscription_id);
        assert_eq!(a.queue_key, b.queue_key);
    }
}
