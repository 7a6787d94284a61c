//! Tokio-backed external timer service.
//!
//! Every registration is one spawned task that sleeps until the expiry and
//! then invokes the callback, unless its cancellation token fires first.
//! Scheduling and cancelling never block the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keelson_core::timer::{ExternalTimerService, TimerCallback};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TimerServiceError {
    /// No tokio runtime is available on the calling thread.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

// ---------------------------------------------------------------------------
// TokioTimerService
// ---------------------------------------------------------------------------

struct Registration {
    generation: u64,
    token: CancellationToken,
}

/// Timer service running on a tokio runtime.
pub struct TokioTimerService {
    handle: Handle,
    timers: Arc<DashMap<Uuid, Registration>>,
    generation: AtomicU64,
}

impl TokioTimerService {
    /// Spawn timer tasks on the runtime behind `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            timers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Use the runtime the caller is running on.
    pub fn current() -> Result<Self, TimerServiceError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| TimerServiceError::NoRuntime(e.to_string()))
    }

    /// Number of registrations that have neither fired nor been cancelled.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Cancel every outstanding registration.
    pub fn cancel_all(&self) {
        self.timers.retain(|_, registration| {
            registration.token.cancel();
            false
        });
    }
}

impl ExternalTimerService for TokioTimerService {
    fn schedule_timer(
        &self,
        callback: TimerCallback,
        instance_id: Uuid,
        expires_at: DateTime<Utc>,
        subscription_id: Uuid,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let replaced = self.timers.insert(
            subscription_id,
            Registration {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = replaced {
            previous.token.cancel();
        }

        // Past expiries fire on the next tick.
        let delay = (expires_at - Utc::now()).to_std().unwrap_or_default();
        let timers = Arc::clone(&self.timers);

        self.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::trace!(subscription_id = %subscription_id, "timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    // A newer registration for the same id owns the entry.
                    if timers
                        .remove_if(&subscription_id, |_, registration| registration.generation == generation)
                        .is_none()
                    {
                        return;
                    }
                    tracing::debug!(
                        instance_id = %instance_id,
                        subscription_id = %subscription_id,
                        "timer fired"
                    );
                    callback(instance_id);
                }
            }
        });
    }

    fn cancel_timer(&self, subscription_id: Uuid) {
        if let Some((_, registration)) = self.timers.remove(&subscription_id) {
            registration.token.cancel();
        }
    }
}

impl Drop for TokioTimerService {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl std::fmt::Debug for TokioTimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioTimerService")
            .field("pending", &self.timers.len())
            .finish()
    }
}
