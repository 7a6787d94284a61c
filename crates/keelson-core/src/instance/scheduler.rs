//! Cooperative control over an instance's run loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Control surface of the loop that advances an instance.
///
/// `stop` is a request: the loop honours it once the in-flight unit of work
/// yields. Nothing is interrupted.
pub trait SchedulerControl: Send + Sync {
    fn stop(&self);

    fn resume(&self);

    fn suspend(&self, reason: &str);

    fn is_stop_requested(&self) -> bool;
}

/// Flag-based scheduler control for hosts whose run loop polls
/// [`SchedulerControl::is_stop_requested`] between units of work.
#[derive(Debug, Default)]
pub struct CooperativeScheduler {
    stop_requested: AtomicBool,
    suspended: Mutex<Option<String>>,
}

impl CooperativeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_reason().is_some()
    }

    pub fn suspend_reason(&self) -> Option<String> {
        self.suspended
            .lock()
            .expect("scheduler lock poisoned")
            .clone()
    }
}

impl SchedulerControl for CooperativeScheduler {
    fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        tracing::debug!("scheduler stop requested");
    }

    fn resume(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
        *self.suspended.lock().expect("scheduler lock poisoned") = None;
        tracing::debug!("scheduler resumed");
    }

    fn suspend(&self, reason: &str) {
        self.stop_requested.store(false, Ordering::SeqCst);
        *self.suspended.lock().expect("scheduler lock poisoned") = Some(reason.to_string());
        tracing::debug!(reason, "scheduler suspended");
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}
