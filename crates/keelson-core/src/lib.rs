//! Durable-execution core for Keelson.
//!
//! This crate owns the hard parts of advancing a workflow instance safely:
//! - `ambient` -- thread-scoped context stack (current scope, current transaction)
//! - `queue` -- keyed binary min-heap with head-changed notifications
//! - `batch` -- pending work batches and the per-instance batch registry
//! - `transaction` -- commit/complete/fault lifecycle against a host transaction
//! - `timer` -- per-instance timer subscriptions driving an external timer service
//! - `checkpoint` -- snapshot and rollback of an instance's execution state
//! - `instance` -- the instance model, instance table, and scheduler control
//!
//! It depends only on `keelson-types` and never performs I/O itself; concrete
//! collaborators (timer service, configuration loading) live in `keelson-infra`.

pub mod ambient;
pub mod batch;
pub mod checkpoint;
pub mod error;
pub mod instance;
pub mod queue;
pub mod timer;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testing;

pub use error::ExecutionError;
