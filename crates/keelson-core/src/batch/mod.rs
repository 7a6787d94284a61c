//! Pending side-effecting work, grouped by scope and committed as one batch.
//!
//! - `participant` -- the `PendingWorkParticipant` trait and `WorkItem`
//! - `work` -- `WorkItemBatch`, one scope's ordered items per submitter
//! - `registry` -- `BatchRegistry`, scope key -> batch, with the shared order sequence
//! - `scope` -- `ActiveScope`, publishing "the batch for the current scope" ambiently

pub mod participant;
pub mod registry;
pub mod scope;
pub mod work;

pub use participant::{PendingWorkParticipant, WorkItem, WorkPayload};
pub use registry::{BatchRegistry, OrderSequence};
pub use scope::ActiveScope;
pub use work::WorkItemBatch;
