//! The running-instance model the core operates on.
//!
//! - `model` -- `ExecutionInstance` and the services it shares with its successors
//! - `table` -- `InstanceTable`, the runtime's id -> instance map
//! - `scheduler` -- `SchedulerControl`, cooperative stop/resume of an instance's run loop
//!
//! The execution tree itself (activities, their state, the definition) is
//! owned by the host and reached only through [`ExecutionTree`].

use std::io::{Read, Write};
use std::sync::Arc;

use keelson_types::scope::ScopeRef;
use uuid::Uuid;

pub mod model;
pub mod scheduler;
pub mod table;

pub use model::{ExecutionInstance, InstanceServices};
pub use scheduler::{CooperativeScheduler, SchedulerControl};
pub use table::{InstanceTable, RuntimeInstanceTable};

/// Serializable execution state of one workflow instance.
///
/// The byte format written by `save` is private to the implementation; the
/// core only stores it and feeds it back to `load`.
pub trait ExecutionTree: Send + Sized + 'static {
    /// Immutable workflow definition the tree executes.
    type Definition: Send + Sync + 'static;

    fn definition(&self) -> &Arc<Self::Definition>;

    fn definition_id(&self) -> Uuid;

    fn save(&self, writer: &mut dyn Write) -> anyhow::Result<()>;

    /// Rebuild a tree from bytes produced by `save`, bound to `definition`.
    fn load(reader: &mut dyn Read, definition: Arc<Self::Definition>) -> anyhow::Result<Self>;

    /// Whether the scope (matched by qualified path and scope id) exists in
    /// this tree.
    fn contains_scope(&self, scope: &ScopeRef) -> bool;
}
