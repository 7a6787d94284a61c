//! Scope identity types.
//!
//! A scope is a transactional sub-unit inside a workflow instance (an atomic
//! step group, a fault-handling block, the root). Pending work is grouped by
//! `ScopeKey`; the reserved `Transient` key collects work that is not bound to
//! any explicit scope.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reference to a scope inside an execution tree.
///
/// `qualified_path` is stable across serialization and is what rollback uses
/// to re-locate the scope in a freshly loaded tree; `scope_id` disambiguates
/// repeated executions of the same path (loop iterations, retries).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeRef {
    /// Execution-context id of the scope.
    pub scope_id: Uuid,
    /// Dotted path of the scope within the workflow definition.
    pub qualified_path: String,
}

impl ScopeRef {
    pub fn new(scope_id: Uuid, qualified_path: impl Into<String>) -> Self {
        Self {
            scope_id,
            qualified_path: qualified_path.into(),
        }
    }
}

impl fmt::Display for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.qualified_path, self.scope_id)
    }
}

/// Key grouping pending work items inside a batch registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScopeKey {
    /// Instance-level work not bound to an explicit sub-transaction.
    Transient,
    /// Work bound to a specific scope.
    Scope(ScopeRef),
}

impl ScopeKey {
    pub fn scope(scope_id: Uuid, qualified_path: impl Into<String>) -> Self {
        ScopeKey::Scope(ScopeRef::new(scope_id, qualified_path))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ScopeKey::Transient)
    }

    /// The scope reference, if this key names one.
    pub fn as_scope(&self) -> Option<&ScopeRef> {
        match self {
            ScopeKey::Transient => None,
            ScopeKey::Scope(scope) => Some(scope),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Transient => f.write_str("transient"),
            ScopeKey::Scope(scope) => scope.fmt(f),
        }
    }
}
