//! The runtime's table of live instances.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::error::ExecutionError;

use super::model::ExecutionInstance;
use super::ExecutionTree;

/// Id -> live instance map owned by the runtime.
///
/// `replace_instance` is the only way an existing entry changes; rollback
/// uses it as its single commit point.
pub trait InstanceTable<T: ExecutionTree>: Send + Sync {
    fn get(&self, id: Uuid) -> Option<Arc<ExecutionInstance<T>>>;

    /// Swap `old` for `new` under `id`. Fails without changing anything if
    /// the table no longer holds `old` there.
    fn replace_instance(
        &self,
        id: Uuid,
        old: &Arc<ExecutionInstance<T>>,
        new: Arc<ExecutionInstance<T>>,
    ) -> Result<(), ExecutionError>;
}

/// Concurrent in-memory instance table.
pub struct RuntimeInstanceTable<T: ExecutionTree> {
    instances: DashMap<Uuid, Arc<ExecutionInstance<T>>>,
}

impl<T: ExecutionTree> RuntimeInstanceTable<T> {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    /// Add an instance under its own id, returning any instance it displaced.
    pub fn insert(&self, instance: Arc<ExecutionInstance<T>>) -> Option<Arc<ExecutionInstance<T>>> {
        self.instances.insert(instance.id(), instance)
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<ExecutionInstance<T>>> {
        self.instances.remove(&id).map(|(_, instance)| instance)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl<T: ExecutionTree> Default for RuntimeInstanceTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ExecutionTree> InstanceTable<T> for RuntimeInstanceTable<T> {
    fn get(&self, id: Uuid) -> Option<Arc<ExecutionInstance<T>>> {
        self.instances.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn replace_instance(
        &self,
        id: Uuid,
        old: &Arc<ExecutionInstance<T>>,
        new: Arc<ExecutionInstance<T>>,
    ) -> Result<(), ExecutionError> {
        if new.id() != id {
            return Err(ExecutionError::misuse(format!(
                "replacement instance {} does not match id {id}",
                new.id()
            )));
        }

        let mut entry = self
            .instances
            .get_mut(&id)
            .ok_or(ExecutionError::InstanceNotFound(id))?;
        if !Arc::ptr_eq(entry.value(), old) {
            return Err(ExecutionError::misuse(format!(
                "instance {id} was replaced concurrently"
            )));
        }
        *entry.value_mut() = new;

        tracing::debug!(instance_id = %id, "instance replaced");
        Ok(())
    }
}

impl<T: ExecutionTree> std::fmt::Debug for RuntimeInstanceTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeInstanceTable")
            .field("instances", &self.instances.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_services, TestTree};

    fn instance(id: Uuid) -> Arc<ExecutionInstance<TestTree>> {
        let (services, _, _) = test_services();
        Arc::new(ExecutionInstance::new(id, TestTree::with_scopes(&["root"]), services))
    }

    #[test]
    fn replace_swaps_matching_instance() {
        let table = RuntimeInstanceTable::new();
        let id = Uuid::now_v7();
        let old = instance(id);
        table.insert(Arc::clone(&old));

        let new = instance(id);
        table.replace_instance(id, &old, Arc::clone(&new)).unwrap();
        assert!(Arc::ptr_eq(&table.get(id).unwrap(), &new));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn replace_with_stale_old_is_rejected() {
        let table = RuntimeInstanceTable::new();
        let id = Uuid::now_v7();
        let current = instance(id);
        let stale = instance(id);
        table.insert(Arc::clone(&current));

        let err = table.replace_instance(id, &stale, instance(id)).unwrap_err();
        assert!(matches!(err, ExecutionError::ProtocolMisuse(_)));
        assert!(Arc::ptr_eq(&table.get(id).unwrap(), &current));
    }

    #[test]
    fn replace_missing_instance_is_not_found() {
        let table = RuntimeInstanceTable::new();
        let id = Uuid::now_v7();
        let old = instance(id);

        assert!(matches!(
            table.replace_instance(id, &old, instance(id)),
            Err(ExecutionError::InstanceNotFound(missing)) if missing == id
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn replace_with_mismatched_id_is_rejected() {
        let table = RuntimeInstanceTable::new();
        let id = Uuid::now_v7();
        let old = instance(id);
        table.insert(Arc::clone(&old));

        assert!(table.replace_instance(id, &old, instance(Uuid::now_v7())).is_err());
        assert!(table.remove(id).is_some());
    }
}
