//! Resource registry: the fixed set of resources and their locks.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use super::lock_manager::{ResourceId, ResourceLock};
use crate::error::{Error, Result};

/// Immutable mapping of resource identifiers to their single lock.
///
/// Built once at startup and shared read-only between all runs.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    /// Resources in configuration order.
    order: Vec<ResourceId>,
    /// One lock per resource, never replaced.
    locks: HashMap<ResourceId, Arc<ResourceLock>>,
}

impl ResourceRegistry {
    /// Build a registry from resource names. Duplicates keep the first occurrence.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut order = Vec::new();
        let mut locks = HashMap::new();

        for name in names {
            let id = ResourceId::named(name);
            if locks.contains_key(&id) {
                warn!("Duplicate resource {} ignored", id);
                continue;
            }
            locks.insert(id.clone(), Arc::new(ResourceLock::new(id.clone())));
            order.push(id);
        }

        Self { order, locks }
    }

    /// All resources, in configuration order.
    pub fn resources(&self) -> &[ResourceId] {
        &self.order
    }

    /// The lock guarding `id`.
    pub fn lock_for(&self, id: &ResourceId) -> Result<Arc<ResourceLock>> {
        self.locks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownResource { id: id.clone() })
    }

    /// Number of registered resources.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Check if no resources are registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Number of resources currently locked by any run.
    pub fn held_count(&self) -> usize {
        self.locks.values().filter(|lock| lock.is_locked()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunId;
    use std::time::Duration;

    #[test]
    fn test_resources_keep_order() {
        let registry = ResourceRegistry::new(["b", "a", "c"]);
        let names: Vec<_> = registry.resources().iter().map(|r| r.0.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(registry.len(), 3);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_duplicates_collapsed() {
        let registry = ResourceRegistry::new(["a", "b", "a"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_resource() {
        let registry = ResourceRegistry::new(["a"]);
        let err = registry.lock_for(&ResourceId::named("missing")).unwrap_err();
        assert!(matches!(err, Error::UnknownResource { id } if id.0 == "missing"));
    }

    #[test]
    fn test_same_lock_every_time() {
        let registry = ResourceRegistry::new(["a"]);
        let id = ResourceId::named("a");
        let first = registry.lock_for(&id).unwrap();
        let second = registry.lock_for(&id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_held_count() {
        let registry = ResourceRegistry::new(["a", "b"]);
        assert_eq!(registry.held_count(), 0);

        let run = RunId::new();
        let lock = registry.lock_for(&ResourceId::named("a")).unwrap();
        lock.try_lock(&run, Duration::from_millis(10)).await;
        assert_eq!(registry.held_count(), 1);

        lock.release(&run);
        assert_eq!(registry.held_count(), 0);
    }

    #[test]
    fn test_empty_registry() {
        let registry = ResourceRegistry::new(Vec::<String>::new());
        assert!(registry.is_empty());
        assert!(registry.resources().is_empty());
    }
}
