use crate::lock_context::LockContext;
use crate::lock_table::LockTable;
use crate::resource::ResourceName;
use dashmap::DashMap;
use std::sync::Arc;

/// Entry point of the locking layer: owns the flat [`LockTable`] and the
/// lazily-created roots of the lock context hierarchy. Contexts hold a
/// handle to the table but never back to this registry, so the ownership
/// graph stays acyclic (registry → roots → children, parents weak).
pub struct LockManager {
    table: Arc<LockTable>,
    roots: DashMap<String, Arc<LockContext>>,
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            table: Arc::new(LockTable::new()),
            roots: DashMap::new(),
        }
    }

    pub fn table(&self) -> &Arc<LockTable> {
        &self.table
    }

    /// The top-level context named `segment`, created on first access.
    pub fn context(&self, segment: &str) -> Arc<LockContext> {
        let entry = self
            .roots
            .entry(segment.to_string())
            .or_insert_with(|| LockContext::root(Arc::clone(&self.table), segment));
        Arc::clone(entry.value())
    }

    /// The context for an arbitrary resource name, walking (and creating)
    /// nodes segment by segment from the root.
    pub fn resolve(&self, name: &ResourceName) -> Arc<LockContext> {
        let mut context = self.context(name.first());
        for segment in &name.segments()[1..] {
            context = context.child(segment);
        }
        context
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::LockManager;
    use crate::resource::ResourceName;
    use std::sync::Arc;

    #[test]
    fn resolve_walks_and_creates_the_path() {
        let manager = LockManager::new();
        let name = ResourceName::root("database").child("table1").child("page3");

        let page = manager.resolve(&name);
        assert_eq!(page.name(), &name);

        // Resolving again, or walking manually, hits the same nodes.
        assert!(Arc::ptr_eq(&page, &manager.resolve(&name)));
        let manual = manager.context("database").child("table1").child("page3");
        assert!(Arc::ptr_eq(&page, &manual));
    }

    #[test]
    fn roots_are_canonical() {
        let manager = LockManager::new();
        let a = manager.context("database");
        let b = manager.context("database");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.parent().is_none());
    }
}
