use crate::error::{LockError, Result};
use crate::lock_table::LockTable;
use crate::lock_type::LockType;
use crate::resource::ResourceName;
use crate::transaction::Transaction;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A node in the multigranularity locking hierarchy (database, table X,
/// page Y of table X, ...). Wraps the flat [`LockTable`] and enforces the
/// rules that make locking at multiple granularities safe: intent locks on
/// ancestors, bottom-up release, atomic SIX promotion and escalation.
///
/// Nodes are materialized lazily on first access and are shared between
/// transactions; they never block by themselves. Any waiting for a
/// conflicting lock happens inside the lock table.
pub struct LockContext {
    table: Arc<LockTable>,
    // Non-owning back-reference; dangling only at the root. The owning
    // edges are the `children` maps, rooted in LockManager.
    parent: Weak<LockContext>,
    name: ResourceName,
    // A read-only context rejects all mutating operations.
    readonly: bool,
    // Once set, children created afterwards are read-only. Used to mark
    // subtrees that must stay single-granularity.
    child_locks_disabled: AtomicBool,
    // Per transaction: how many locks it holds on strict descendants of
    // this node, across all levels below, not just direct children.
    num_child_locks: DashMap<u64, usize>,
    children: DashMap<String, Arc<LockContext>>,
}

impl LockContext {
    pub(crate) fn root(table: Arc<LockTable>, segment: &str) -> Arc<LockContext> {
        Arc::new(LockContext {
            table,
            parent: Weak::new(),
            name: ResourceName::root(segment),
            readonly: false,
            child_locks_disabled: AtomicBool::new(false),
            num_child_locks: DashMap::new(),
            children: DashMap::new(),
        })
    }

    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    pub fn parent(&self) -> Option<Arc<LockContext>> {
        self.parent.upgrade()
    }

    /// The context for the child named `segment`, creating it on first
    /// access. Concurrent calls for the same segment observe the same node.
    pub fn child(self: &Arc<Self>, segment: &str) -> Arc<LockContext> {
        let entry = self.children.entry(segment.to_string()).or_insert_with(|| {
            let readonly = self.readonly || self.child_locks_disabled.load(Ordering::Acquire);
            Arc::new(LockContext {
                table: Arc::clone(&self.table),
                parent: Arc::downgrade(self),
                name: self.name.child(segment),
                readonly,
                child_locks_disabled: AtomicBool::new(readonly),
                num_child_locks: DashMap::new(),
                children: DashMap::new(),
            })
        });
        Arc::clone(entry.value())
    }

    /// Stop handing out writable child contexts. Existing children are
    /// unaffected.
    pub fn disable_child_locks(&self) {
        self.child_locks_disabled.store(true, Ordering::Release);
    }

    /// Request `lock_type` at this level for `txn`. On success the lock
    /// table is called exactly once and every strict ancestor's descendant
    /// count goes up by one.
    pub fn acquire(&self, txn: &Transaction, lock_type: LockType) -> Result<()> {
        if self.readonly {
            return Err(LockError::UnsupportedOperation {
                name: self.name.clone(),
            });
        }
        // S and IS below a SIX ancestor are redundant: SIX already implies
        // S everywhere beneath it.
        if matches!(lock_type, LockType::S | LockType::IS) && self.has_six_ancestor(txn) {
            return Err(LockError::InvalidLock {
                name: self.name.clone(),
                reason: "an ancestor already holds SIX",
            });
        }
        if self.get_explicit_lock_type(txn) == lock_type {
            return Err(LockError::DuplicateLockRequest {
                txn_id: txn.id(),
                name: self.name.clone(),
            });
        }
        let enclosing = self.enclosing_lock_type(txn);
        if enclosing != LockType::NL && !enclosing.can_be_parent_of(lock_type) {
            return Err(LockError::InvalidLock {
                name: self.name.clone(),
                reason: "not a valid child of the lock held above",
            });
        }
        self.table.acquire(txn, &self.name, lock_type)?;
        self.increment_ancestor_counts(txn.id());
        Ok(())
    }

    /// Release `txn`'s lock at this level. Locks must be released bottom-up:
    /// this fails while the transaction still holds any lock below here.
    pub fn release(&self, txn: &Transaction) -> Result<()> {
        if self.readonly {
            return Err(LockError::UnsupportedOperation {
                name: self.name.clone(),
            });
        }
        if self.get_explicit_lock_type(txn) == LockType::NL {
            return Err(LockError::NoLockHeld {
                txn_id: txn.id(),
                name: self.name.clone(),
            });
        }
        if self.get_num_children(txn) != 0 {
            return Err(LockError::InvalidLock {
                name: self.name.clone(),
                reason: "transaction still holds locks on descendants",
            });
        }
        self.table.release(txn, &self.name)?;
        self.decrement_ancestor_counts(txn.id());
        Ok(())
    }

    /// Change `txn`'s lock at this level to the stronger `new_type`.
    ///
    /// Promotion to SIX from S/IS/IX simultaneously releases every S and IS
    /// lock the transaction holds below here (they become redundant), as a
    /// single atomic lock-table call. Any other promotion requires
    /// `new_type` to be substitutable for the held type.
    pub fn promote(&self, txn: &Transaction, new_type: LockType) -> Result<()> {
        if self.readonly {
            return Err(LockError::UnsupportedOperation {
                name: self.name.clone(),
            });
        }
        let current = self.get_explicit_lock_type(txn);
        if current == LockType::NL {
            return Err(LockError::NoLockHeld {
                txn_id: txn.id(),
                name: self.name.clone(),
            });
        }
        if current == new_type {
            return Err(LockError::DuplicateLockRequest {
                txn_id: txn.id(),
                name: self.name.clone(),
            });
        }
        if new_type == LockType::SIX
            && matches!(current, LockType::S | LockType::IS | LockType::IX)
        {
            if self.has_six_ancestor(txn) {
                return Err(LockError::InvalidLock {
                    name: self.name.clone(),
                    reason: "an ancestor already holds SIX",
                });
            }
            let released = self.sis_descendants(txn);
            self.table
                .acquire_and_release(txn, &self.name, LockType::SIX, &released)?;
            for name in &released {
                self.uncount_descendant(txn.id(), name);
            }
            return Ok(());
        }
        if !new_type.substitutable_for(current) {
            return Err(LockError::InvalidLock {
                name: self.name.clone(),
                reason: "requested type is not a promotion of the held type",
            });
        }
        self.table.promote(txn, &self.name, new_type)
    }

    /// Collapse every lock `txn` holds below this level into a single S or X
    /// lock here: S when the held lock is IS, X when it is IX or SIX.
    /// Everything that was permitted on a descendant before stays permitted
    /// through the effective lock afterwards. Calling this twice in a row
    /// issues no lock-table call the second time.
    pub fn escalate(&self, txn: &Transaction) -> Result<()> {
        if self.readonly {
            return Err(LockError::UnsupportedOperation {
                name: self.name.clone(),
            });
        }
        let current = self.get_explicit_lock_type(txn);
        if current == LockType::NL {
            return Err(LockError::NoLockHeld {
                txn_id: txn.id(),
                name: self.name.clone(),
            });
        }
        // Already coarse; nothing below can exist that it does not imply.
        if matches!(current, LockType::S | LockType::X) {
            return Ok(());
        }
        let target = if current == LockType::IS {
            LockType::S
        } else {
            LockType::X
        };
        let released = self.descendant_locks(txn);
        self.table
            .acquire_and_release(txn, &self.name, target, &released)?;
        for name in &released {
            self.uncount_descendant(txn.id(), name);
        }
        Ok(())
    }

    /// The lock `txn` explicitly holds at this level, or NL.
    pub fn get_explicit_lock_type(&self, txn: &Transaction) -> LockType {
        self.table.get_lock_type(txn, &self.name)
    }

    /// The strongest lock `txn` can be considered to hold here, explicit or
    /// inherited from an ancestor. SIX above implies S here; intent locks
    /// above imply nothing; S/X above are inherited as-is.
    pub fn get_effective_lock_type(&self, txn: &Transaction) -> LockType {
        let explicit = self.get_explicit_lock_type(txn);
        if explicit != LockType::NL {
            return explicit;
        }
        let mut cursor = self.parent.upgrade();
        while let Some(ancestor) = cursor {
            let held = ancestor.get_explicit_lock_type(txn);
            if held != LockType::NL {
                return match held {
                    LockType::SIX => LockType::S,
                    held if held.is_intent() => LockType::NL,
                    held => held,
                };
            }
            cursor = ancestor.parent.upgrade();
        }
        LockType::NL
    }

    /// Whether any strict ancestor's explicit lock for `txn` is SIX. Each
    /// ancestor is queried for its own resource name.
    pub fn has_six_ancestor(&self, txn: &Transaction) -> bool {
        let mut cursor = self.parent.upgrade();
        while let Some(ancestor) = cursor {
            if ancestor.get_explicit_lock_type(txn) == LockType::SIX {
                return true;
            }
            cursor = ancestor.parent.upgrade();
        }
        false
    }

    /// How many locks `txn` holds on strict descendants of this node.
    pub fn get_num_children(&self, txn: &Transaction) -> usize {
        self.num_child_locks
            .get(&txn.id())
            .map_or(0, |count| *count)
    }

    /// The transaction's explicit lock here if any, otherwise the nearest
    /// explicit lock on the ancestor chain. NL when the transaction holds
    /// nothing on the whole path.
    fn enclosing_lock_type(&self, txn: &Transaction) -> LockType {
        let explicit = self.get_explicit_lock_type(txn);
        if explicit != LockType::NL {
            return explicit;
        }
        let mut cursor = self.parent.upgrade();
        while let Some(ancestor) = cursor {
            let held = ancestor.get_explicit_lock_type(txn);
            if held != LockType::NL {
                return held;
            }
            cursor = ancestor.parent.upgrade();
        }
        LockType::NL
    }

    /// Names of every S or IS lock `txn` holds on strict descendants.
    fn sis_descendants(&self, txn: &Transaction) -> Vec<ResourceName> {
        self.table
            .get_locks(txn)
            .into_iter()
            .filter(|lock| {
                matches!(lock.lock_type, LockType::S | LockType::IS)
                    && lock.name.is_descendant_of(&self.name)
            })
            .map(|lock| lock.name)
            .collect()
    }

    /// Names of every lock `txn` holds on strict descendants.
    fn descendant_locks(&self, txn: &Transaction) -> Vec<ResourceName> {
        self.table
            .get_locks(txn)
            .into_iter()
            .filter(|lock| lock.name.is_descendant_of(&self.name))
            .map(|lock| lock.name)
            .collect()
    }

    fn increment_ancestor_counts(&self, txn_id: u64) {
        let mut cursor = self.parent.upgrade();
        while let Some(ancestor) = cursor {
            *ancestor.num_child_locks.entry(txn_id).or_insert(0) += 1;
            cursor = ancestor.parent.upgrade();
        }
    }

    fn decrement_ancestor_counts(&self, txn_id: u64) {
        let mut cursor = self.parent.upgrade();
        while let Some(ancestor) = cursor {
            let mut count = ancestor.num_child_locks.entry(txn_id).or_insert(0);
            *count = count.saturating_sub(1);
            drop(count);
            cursor = ancestor.parent.upgrade();
        }
    }

    /// A descendant lock at `name` was just released: decrement the count on
    /// every node above it, up to the root. Nodes above `self` counted the
    /// released lock too.
    fn uncount_descendant(&self, txn_id: u64, name: &ResourceName) {
        if let Some(context) = self.descendant(name) {
            context.decrement_ancestor_counts(txn_id);
        }
    }

    /// Walk down the already-materialized children to the context for
    /// `name`. Descendants that were ever locked always have a context.
    fn descendant(&self, name: &ResourceName) -> Option<Arc<LockContext>> {
        let depth = self.name.segments().len();
        let mut segments = name.segments()[depth..].iter();
        let first = segments.next()?;
        let mut context = self
            .children
            .get(first.as_str())
            .map(|child| Arc::clone(child.value()))?;
        for segment in segments {
            let next = context
                .children
                .get(segment.as_str())
                .map(|child| Arc::clone(child.value()))?;
            context = next;
        }
        Some(context)
    }
}

impl fmt::Display for LockContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LockContext({})", self.name)
    }
}
