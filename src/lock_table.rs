use crate::error::{LockError, Result};
use crate::lock_type::LockType;
use crate::resource::ResourceName;
use crate::transaction::Transaction;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use tracing::debug;

/// A granted lock: one transaction, one resource, one lock type. A
/// transaction holds at most one lock type per resource at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub txn_id: u64,
    pub name: ResourceName,
    pub lock_type: LockType,
}

#[derive(Default)]
struct TableState {
    by_resource: HashMap<ResourceName, Vec<Lock>>,
    // Resources each transaction holds a lock on, in acquisition order.
    by_txn: HashMap<u64, Vec<ResourceName>>,
    // Count of mutating calls, so callers can assert how many were issued.
    mutating_calls: u64,
}

impl TableState {
    fn lock_on(&self, txn_id: u64, name: &ResourceName) -> Option<&Lock> {
        self.by_resource
            .get(name)?
            .iter()
            .find(|lock| lock.txn_id == txn_id)
    }

    fn lock_type(&self, txn_id: u64, name: &ResourceName) -> LockType {
        self.lock_on(txn_id, name)
            .map_or(LockType::NL, |lock| lock.lock_type)
    }

    /// Whether `lock_type` is compatible with every *other* transaction's
    /// lock on `name`.
    fn compatible(&self, txn_id: u64, name: &ResourceName, lock_type: LockType) -> bool {
        self.by_resource.get(name).map_or(true, |locks| {
            locks
                .iter()
                .all(|lock| lock.txn_id == txn_id || lock.lock_type.compatible_with(lock_type))
        })
    }

    fn grant(&mut self, lock: Lock) {
        self.by_txn
            .entry(lock.txn_id)
            .or_default()
            .push(lock.name.clone());
        self.by_resource
            .entry(lock.name.clone())
            .or_default()
            .push(lock);
    }

    fn remove(&mut self, txn_id: u64, name: &ResourceName) -> bool {
        let removed = match self.by_resource.get_mut(name) {
            Some(locks) => match locks.iter().position(|lock| lock.txn_id == txn_id) {
                Some(pos) => {
                    locks.remove(pos);
                    if locks.is_empty() {
                        self.by_resource.remove(name);
                    }
                    true
                }
                None => false,
            },
            None => false,
        };

        if removed {
            if let Some(names) = self.by_txn.get_mut(&txn_id) {
                if let Some(pos) = names.iter().position(|n| n == name) {
                    names.remove(pos);
                }
            }
        }
        removed
    }

    fn set_type(&mut self, txn_id: u64, name: &ResourceName, lock_type: LockType) {
        if let Some(locks) = self.by_resource.get_mut(name) {
            if let Some(lock) = locks.iter_mut().find(|lock| lock.txn_id == txn_id) {
                lock.lock_type = lock_type;
            }
        }
    }
}

/// Flat, resource-keyed lock table. Owns every granted lock record and is
/// the only place where a caller blocks: a conflicting request suspends the
/// calling thread on a condvar until compatibility is restored. It knows
/// nothing about the resource hierarchy; the multigranularity rules live in
/// [`crate::LockContext`].
pub struct LockTable {
    state: Mutex<TableState>,
    freed: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        LockTable {
            state: Mutex::new(TableState::default()),
            freed: Condvar::new(),
        }
    }

    /// Acquire `lock_type` on `name` for `txn`, blocking until it is
    /// compatible with every other transaction's lock on `name`.
    pub fn acquire(
        &self,
        txn: &Transaction,
        name: &ResourceName,
        lock_type: LockType,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.lock_on(txn.id(), name).is_some() {
            return Err(LockError::DuplicateLockRequest {
                txn_id: txn.id(),
                name: name.clone(),
            });
        }
        while !state.compatible(txn.id(), name, lock_type) {
            self.freed.wait(&mut state);
        }
        state.grant(Lock {
            txn_id: txn.id(),
            name: name.clone(),
            lock_type,
        });
        state.mutating_calls += 1;
        debug!("txn {} acquired {} on {}", txn.id(), lock_type, name);
        Ok(())
    }

    /// Release `txn`'s lock on `name` and wake any blocked requests.
    pub fn release(&self, txn: &Transaction, name: &ResourceName) -> Result<()> {
        let mut state = self.state.lock();
        if !state.remove(txn.id(), name) {
            return Err(LockError::NoLockHeld {
                txn_id: txn.id(),
                name: name.clone(),
            });
        }
        state.mutating_calls += 1;
        drop(state);
        self.freed.notify_all();
        debug!("txn {} released {}", txn.id(), name);
        Ok(())
    }

    /// Replace `txn`'s lock on `name` with the stronger `new_type`, blocking
    /// until the new type is compatible with the other holders.
    pub fn promote(
        &self,
        txn: &Transaction,
        name: &ResourceName,
        new_type: LockType,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let current = state.lock_type(txn.id(), name);
        if current == LockType::NL {
            return Err(LockError::NoLockHeld {
                txn_id: txn.id(),
                name: name.clone(),
            });
        }
        if current == new_type {
            return Err(LockError::DuplicateLockRequest {
                txn_id: txn.id(),
                name: name.clone(),
            });
        }
        if !new_type.substitutable_for(current) {
            return Err(LockError::InvalidLock {
                name: name.clone(),
                reason: "requested type is not a promotion of the held type",
            });
        }
        while !state.compatible(txn.id(), name, new_type) {
            self.freed.wait(&mut state);
        }
        state.set_type(txn.id(), name, new_type);
        state.mutating_calls += 1;
        debug!("txn {} promoted {} to {}", txn.id(), name, new_type);
        Ok(())
    }

    /// Atomically set `txn`'s lock on `name` to `new_type` (replacing any
    /// lock it already holds there) while releasing every resource in
    /// `releases`. Other transactions observe the whole transition as one
    /// indivisible step.
    pub fn acquire_and_release(
        &self,
        txn: &Transaction,
        name: &ResourceName,
        new_type: LockType,
        releases: &[ResourceName],
    ) -> Result<()> {
        let mut state = self.state.lock();
        for release in releases {
            if state.lock_on(txn.id(), release).is_none() {
                return Err(LockError::NoLockHeld {
                    txn_id: txn.id(),
                    name: release.clone(),
                });
            }
        }
        while !state.compatible(txn.id(), name, new_type) {
            self.freed.wait(&mut state);
        }
        for release in releases {
            state.remove(txn.id(), release);
        }
        if state.lock_on(txn.id(), name).is_some() {
            state.set_type(txn.id(), name, new_type);
        } else {
            state.grant(Lock {
                txn_id: txn.id(),
                name: name.clone(),
                lock_type: new_type,
            });
        }
        state.mutating_calls += 1;
        drop(state);
        self.freed.notify_all();
        debug!(
            "txn {} took {} on {}, releasing {} descendant locks",
            txn.id(),
            new_type,
            name,
            releases.len()
        );
        Ok(())
    }

    /// The lock `txn` holds on `name`, or NL.
    pub fn get_lock_type(&self, txn: &Transaction, name: &ResourceName) -> LockType {
        self.state.lock().lock_type(txn.id(), name)
    }

    /// Every lock `txn` currently holds, in acquisition order.
    pub fn get_locks(&self, txn: &Transaction) -> Vec<Lock> {
        let state = self.state.lock();
        match state.by_txn.get(&txn.id()) {
            Some(names) => names
                .iter()
                .filter_map(|name| state.lock_on(txn.id(), name).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Number of mutating calls issued so far.
    pub fn mutation_count(&self) -> u64 {
        self.state.lock().mutating_calls
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transaction::TransactionManager;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<LockTable>, TransactionManager) {
        let _ = tracing_subscriber::fmt::try_init();
        (Arc::new(LockTable::new()), TransactionManager::new())
    }

    #[test]
    fn acquire_and_query() {
        let (table, tm) = setup();
        let t1 = tm.begin();
        let db = ResourceName::root("database");
        let t1_name = db.child("table1");

        table.acquire(&t1, &db, LockType::IX).unwrap();
        table.acquire(&t1, &t1_name, LockType::X).unwrap();

        assert_eq!(table.get_lock_type(&t1, &db), LockType::IX);
        assert_eq!(table.get_lock_type(&t1, &t1_name), LockType::X);

        let locks = table.get_locks(&t1);
        assert_eq!(locks.len(), 2);
        assert_eq!(locks[0].name, db);
        assert_eq!(locks[1].name, t1_name);
    }

    #[test]
    fn acquire_twice_is_a_duplicate_request() {
        let (table, tm) = setup();
        let t1 = tm.begin();
        let db = ResourceName::root("database");

        table.acquire(&t1, &db, LockType::IS).unwrap();
        let err = table.acquire(&t1, &db, LockType::S).unwrap_err();
        assert!(matches!(err, LockError::DuplicateLockRequest { .. }));
    }

    #[test]
    fn release_without_lock_fails() {
        let (table, tm) = setup();
        let t1 = tm.begin();
        let db = ResourceName::root("database");

        let err = table.release(&t1, &db).unwrap_err();
        assert!(matches!(err, LockError::NoLockHeld { .. }));
    }

    #[test]
    fn promote_validations() {
        let (table, tm) = setup();
        let t1 = tm.begin();
        let db = ResourceName::root("database");

        assert!(matches!(
            table.promote(&t1, &db, LockType::X).unwrap_err(),
            LockError::NoLockHeld { .. }
        ));

        table.acquire(&t1, &db, LockType::S).unwrap();
        assert!(matches!(
            table.promote(&t1, &db, LockType::S).unwrap_err(),
            LockError::DuplicateLockRequest { .. }
        ));
        assert!(matches!(
            table.promote(&t1, &db, LockType::IS).unwrap_err(),
            LockError::InvalidLock { .. }
        ));

        table.promote(&t1, &db, LockType::X).unwrap();
        assert_eq!(table.get_lock_type(&t1, &db), LockType::X);
    }

    #[test]
    fn acquire_and_release_is_one_mutating_call() {
        let (table, tm) = setup();
        let t1 = tm.begin();
        let db = ResourceName::root("database");
        let table1 = db.child("table1");
        let p1 = table1.child("page1");
        let p2 = table1.child("page2");

        table.acquire(&t1, &table1, LockType::IS).unwrap();
        table.acquire(&t1, &p1, LockType::S).unwrap();
        table.acquire(&t1, &p2, LockType::S).unwrap();

        let before = table.mutation_count();
        table
            .acquire_and_release(&t1, &table1, LockType::S, &[p1.clone(), p2.clone()])
            .unwrap();
        assert_eq!(table.mutation_count(), before + 1);

        assert_eq!(table.get_lock_type(&t1, &table1), LockType::S);
        assert_eq!(table.get_lock_type(&t1, &p1), LockType::NL);
        assert_eq!(table.get_lock_type(&t1, &p2), LockType::NL);
    }

    #[test]
    fn acquire_and_release_checks_the_release_list() {
        let (table, tm) = setup();
        let t1 = tm.begin();
        let db = ResourceName::root("database");
        let stray = db.child("table9");

        table.acquire(&t1, &db, LockType::IS).unwrap();
        let err = table
            .acquire_and_release(&t1, &db, LockType::S, &[stray.clone()])
            .unwrap_err();
        assert_eq!(
            err,
            LockError::NoLockHeld {
                txn_id: t1.id(),
                name: stray
            }
        );
        // Nothing changed.
        assert_eq!(table.get_lock_type(&t1, &db), LockType::IS);
    }

    #[test]
    fn conflicting_acquire_blocks_until_release() {
        let (table, tm) = setup();
        let t1 = tm.begin();
        let t2 = tm.begin();
        let db = ResourceName::root("database");

        table.acquire(&t1, &db, LockType::X).unwrap();

        let blocked = {
            let table = Arc::clone(&table);
            let db = db.clone();
            std::thread::spawn(move || {
                table.acquire(&t2, &db, LockType::S).unwrap();
                table.get_lock_type(&t2, &db)
            })
        };

        // Give the second transaction time to hit the conflict.
        std::thread::sleep(Duration::from_millis(20));
        table.release(&t1, &db).unwrap();

        assert_eq!(blocked.join().unwrap(), LockType::S);
    }

    #[test]
    fn compatible_readers_do_not_block() {
        let (table, tm) = setup();
        let t1 = tm.begin();
        let t2 = tm.begin();
        let db = ResourceName::root("database");

        table.acquire(&t1, &db, LockType::S).unwrap();
        table.acquire(&t2, &db, LockType::S).unwrap();

        assert_eq!(table.get_lock_type(&t1, &db), LockType::S);
        assert_eq!(table.get_lock_type(&t2, &db), LockType::S);
    }
}
