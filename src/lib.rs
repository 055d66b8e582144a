//! Multigranularity lock management for a transactional database engine.
//!
//! Locks are taken at several granularities (database, table, page) through
//! a tree of [`LockContext`]s that mirrors the resource hierarchy. Each
//! context enforces the intent-lock protocol on top of a flat [`LockTable`],
//! which owns the lock records and blocks conflicting requests. Transaction
//! code should normally go through [`ensure_sufficient_lock_held`], which
//! plans the minimal sequence of acquisitions for a requested access level.

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

mod error;
mod lock_context;
mod lock_manager;
mod lock_table;
mod lock_type;
mod lock_util;
mod resource;
mod transaction;

pub use {
    error::{LockError, Result},
    lock_context::LockContext,
    lock_manager::LockManager,
    lock_table::{Lock, LockTable},
    lock_type::LockType,
    lock_util::ensure_sufficient_lock_held,
    resource::ResourceName,
    transaction::{Transaction, TransactionManager},
};

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    // Two transactions on separate threads contending for the same table:
    // the writer blocks inside the lock table until the reader releases
    // bottom-up, then proceeds.
    #[test]
    fn conflicting_transactions_block_and_resume() {
        let manager = Arc::new(LockManager::new());
        let tm = TransactionManager::new();
        let t1 = tm.begin();
        let t2 = tm.begin();

        let table1 = manager.context("database").child("table1");
        ensure_sufficient_lock_held(&t1, &table1, LockType::S).unwrap();

        let writer = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                let table1 = manager.context("database").child("table1");
                ensure_sufficient_lock_held(&t2, &table1, LockType::X).unwrap();
                table1.get_explicit_lock_type(&t2)
            })
        };

        // Let the writer reach the conflict, then release leaf to root.
        std::thread::sleep(Duration::from_millis(20));
        table1.release(&t1).unwrap();
        manager.context("database").release(&t1).unwrap();

        assert_eq!(writer.join().unwrap(), LockType::X);
    }

    #[test]
    fn independent_subtrees_do_not_interfere() {
        let manager = LockManager::new();
        let tm = TransactionManager::new();
        let t1 = tm.begin();
        let t2 = tm.begin();

        let table1 = manager.context("database").child("table1");
        let table2 = manager.context("database").child("table2");

        ensure_sufficient_lock_held(&t1, &table1, LockType::X).unwrap();
        ensure_sufficient_lock_held(&t2, &table2, LockType::X).unwrap();

        assert_eq!(table1.get_explicit_lock_type(&t1), LockType::X);
        assert_eq!(table2.get_explicit_lock_type(&t2), LockType::X);

        let db = manager.context("database");
        assert_eq!(db.get_explicit_lock_type(&t1), LockType::IX);
        assert_eq!(db.get_explicit_lock_type(&t2), LockType::IX);
        assert_eq!(db.get_num_children(&t1), 1);
        assert_eq!(db.get_num_children(&t2), 1);
    }
}
