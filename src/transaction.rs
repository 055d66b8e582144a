use std::sync::{self, atomic::AtomicU64};

/// Identity of a transaction as seen by the locking layer. Lock requests are
/// always made on behalf of an explicit transaction; there is no ambient
/// "current transaction" lookup.
#[derive(Debug)]
pub struct Transaction {
    txn_id: u64,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.txn_id
    }
}

pub struct TransactionManager {
    next_txn_id: AtomicU64,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
        }
    }

    pub fn begin(&self) -> Transaction {
        let txn_id = self
            .next_txn_id
            .fetch_add(1, sync::atomic::Ordering::SeqCst);

        Transaction { txn_id }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
