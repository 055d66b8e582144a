use crate::resource::ResourceName;
use thiserror::Error;

/// Errors surfaced by lock contexts and the lock table. All of these are
/// caller misuse or policy violations and are never retried internally;
/// tree state is unchanged when any of them is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("operation not supported on read-only context {name}")]
    UnsupportedOperation { name: ResourceName },

    #[error("transaction {txn_id} already holds a lock on {name}")]
    DuplicateLockRequest { txn_id: u64, name: ResourceName },

    #[error("transaction {txn_id} holds no lock on {name}")]
    NoLockHeld { txn_id: u64, name: ResourceName },

    #[error("invalid lock request on {name}: {reason}")]
    InvalidLock {
        name: ResourceName,
        reason: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, LockError>;
