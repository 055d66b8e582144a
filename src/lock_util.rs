use crate::error::Result;
use crate::lock_context::LockContext;
use crate::lock_type::LockType;
use crate::transaction::Transaction;
use std::sync::Arc;
use tracing::trace;

/// Ensure `txn` can perform actions requiring `request` on `context`,
/// acquiring, promoting or escalating as needed. `request` must be NL, S or
/// X. Grants the least permissive set of locks that satisfies the request:
/// intent locks are taken top-down on the ancestor path first, then the
/// target itself is adjusted.
///
/// This is the declarative layer transaction code should use instead of
/// calling [`LockContext`] methods directly.
pub fn ensure_sufficient_lock_held(
    txn: &Transaction,
    context: &Arc<LockContext>,
    request: LockType,
) -> Result<()> {
    debug_assert!(matches!(
        request,
        LockType::NL | LockType::S | LockType::X
    ));
    if request == LockType::NL {
        return Ok(());
    }
    let effective = context.get_effective_lock_type(txn);
    if effective.substitutable_for(request) {
        return Ok(());
    }
    trace!(
        "txn {} wants {} on {}, effective {}",
        txn.id(),
        request,
        context.name(),
        effective
    );

    // Ancestors, root first, so every acquisition sees a valid parent.
    let mut ancestors = Vec::new();
    let mut cursor = context.parent();
    while let Some(ancestor) = cursor {
        cursor = ancestor.parent();
        ancestors.push(ancestor);
    }
    ancestors.reverse();

    let explicit = context.get_explicit_lock_type(txn);
    if request == LockType::S {
        for ancestor in &ancestors {
            if ancestor.get_explicit_lock_type(txn) == LockType::NL {
                ancestor.acquire(txn, LockType::IS)?;
            }
        }
        match explicit {
            LockType::NL => context.acquire(txn, LockType::S),
            // The intent chain above already grants path access; collapse
            // whatever reads exist below into one S here.
            LockType::IS => context.escalate(txn),
            // IX: keep the write intent, add shared coverage.
            _ => context.promote(txn, LockType::SIX),
        }
    } else {
        for ancestor in &ancestors {
            match ancestor.get_explicit_lock_type(txn) {
                LockType::NL => ancestor.acquire(txn, LockType::IX)?,
                LockType::IS => ancestor.promote(txn, LockType::IX)?,
                LockType::S => ancestor.promote(txn, LockType::SIX)?,
                _ => {}
            }
        }
        match explicit {
            LockType::NL => context.acquire(txn, LockType::X),
            LockType::IS => {
                // Escalating IS yields S; one promotion finishes the job.
                context.escalate(txn)?;
                context.promote(txn, LockType::X)
            }
            LockType::S => context.promote(txn, LockType::X),
            // IX or SIX: escalation collapses straight to X.
            _ => context.escalate(txn),
        }
    }
}
