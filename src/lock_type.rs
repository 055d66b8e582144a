use std::fmt;

/// Lock types used for multigranularity locking. Intent locks (IS/IX) are
/// held on ancestors to signal finer-grained locks below; SIX is S + IX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// No lock held.
    NL,
    /// Intention shared.
    IS,
    /// Intention exclusive.
    IX,
    /// Shared.
    S,
    /// Exclusive.
    X,
    /// Shared with intention exclusive.
    SIX,
}

impl LockType {
    /// Whether two different transactions may hold `self` and `other` on the
    /// same resource at the same time.
    pub fn compatible_with(self, other: LockType) -> bool {
        use LockType::*;

        match (self, other) {
            (NL, _) | (_, NL) => true,
            (IS, IS) | (IS, IX) | (IS, S) => true,
            (IX, IS) | (IX, IX) => true,
            (S, IS) | (S, S) => true,
            _ => false,
        }
    }

    /// Whether holding `self` on a resource permits holding `child` on one of
    /// its children.
    pub fn can_be_parent_of(self, child: LockType) -> bool {
        use LockType::*;

        match self {
            NL => child == NL,
            IS => matches!(child, NL | IS | S),
            IX | SIX => true,
            S | X => child == NL,
        }
    }

    /// Whether a lock of type `self` can be used in place of `required`
    /// without acquiring anything new.
    pub fn substitutable_for(self, required: LockType) -> bool {
        use LockType::*;

        if self == required {
            return true;
        }
        match (self, required) {
            (_, NL) => true,
            (X, _) => true,
            (SIX, IX) | (SIX, S) | (SIX, IS) => true,
            (IX, IS) => true,
            (S, IS) => true,
            _ => false,
        }
    }

    /// IS and IX grant no access by themselves.
    pub fn is_intent(self) -> bool {
        matches!(self, LockType::IS | LockType::IX)
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
