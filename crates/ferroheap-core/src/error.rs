//! Error taxonomy and the abort-versus-proceed policy.

use thiserror::Error;

use crate::mem::AccessFault;
use crate::os::SystemFailure;

/// Everything that can go wrong inside a heap operation.
///
/// Allocation failures are part of the normal contract and surface as a
/// `None` return from the public API. Usage errors and corruption are caller
/// bugs; what happens to them is decided by the arena's [`ErrorPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The system is out of address space or the request exceeds the
    /// implementation ceiling. Recoverable; never fatal.
    #[error("allocation of {requested} bytes failed")]
    AllocationFailed { requested: usize },

    /// The caller handed back a pointer the arena does not recognize as a
    /// live allocation (foreign, already freed, or misaligned).
    #[error("usage error at {addr:#x}: {reason}")]
    UsageError { addr: usize, reason: &'static str },

    /// Bookkeeping read back from the heap contradicts itself: a bad link,
    /// a failed footer tag, or an out-of-range chunk offset.
    #[error("heap corruption at {addr:#x}: {what}")]
    Corruption { addr: usize, what: &'static str },

    /// The page source refused an operation.
    #[error("page source: {0}")]
    System(#[from] SystemFailure),
}

impl From<AccessFault> for HeapError {
    fn from(fault: AccessFault) -> Self {
        HeapError::Corruption {
            addr: fault.addr,
            what: "chunk offset outside mapped space",
        }
    }
}

impl HeapError {
    /// True for errors that indicate a caller bug or damaged bookkeeping,
    /// as opposed to ordinary exhaustion.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HeapError::UsageError { .. } | HeapError::Corruption { .. }
        )
    }
}

/// What an arena does when it detects a usage error or corruption.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Abort the process (panic). Corrupted bookkeeping downstream is worse
    /// than a hard stop, so this is the default.
    #[default]
    Abort,
    /// Drop the offending request and reset the arena's free structures to
    /// a safe empty state, sacrificing that arena's freed memory so the
    /// process can keep running.
    Proceed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_split() {
        assert!(!HeapError::AllocationFailed { requested: 8 }.is_fatal());
        assert!(!HeapError::System(SystemFailure::OutOfSpace).is_fatal());
        assert!(
            HeapError::UsageError {
                addr: 0x10,
                reason: "not in use"
            }
            .is_fatal()
        );
        assert!(
            HeapError::Corruption {
                addr: 0x10,
                what: "bad link"
            }
            .is_fatal()
        );
    }

    #[test]
    fn default_policy_aborts() {
        assert_eq!(ErrorPolicy::default(), ErrorPolicy::Abort);
    }
}
