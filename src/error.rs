//! Error types shared by the collector and its persistent-memory collaborators.

/// The result type used throughout pmgc.
pub type Result<T> = std::result::Result<T, GcError>;

/// Errors reported by GC calls. Invariant violations of the persistent free
/// lists are not represented here; they abort the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GcError {
    /// The persistent heap cannot satisfy an allocation.
    #[error("no space left in persistent pool")]
    NoSpace,

    /// A mutation was attempted outside of a persistent transaction.
    #[error("no transaction is open")]
    NoTx,

    /// The record or subtree does not exist.
    #[error("record does not exist")]
    NonExist,

    /// The handle does not refer to an open pool or container.
    #[error("invalid handle")]
    NoHandle,

    /// The target is still in use.
    #[error("resource busy: {0}")]
    Busy(String),

    /// An argument was out of range.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// The persistence layer failed to begin or commit a transaction.
    #[error("persistent memory I/O error: {0}")]
    Io(String),
}
