//! Errors surfaced to callers of map operations.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    /// The key is absent or expired on every owner that answered.
    #[error("key not found")]
    NotFound,

    #[error("quorum not reached: need {needed}, got {got}")]
    QuorumNotReached { needed: usize, got: usize },

    /// The key is locked by another session, or an unlock came from a
    /// session that does not hold the lock.
    #[error("lock conflict")]
    LockConflict,

    /// The contacted node was not an owner even after a table refresh.
    #[error("partition ownership is stale")]
    StaleOwnership,

    #[error("not enough members: need {needed}, got {got}")]
    MembershipInsufficient { needed: usize, got: usize },

    #[error("migration of partition {0} failed")]
    MigrationFailed(u64),

    #[error("value is not an integer")]
    NotAnInteger,

    #[error("node is shutting down")]
    ShuttingDown,

    #[error("operation timed out")]
    Timeout,

    /// A peer answered with a response that does not match the request.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}
