use thiserror::Error;

/// Failure to produce an embedding. Always a degraded-input condition:
/// callers fall back to scoring without similarity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmbedError {
    #[error("cannot embed empty text")]
    EmptyInput,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),
}

/// Not-found and naming failures from temporal-memory branch operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrmError {
    #[error("branch '{0}' already exists")]
    BranchExists(String),
    #[error("unknown branch '{0}'")]
    UnknownBranch(String),
    #[error("unknown commit '{commit}' on branch '{branch}'")]
    UnknownCommit { branch: String, commit: String },
    #[error("cannot merge branch '{0}' into itself")]
    SelfMerge(String),
}
