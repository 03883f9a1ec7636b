//! Strategy error types

use thiserror::Error;

/// Result type for strategy operations
pub type StrategyResult<T> = Result<T, StrategyError>;

/// Errors from tree and strategy operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("Tree {0:?} is not known")]
    UnknownTree(String),

    #[error("Pool {pool:?} in tree {tree:?} is not known")]
    UnknownPool { tree: String, pool: String },

    #[error("Operation {0} is not registered")]
    UnknownOperation(String),

    #[error("Operation {0} is already registered")]
    OperationAlreadyRegistered(String),

    #[error("Pool {pool:?} reached its operation count limit of {limit}")]
    OperationCountLimitExceeded { pool: String, limit: usize },

    #[error("Pool {pool:?} reached its running operation count limit of {limit}")]
    RunningOperationCountLimitExceeded { pool: String, limit: usize },

    #[error("Pool {pool:?} still holds {count} operations or child pools")]
    PoolNotEmpty { pool: String, count: usize },

    #[error("Pool configuration for {pool:?} is invalid: {reason}")]
    PoolConfiguration { pool: String, reason: String },

    #[error("No tree matches node tags {tags:?}")]
    NoTreeForNode { tags: Vec<String> },

    #[error("Node tags {tags:?} match several trees: {trees:?}")]
    MultipleTreesForNode { tags: Vec<String>, trees: Vec<String> },

    #[error("Operation has no pool assignment for any tree")]
    NoTreesSpecified,
}
