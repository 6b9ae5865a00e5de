//! Error types for chain access

use alloy_primitives::B256;
use common::events::QueryError;

/// Errors that can occur during chain operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("contract call failed: {0}")]
    Call(String),

    #[error("transaction submission failed: {0}")]
    Submission(String),

    #[error("transaction {hash} reverted")]
    Reverted { hash: B256 },

    #[error("transaction {hash} dropped, nonce {nonce} was consumed by another transaction")]
    Dropped { hash: B256, nonce: u64 },

    #[error("timed out waiting for receipt of {hash}")]
    Timeout { hash: B256 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<ChainError> for QueryError {
    fn from(err: ChainError) -> Self {
        QueryError(err.to_string())
    }
}
