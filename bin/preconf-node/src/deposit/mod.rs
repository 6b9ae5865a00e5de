//! Window/block deposit ledger used to admit bids.

mod manager;
mod store;

use alloy_primitives::{Address, U256};

use crate::chain::ChainError;
use crate::storage::StoreError;

pub use manager::{parse_bid_amount, window_for_block, DepositManager, Refund};
pub use store::{BalanceStore, BlockKey, InMemoryBalanceStore, WindowBase};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DepositError {
    #[error("invalid bid amount {0:?}")]
    InvalidBidAmount(String),

    #[error("invalid block number {0}")]
    InvalidBlock(u64),

    #[error("blocks per window must be positive")]
    InvalidBlocksPerWindow,

    #[error("no deposit for bidder {bidder} in window {window}")]
    NoDeposit { bidder: Address, window: u64 },

    #[error("insufficient balance for bidder {bidder} at block {block}: available {available}, required {required}")]
    InsufficientBalance {
        bidder: Address,
        block: u64,
        available: U256,
        required: U256,
    },

    #[error("registry query failed: {0}")]
    Registry(#[from] ChainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DepositError {
    /// The bid cannot be admitted with the bidder's current deposit.
    pub fn is_failed_precondition(&self) -> bool {
        matches!(
            self,
            DepositError::NoDeposit { .. } | DepositError::InsufficientBalance { .. }
        )
    }

    /// The request itself is malformed.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, DepositError::InvalidBidAmount(_))
    }

    /// No deposit exists at all, as opposed to one that is too low.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DepositError::NoDeposit { .. })
    }
}
