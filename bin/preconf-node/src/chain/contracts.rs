//! Contract capabilities the node's components depend on.
//!
//! Components take these as trait objects so tests can substitute in-memory
//! fakes; [`super::RpcClient`] implements all of them over an alloy provider.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

use super::ChainError;

/// Addresses of the contracts the node talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContractAddresses {
    pub block_tracker: Address,
    pub bidder_registry: Address,
    pub preconf_manager: Address,
    pub oracle: Address,
}

impl ContractAddresses {
    pub fn all(&self) -> Vec<Address> {
        vec![
            self.block_tracker,
            self.bidder_registry,
            self.preconf_manager,
            self.oracle,
        ]
    }
}

/// A transaction accepted by the node, not yet mined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedTx {
    pub hash: B256,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub gas_used: u64,
    pub status: bool,
}

/// Arguments of `openCommitment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenCommitmentParams {
    pub commitment_index: B256,
    pub bid_amount: U256,
    pub slash_amount: U256,
    pub block_number: u64,
    pub txn_hash: String,
    pub reverting_tx_hashes: String,
    pub decay_start: u64,
    pub decay_end: u64,
    pub bid_signature: Bytes,
    pub commitment_signature: Bytes,
    pub shared_secret: Bytes,
}

#[async_trait::async_trait]
pub trait BlockTrackerContract: Send + Sync {
    async fn blocks_per_window(&self) -> Result<u64, ChainError>;

    async fn current_window(&self) -> Result<u64, ChainError>;
}

#[async_trait::async_trait]
pub trait BidderRegistryContract: Send + Sync {
    async fn get_deposit(&self, bidder: Address, window: u64) -> Result<U256, ChainError>;

    /// Deposits `value` split evenly across `windows`.
    async fn deposit_for_windows(&self, windows: &[u64], value: U256) -> Result<SubmittedTx, ChainError>;

    async fn deposit_for_window(&self, window: u64, value: U256) -> Result<SubmittedTx, ChainError>;

    async fn withdraw_from_windows(&self, windows: &[u64]) -> Result<SubmittedTx, ChainError>;
}

#[async_trait::async_trait]
pub trait PreconfContract: Send + Sync {
    async fn open_commitment(&self, params: OpenCommitmentParams) -> Result<SubmittedTx, ChainError>;
}

/// Waits for a submitted transaction to be mined.
///
/// Resolves to the receipt of a successful transaction. A revert, a nonce
/// consumed by another transaction, or a timeout are errors.
#[async_trait::async_trait]
pub trait TxWatcher: Send + Sync {
    async fn watch_tx(&self, hash: B256, nonce: u64) -> Result<TxReceipt, ChainError>;
}
