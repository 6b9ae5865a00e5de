//! Chain access: contract capabilities, their alloy implementation and a
//! receipt watcher.

mod client;
pub mod contracts;
mod errors;
mod watcher;

pub use client::RpcClient;
pub use contracts::{
    BidderRegistryContract, BlockTrackerContract, ContractAddresses, OpenCommitmentParams,
    PreconfContract, SubmittedTx, TxReceipt, TxWatcher,
};
pub use errors::ChainError;
pub use watcher::{ReceiptWatcher, WatcherConfig};
