#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::SolEvent;
use common::events::{EventManager, Listener, LogEvent};
use parking_lot::Mutex;
use preconf_node::chain::{
    BidderRegistryContract, BlockTrackerContract, ChainError, OpenCommitmentParams, PreconfContract,
    SubmittedTx, TxReceipt, TxWatcher,
};
use preconf_node::commitments::{Commitment, CommitmentStatus, Settlement};

pub const BIDDER: Address = Address::repeat_byte(0xb1);
pub const PROVIDER: Address = Address::repeat_byte(0x77);

pub async fn publish<E: SolEvent>(listener: &Listener, event: &E, block: u64) {
    listener
        .publish_log_event(LogEvent::from_event(Address::ZERO, event, block))
        .await;
}

/// Polls `check` until it holds or about a second has passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    DepositMany(Vec<u64>, U256),
    Deposit(u64, U256),
    Withdraw(Vec<u64>),
}

#[derive(Default)]
pub struct MockRegistry {
    pub deposits: Mutex<HashMap<(Address, u64), U256>>,
    pub calls: Mutex<Vec<RegistryCall>>,
}

impl MockRegistry {
    pub fn calls(&self) -> Vec<RegistryCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: RegistryCall) -> SubmittedTx {
        let mut calls = self.calls.lock();
        calls.push(call);
        SubmittedTx {
            hash: B256::with_last_byte(calls.len() as u8),
            nonce: calls.len() as u64,
        }
    }
}

#[async_trait::async_trait]
impl BidderRegistryContract for MockRegistry {
    async fn get_deposit(&self, bidder: Address, window: u64) -> Result<U256, ChainError> {
        Ok(self
            .deposits
            .lock()
            .get(&(bidder, window))
            .copied()
            .unwrap_or_default())
    }

    async fn deposit_for_windows(&self, windows: &[u64], value: U256) -> Result<SubmittedTx, ChainError> {
        Ok(self.record(RegistryCall::DepositMany(windows.to_vec(), value)))
    }

    async fn deposit_for_window(&self, window: u64, value: U256) -> Result<SubmittedTx, ChainError> {
        Ok(self.record(RegistryCall::Deposit(window, value)))
    }

    async fn withdraw_from_windows(&self, windows: &[u64]) -> Result<SubmittedTx, ChainError> {
        Ok(self.record(RegistryCall::Withdraw(windows.to_vec())))
    }
}

pub struct MockBlockTracker {
    pub blocks_per_window: u64,
    pub current_window: u64,
}

#[async_trait::async_trait]
impl BlockTrackerContract for MockBlockTracker {
    async fn blocks_per_window(&self) -> Result<u64, ChainError> {
        Ok(self.blocks_per_window)
    }

    async fn current_window(&self) -> Result<u64, ChainError> {
        Ok(self.current_window)
    }
}

#[derive(Default)]
pub struct MockPreconf {
    pub opened: Mutex<Vec<OpenCommitmentParams>>,
}

#[async_trait::async_trait]
impl PreconfContract for MockPreconf {
    async fn open_commitment(&self, params: OpenCommitmentParams) -> Result<SubmittedTx, ChainError> {
        let mut opened = self.opened.lock();
        opened.push(params);
        Ok(SubmittedTx {
            hash: B256::with_last_byte(opened.len() as u8),
            nonce: opened.len() as u64,
        })
    }
}

pub struct MockWatcher;

#[async_trait::async_trait]
impl TxWatcher for MockWatcher {
    async fn watch_tx(&self, hash: B256, _nonce: u64) -> Result<TxReceipt, ChainError> {
        Ok(TxReceipt {
            tx_hash: hash,
            block_number: 1,
            gas_used: 50_000,
            status: true,
        })
    }
}

pub fn commitment(digest: u8, block_number: u64, index: Option<B256>) -> Commitment {
    Commitment {
        digest: B256::repeat_byte(digest),
        index,
        bidder: BIDDER,
        committer: PROVIDER,
        bid_amount: U256::from(10u64),
        slash_amount: U256::ZERO,
        block_number,
        decay_start: 1_000,
        decay_end: 2_000,
        dispatch_timestamp: 0,
        txn_hash: format!("{:064x}", digest),
        reverting_tx_hashes: String::new(),
        bid_signature: Bytes::from_static(&[1, 2, 3]),
        commitment_signature: Bytes::from_static(&[4, 5, 6]),
        shared_secret: Some(Bytes::from_static(&[7])),
        status: CommitmentStatus::Stored,
        details: String::new(),
        settlement: Settlement::default(),
    }
}
