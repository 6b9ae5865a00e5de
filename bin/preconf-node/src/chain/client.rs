//! alloy-backed implementation of the chain capabilities.

use alloy::providers::Provider;
use alloy::rpc::types::{Filter, TransactionRequest};
use alloy_primitives::{Address, U256};
use alloy_sol_types::SolCall;
use common::events::{ChainClient, LogEvent, LogFilter, QueryError};
use common::interfaces::bidder_registry::IBidderRegistry;
use common::interfaces::block_tracker::IBlockTracker;
use common::interfaces::preconf_manager::IPreconfManager;
use common::uint::{to_u64_saturating, windows_to_u256};

use super::contracts::{
    BidderRegistryContract, BlockTrackerContract, ContractAddresses, OpenCommitmentParams,
    PreconfContract, SubmittedTx,
};
use super::ChainError;

/// Reads and writes the node's contracts through one signing provider.
pub struct RpcClient<P> {
    provider: P,
    addresses: ContractAddresses,
    sender: Address,
}

impl<P> RpcClient<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    pub fn new(provider: P, addresses: ContractAddresses, sender: Address) -> Self {
        Self {
            provider,
            addresses,
            sender,
        }
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    pub fn addresses(&self) -> &ContractAddresses {
        &self.addresses
    }

    async fn view<C: SolCall>(&self, to: Address, call: C) -> Result<C::Return, ChainError> {
        let tx = TransactionRequest::default()
            .to(to)
            .input(call.abi_encode().into());

        let result = self
            .provider
            .call(tx)
            .await
            .map_err(|e| ChainError::Call(format!("{}: {}", C::SIGNATURE, e)))?;

        C::abi_decode_returns(&result)
            .map_err(|e| ChainError::Call(format!("{}: {}", C::SIGNATURE, e)))
    }

    async fn submit<C: SolCall>(&self, to: Address, call: C, value: U256) -> Result<SubmittedTx, ChainError> {
        let nonce = self
            .provider
            .get_transaction_count(self.sender)
            .pending()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        let tx = TransactionRequest::default()
            .from(self.sender)
            .to(to)
            .value(value)
            .nonce(nonce)
            .input(call.abi_encode().into());

        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(|e| ChainError::Submission(format!("{}: {}", C::SIGNATURE, e)))?;
        let hash = *pending.tx_hash();

        tracing::debug!(method = C::SIGNATURE, %to, %hash, nonce, %value, "Transaction sent");

        Ok(SubmittedTx { hash, nonce })
    }
}

#[async_trait::async_trait]
impl<P> ChainClient for RpcClient<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    async fn block_number(&self) -> Result<u64, QueryError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()).into())
    }

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<LogEvent>, QueryError> {
        let query = Filter::new()
            .address(filter.addresses.clone())
            .from_block(filter.from_block)
            .to_block(filter.to_block);

        let logs = self
            .provider
            .get_logs(&query)
            .await
            .map_err(|e| QueryError::from(ChainError::Rpc(e.to_string())))?;

        let mut events: Vec<LogEvent> = logs.into_iter().map(LogEvent::from).collect();
        events.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(events)
    }
}

#[async_trait::async_trait]
impl<P> BlockTrackerContract for RpcClient<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    async fn blocks_per_window(&self) -> Result<u64, ChainError> {
        let blocks = self
            .view(
                self.addresses.block_tracker,
                IBlockTracker::getBlocksPerWindowCall {},
            )
            .await?;
        Ok(to_u64_saturating(blocks))
    }

    async fn current_window(&self) -> Result<u64, ChainError> {
        let window = self
            .view(
                self.addresses.block_tracker,
                IBlockTracker::getCurrentWindowCall {},
            )
            .await?;
        Ok(to_u64_saturating(window))
    }
}

#[async_trait::async_trait]
impl<P> BidderRegistryContract for RpcClient<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    async fn get_deposit(&self, bidder: Address, window: u64) -> Result<U256, ChainError> {
        self.view(
            self.addresses.bidder_registry,
            IBidderRegistry::getDepositCall {
                bidder,
                window: U256::from(window),
            },
        )
        .await
    }

    async fn deposit_for_windows(&self, windows: &[u64], value: U256) -> Result<SubmittedTx, ChainError> {
        self.submit(
            self.addresses.bidder_registry,
            IBidderRegistry::depositForWindowsCall {
                windows: windows_to_u256(windows),
            },
            value,
        )
        .await
    }

    async fn deposit_for_window(&self, window: u64, value: U256) -> Result<SubmittedTx, ChainError> {
        self.submit(
            self.addresses.bidder_registry,
            IBidderRegistry::depositForWindowCall {
                window: U256::from(window),
            },
            value,
        )
        .await
    }

    async fn withdraw_from_windows(&self, windows: &[u64]) -> Result<SubmittedTx, ChainError> {
        self.submit(
            self.addresses.bidder_registry,
            IBidderRegistry::withdrawFromWindowsCall {
                windows: windows_to_u256(windows),
            },
            U256::ZERO,
        )
        .await
    }
}

#[async_trait::async_trait]
impl<P> PreconfContract for RpcClient<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    async fn open_commitment(&self, params: OpenCommitmentParams) -> Result<SubmittedTx, ChainError> {
        let call = IPreconfManager::openCommitmentCall {
            unopenedCommitmentIndex: params.commitment_index,
            bidAmt: params.bid_amount,
            slashAmt: params.slash_amount,
            blockNumber: params.block_number,
            txnHash: params.txn_hash,
            revertingTxHashes: params.reverting_tx_hashes,
            decayStartTimeStamp: params.decay_start,
            decayEndTimeStamp: params.decay_end,
            bidSignature: params.bid_signature,
            commitmentSignature: params.commitment_signature,
            sharedSecretKey: params.shared_secret,
        };
        self.submit(self.addresses.preconf_manager, call, U256::ZERO)
            .await
    }
}
