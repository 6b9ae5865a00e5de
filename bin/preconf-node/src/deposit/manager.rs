//! Bid admission against bidder deposits.
//!
//! A registry deposit covers a whole window and is spread evenly over its
//! blocks. The manager keeps that per-block share as the window's base
//! balance and charges bids against a per-block overlay seeded from it, so a
//! bid never needs a chain round trip once the window is known.

use std::fmt;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use common::events::{channel, EventError, EventManager};
use common::interfaces::bidder_registry::IBidderRegistry::{BidderRegistered, BidderWithdrawal};
use common::interfaces::block_tracker::IBlockTracker::NewWindow;
use common::uint::to_u64_saturating;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::store::{BalanceStore, BlockKey, WindowBase};
use super::DepositError;
use crate::chain::{BidderRegistryContract, BlockTrackerContract};

/// Window a block belongs to. Windows and blocks are both numbered from 1.
pub fn window_for_block(block_number: u64, blocks_per_window: u64) -> Result<u64, DepositError> {
    if block_number == 0 {
        return Err(DepositError::InvalidBlock(block_number));
    }
    if blocks_per_window == 0 {
        return Err(DepositError::InvalidBlocksPerWindow);
    }
    Ok((block_number - 1) / blocks_per_window + 1)
}

pub fn parse_bid_amount(amount: &str) -> Result<U256, DepositError> {
    U256::from_str_radix(amount.trim(), 10)
        .map_err(|_| DepositError::InvalidBidAmount(amount.to_string()))
}

/// Undo handle for a successful deduction.
///
/// Dropping it keeps the deduction; [`Refund::refund`] gives the amount back
/// to the same block.
pub struct Refund {
    store: Arc<dyn BalanceStore>,
    key: BlockKey,
    amount: U256,
    remaining: U256,
}

impl Refund {
    pub fn amount(&self) -> U256 {
        self.amount
    }

    /// Block balance right after the deduction.
    pub fn remaining(&self) -> U256 {
        self.remaining
    }

    pub fn window(&self) -> u64 {
        self.key.window
    }

    pub fn refund(self) -> Result<(), DepositError> {
        if !self.store.refund_block_balance(self.key, self.amount)? {
            tracing::debug!(
                bidder = %self.key.bidder,
                window = self.key.window,
                block = self.key.block,
                "Block balance already cleared, nothing to refund"
            );
        }
        Ok(())
    }
}

impl fmt::Debug for Refund {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refund")
            .field("key", &self.key)
            .field("amount", &self.amount)
            .field("remaining", &self.remaining)
            .finish()
    }
}

enum DepositEvent {
    Registered(BidderRegistered),
    Withdrawal(BidderWithdrawal),
    NewWindow(NewWindow),
}

impl From<BidderRegistered> for DepositEvent {
    fn from(ev: BidderRegistered) -> Self {
        DepositEvent::Registered(ev)
    }
}

impl From<BidderWithdrawal> for DepositEvent {
    fn from(ev: BidderWithdrawal) -> Self {
        DepositEvent::Withdrawal(ev)
    }
}

impl From<NewWindow> for DepositEvent {
    fn from(ev: NewWindow) -> Self {
        DepositEvent::NewWindow(ev)
    }
}

pub struct DepositManager {
    store: Arc<dyn BalanceStore>,
    registry: Arc<dyn BidderRegistryContract>,
    block_tracker: Arc<dyn BlockTrackerContract>,
    events: Arc<dyn EventManager>,
    blocks_per_window: OnceCell<u64>,
    cancel_token: CancellationToken,
}

impl DepositManager {
    pub fn new(
        store: Arc<dyn BalanceStore>,
        registry: Arc<dyn BidderRegistryContract>,
        block_tracker: Arc<dyn BlockTrackerContract>,
        events: Arc<dyn EventManager>,
    ) -> Self {
        Self {
            store,
            registry,
            block_tracker,
            events,
            blocks_per_window: OnceCell::new(),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Use a fixed window length instead of asking the block tracker.
    pub fn with_blocks_per_window(self, blocks_per_window: u64) -> Self {
        Self {
            blocks_per_window: OnceCell::new_with(Some(blocks_per_window)),
            ..self
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub async fn blocks_per_window(&self) -> Result<u64, DepositError> {
        self.blocks_per_window
            .get_or_try_init(|| async {
                let blocks = self.block_tracker.blocks_per_window().await?;
                if blocks == 0 {
                    return Err(DepositError::InvalidBlocksPerWindow);
                }
                tracing::info!(blocks_per_window = blocks, "Loaded window length");
                Ok(blocks)
            })
            .await
            .copied()
    }

    /// Charges `bid_amount` wei against the bidder's balance for `block_number`.
    ///
    /// Fails with a precondition error when the bidder has no deposit for the
    /// block's window or the block balance is too low; the store is left
    /// untouched in both cases.
    pub async fn check_and_deduct_deposit(
        &self,
        bidder: Address,
        bid_amount: &str,
        block_number: u64,
    ) -> Result<Refund, DepositError> {
        let amount = parse_bid_amount(bid_amount)?;
        let blocks_per_window = self.blocks_per_window().await?;
        let window = window_for_block(block_number, blocks_per_window)?;
        let key = BlockKey {
            bidder,
            window,
            block: block_number,
        };

        // taken before any read so a withdrawal racing this bid invalidates it
        let generation = self.store.withdrawal_generation(bidder, window)?;
        let base = match self.store.block_balance(key)? {
            Some(_) => None,
            None => self
                .window_base(bidder, window, blocks_per_window, generation)
                .await?
                .map(|per_block| WindowBase { per_block, generation }),
        };

        let remaining = self
            .store
            .deduct_block_balance(key, base, amount)
            .inspect_err(|e| {
                tracing::debug!(%bidder, window, block = block_number, %amount, error = %e, "Bid rejected");
            })?;

        tracing::debug!(%bidder, window, block = block_number, %amount, %remaining, "Deducted bid amount");
        Ok(Refund {
            store: Arc::clone(&self.store),
            key,
            amount,
            remaining,
        })
    }

    /// Per-block base balance of a window, read through to the registry.
    /// A registry read overtaken by a withdrawal counts as no deposit.
    async fn window_base(
        &self,
        bidder: Address,
        window: u64,
        blocks_per_window: u64,
        generation: u64,
    ) -> Result<Option<U256>, DepositError> {
        if let Some(base) = self.store.window_balance(bidder, window)? {
            return Ok(Some(base));
        }

        let deposit = self.registry.get_deposit(bidder, window).await?;
        let per_block = deposit / U256::from(blocks_per_window);
        if per_block.is_zero() {
            return Ok(None);
        }

        let read = WindowBase { per_block, generation };
        if !self.store.cache_window_balance(bidder, window, read)? {
            tracing::debug!(%bidder, window, %deposit, "Withdrawal during registry read, discarding balance");
            return Ok(None);
        }
        tracing::debug!(%bidder, window, %deposit, %per_block, "Cached window balance from registry");
        Ok(Some(per_block))
    }

    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<eyre::Result<()>>, EventError> {
        let cancel = self.cancel_token.clone();
        let (tx, mut inbox) = mpsc::channel::<DepositEvent>(64);

        let mut subscription = self.events.subscribe(vec![
            channel::<BidderRegistered, DepositEvent>(tx.clone(), cancel.clone()),
            channel::<BidderWithdrawal, DepositEvent>(tx.clone(), cancel.clone()),
            channel::<NewWindow, DepositEvent>(tx, cancel.clone()),
        ])?;

        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            tracing::info!("Deposit manager started");
            let result = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break Ok(()),
                    Some(err) = subscription.err() => {
                        break Err(eyre::Report::new(err).wrap_err("deposit manager subscription failed"));
                    }
                    Some(event) = inbox.recv() => {
                        if let Err(e) = this.handle_event(event).await {
                            tracing::error!(error = %e, "Failed to apply deposit event");
                        }
                    }
                }
            };
            tracing::info!("Deposit manager stopped");
            result
        }))
    }

    async fn handle_event(&self, event: DepositEvent) -> Result<(), DepositError> {
        match event {
            DepositEvent::Registered(ev) => {
                let window = to_u64_saturating(ev.windowNumber);
                let blocks_per_window = self.blocks_per_window().await?;
                let per_block = ev.depositedAmount / U256::from(blocks_per_window);
                self.store.set_window_balance(ev.bidder, window, per_block)?;
                tracing::info!(
                    bidder = %ev.bidder,
                    window,
                    deposited = %ev.depositedAmount,
                    %per_block,
                    "Bidder registered"
                );
            }
            DepositEvent::Withdrawal(ev) => {
                let window = to_u64_saturating(ev.window);
                self.store.remove_window_balance(ev.bidder, window)?;
                let overlays = self.store.remove_block_balances(ev.bidder, window)?;
                tracing::info!(
                    bidder = %ev.bidder,
                    window,
                    amount = %ev.amount,
                    overlays,
                    "Bidder withdrew"
                );
            }
            DepositEvent::NewWindow(ev) => {
                let window = to_u64_saturating(ev.window);
                let cleared = self.store.clear_balances(window.saturating_sub(1))?;
                tracing::debug!(window, cleared, "New window, cleared stale balances");
            }
        }
        Ok(())
    }
}
