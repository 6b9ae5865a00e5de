use std::collections::{BTreeMap, HashMap};

use alloy_primitives::{Address, U256};
use parking_lot::Mutex;

use super::DepositError;
use crate::storage::StoreError;

/// Identifies one block's spendable balance for a bidder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub bidder: Address,
    pub window: u64,
    pub block: u64,
}

/// A window's per-block base balance, as read at one withdrawal generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBase {
    pub per_block: U256,
    pub generation: u64,
}

/// Per-window base balances and the per-block overlays derived from them.
///
/// Every withdrawal bumps the (bidder, window) generation. A base read before
/// the bump is never cached and never seeds an overlay after it.
pub trait BalanceStore: Send + Sync {
    fn window_balance(&self, bidder: Address, window: u64) -> Result<Option<U256>, StoreError>;

    fn set_window_balance(&self, bidder: Address, window: u64, per_block: U256) -> Result<(), StoreError>;

    /// Caches a base read from the registry unless a withdrawal happened
    /// since `generation` was taken. Returns false if it was discarded.
    fn cache_window_balance(&self, bidder: Address, window: u64, base: WindowBase) -> Result<bool, StoreError>;

    /// Removes the base balance and bumps the withdrawal generation.
    fn remove_window_balance(&self, bidder: Address, window: u64) -> Result<Option<U256>, StoreError>;

    fn withdrawal_generation(&self, bidder: Address, window: u64) -> Result<u64, StoreError>;

    fn block_balance(&self, key: BlockKey) -> Result<Option<U256>, StoreError>;

    /// Deducts `amount` from the block overlay, creating it from `base` when
    /// it does not exist yet and its generation is still current. Leaves the
    /// store untouched on failure.
    fn deduct_block_balance(&self, key: BlockKey, base: Option<WindowBase>, amount: U256)
        -> Result<U256, DepositError>;

    /// Adds `amount` back to an existing overlay. Returns false if the overlay
    /// is gone, e.g. because its window was cleared.
    fn refund_block_balance(&self, key: BlockKey, amount: U256) -> Result<bool, StoreError>;

    /// Drops every overlay of one bidder in one window.
    fn remove_block_balances(&self, bidder: Address, window: u64) -> Result<usize, StoreError>;

    /// Drops overlays, base balances and generations of every window below
    /// `window`.
    fn clear_balances(&self, window: u64) -> Result<usize, StoreError>;
}

#[derive(Default)]
pub struct InMemoryBalanceStore {
    windows: Mutex<BTreeMap<u64, HashMap<Address, U256>>>,
    blocks: Mutex<BTreeMap<u64, HashMap<(Address, u64), U256>>>,
    // always locked last
    generations: Mutex<BTreeMap<u64, HashMap<Address, u64>>>,
}

impl InMemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Windows that still hold at least one block overlay.
    pub fn overlay_windows(&self) -> Vec<u64> {
        self.blocks.lock().keys().copied().collect()
    }

    fn generation(&self, bidder: Address, window: u64) -> u64 {
        self.generations
            .lock()
            .get(&window)
            .and_then(|w| w.get(&bidder))
            .copied()
            .unwrap_or(0)
    }
}

impl BalanceStore for InMemoryBalanceStore {
    fn window_balance(&self, bidder: Address, window: u64) -> Result<Option<U256>, StoreError> {
        Ok(self
            .windows
            .lock()
            .get(&window)
            .and_then(|w| w.get(&bidder))
            .copied())
    }

    fn set_window_balance(&self, bidder: Address, window: u64, per_block: U256) -> Result<(), StoreError> {
        self.windows
            .lock()
            .entry(window)
            .or_default()
            .insert(bidder, per_block);
        Ok(())
    }

    fn cache_window_balance(&self, bidder: Address, window: u64, base: WindowBase) -> Result<bool, StoreError> {
        let mut windows = self.windows.lock();
        if self.generation(bidder, window) != base.generation {
            return Ok(false);
        }
        windows
            .entry(window)
            .or_default()
            .entry(bidder)
            .or_insert(base.per_block);
        Ok(true)
    }

    fn remove_window_balance(&self, bidder: Address, window: u64) -> Result<Option<U256>, StoreError> {
        let mut windows = self.windows.lock();
        *self
            .generations
            .lock()
            .entry(window)
            .or_default()
            .entry(bidder)
            .or_insert(0) += 1;

        let Some(balances) = windows.get_mut(&window) else {
            return Ok(None);
        };
        let removed = balances.remove(&bidder);
        if balances.is_empty() {
            windows.remove(&window);
        }
        Ok(removed)
    }

    fn withdrawal_generation(&self, bidder: Address, window: u64) -> Result<u64, StoreError> {
        Ok(self.generation(bidder, window))
    }

    fn block_balance(&self, key: BlockKey) -> Result<Option<U256>, StoreError> {
        Ok(self
            .blocks
            .lock()
            .get(&key.window)
            .and_then(|w| w.get(&(key.bidder, key.block)))
            .copied())
    }

    fn deduct_block_balance(
        &self,
        key: BlockKey,
        base: Option<WindowBase>,
        amount: U256,
    ) -> Result<U256, DepositError> {
        let mut blocks = self.blocks.lock();
        let current = blocks
            .get(&key.window)
            .and_then(|w| w.get(&(key.bidder, key.block)))
            .copied();

        let available = match (current, base) {
            (Some(balance), _) => balance,
            (None, Some(base))
                if !base.per_block.is_zero() && self.generation(key.bidder, key.window) == base.generation =>
            {
                base.per_block
            }
            (None, _) => {
                return Err(DepositError::NoDeposit {
                    bidder: key.bidder,
                    window: key.window,
                })
            }
        };

        let remaining = available
            .checked_sub(amount)
            .ok_or(DepositError::InsufficientBalance {
                bidder: key.bidder,
                block: key.block,
                available,
                required: amount,
            })?;

        blocks
            .entry(key.window)
            .or_default()
            .insert((key.bidder, key.block), remaining);
        Ok(remaining)
    }

    fn refund_block_balance(&self, key: BlockKey, amount: U256) -> Result<bool, StoreError> {
        let mut blocks = self.blocks.lock();
        let Some(balance) = blocks
            .get_mut(&key.window)
            .and_then(|w| w.get_mut(&(key.bidder, key.block)))
        else {
            return Ok(false);
        };
        *balance = balance.saturating_add(amount);
        Ok(true)
    }

    fn remove_block_balances(&self, bidder: Address, window: u64) -> Result<usize, StoreError> {
        let mut blocks = self.blocks.lock();
        let Some(overlays) = blocks.get_mut(&window) else {
            return Ok(0);
        };
        let before = overlays.len();
        overlays.retain(|(b, _), _| *b != bidder);
        let removed = before - overlays.len();
        if overlays.is_empty() {
            blocks.remove(&window);
        }
        Ok(removed)
    }

    fn clear_balances(&self, window: u64) -> Result<usize, StoreError> {
        let cleared = {
            let mut blocks = self.blocks.lock();
            let kept = blocks.split_off(&window);
            let cleared: usize = blocks.values().map(HashMap::len).sum();
            *blocks = kept;
            cleared
        };

        let mut windows = self.windows.lock();
        let kept = windows.split_off(&window);
        *windows = kept;

        let mut generations = self.generations.lock();
        let kept = generations.split_off(&window);
        *generations = kept;
        Ok(cleared)
    }
}
