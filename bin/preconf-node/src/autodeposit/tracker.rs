//! Keeps a bidder's deposit rolling ahead of the oracle.
//!
//! After an initial deposit into two consecutive windows, every `NewWindow(w)`
//! withdraws the tracked windows below `w` in one transaction and deposits
//! into `w + offset + 1` unless that window already holds a deposit.
//! Transaction failures are logged and leave the affected windows as they
//! were; nothing is retried.

use std::sync::Arc;

use alloy_primitives::{Address, U256};
use common::events::{channel, EventError, EventManager};
use common::interfaces::block_tracker::IBlockTracker::NewWindow;
use common::uint::to_u64_saturating;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::store::DepositStore;
use crate::chain::{BidderRegistryContract, BlockTrackerContract, ChainError, SubmittedTx};
use crate::storage::StoreError;

/// `NewWindow` events lag the window in progress by this many windows. The
/// bidder block lag in the commitment tracker rests on the same cadence.
pub const ORACLE_WINDOW_OFFSET: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AutoDepositError {
    #[error("auto deposit tracker is already running")]
    AlreadyRunning,

    #[error("auto deposit tracker is not running")]
    NotRunning,

    #[error("failed to get current window: {0}")]
    CurrentWindow(ChainError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Subscribe(#[from] EventError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoDepositStatus {
    pub windows: Vec<u64>,
    pub is_working: bool,
    pub current_oracle_window: Option<u64>,
}

#[derive(Default)]
struct RunState {
    running: bool,
    generation: u64,
    cancel: Option<CancellationToken>,
}

pub struct AutoDepositTracker {
    owner: Address,
    oracle_window_offset: u64,
    store: Arc<dyn DepositStore>,
    registry: Arc<dyn BidderRegistryContract>,
    block_tracker: Arc<dyn BlockTrackerContract>,
    events: Arc<dyn EventManager>,
    state: Mutex<RunState>,
    current_oracle_window: Mutex<Option<u64>>,
}

impl AutoDepositTracker {
    pub fn new(
        owner: Address,
        store: Arc<dyn DepositStore>,
        registry: Arc<dyn BidderRegistryContract>,
        block_tracker: Arc<dyn BlockTrackerContract>,
        events: Arc<dyn EventManager>,
    ) -> Self {
        Self {
            owner,
            oracle_window_offset: ORACLE_WINDOW_OFFSET,
            store,
            registry,
            block_tracker,
            events,
            state: Mutex::new(RunState::default()),
            current_oracle_window: Mutex::new(None),
        }
    }

    pub fn with_oracle_window_offset(mut self, offset: u64) -> Self {
        self.oracle_window_offset = offset;
        self
    }

    pub fn is_working(&self) -> bool {
        self.state.lock().running
    }

    /// Deposits `amount` into `start_window` and the one after it, then keeps
    /// depositing ahead on every new window until stopped.
    ///
    /// Without a start window the deposit begins `offset` windows past the
    /// block tracker's current window.
    pub async fn start(self: &Arc<Self>, start_window: Option<u64>, amount: U256) -> Result<(), AutoDepositError> {
        let (generation, cancel) = {
            let mut state = self.state.lock();
            if state.running {
                return Err(AutoDepositError::AlreadyRunning);
            }
            state.running = true;
            state.generation += 1;
            let cancel = CancellationToken::new();
            state.cancel = Some(cancel.clone());
            (state.generation, cancel)
        };

        let result = self.launch(generation, cancel.clone(), start_window, amount).await;
        if result.is_err() {
            cancel.cancel();
            self.finish(generation);
        }
        result
    }

    async fn launch(
        self: &Arc<Self>,
        generation: u64,
        cancel: CancellationToken,
        start_window: Option<u64>,
        amount: U256,
    ) -> Result<(), AutoDepositError> {
        let current = self
            .block_tracker
            .current_window()
            .await
            .map_err(AutoDepositError::CurrentWindow)?;
        *self.current_oracle_window.lock() = Some(current);

        if let Err(e) = self.withdraw_past_windows(current).await {
            tracing::error!(window = current, error = %e, "Failed to withdraw from past windows");
        }

        let start_window = start_window.unwrap_or(current + self.oracle_window_offset);

        let (tx, mut windows) = mpsc::channel::<NewWindow>(1);
        let mut subscription = self
            .events
            .subscribe(vec![channel::<NewWindow, NewWindow>(tx, cancel.clone())])?;

        self.initial_deposit(start_window, amount).await?;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(start_window, %amount, "Auto deposit tracker started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(err) = subscription.err() => {
                        tracing::error!(error = %err, "Auto deposit subscription failed");
                        break;
                    }
                    Some(event) = windows.recv() => {
                        this.handle_new_window(to_u64_saturating(event.window), amount).await;
                    }
                }
            }
            drop(subscription);
            this.finish(generation);
            tracing::info!("Auto deposit tracker stopped");
        });
        Ok(())
    }

    fn finish(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.running = false;
            state.cancel = None;
        }
    }

    /// Stops the background loop and returns the windows still holding a
    /// deposit. Does not withdraw them.
    pub fn stop(&self) -> Result<Vec<u64>, AutoDepositError> {
        {
            let mut state = self.state.lock();
            if !state.running {
                return Err(AutoDepositError::NotRunning);
            }
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
            state.running = false;
        }

        let windows = self.store.list_deposits(None).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to list deposits");
            Vec::new()
        });
        tracing::info!(windows_to_withdraw = ?windows, "Stopped auto deposit tracker");
        Ok(windows)
    }

    pub fn status(&self) -> Result<AutoDepositStatus, AutoDepositError> {
        Ok(AutoDepositStatus {
            windows: self.store.list_deposits(None)?,
            is_working: self.is_working(),
            current_oracle_window: *self.current_oracle_window.lock(),
        })
    }

    /// Withdraws the given windows in one transaction and stops tracking them.
    pub async fn withdraw(&self, windows: &[u64]) -> Result<SubmittedTx, AutoDepositError> {
        let tx = self.registry.withdraw_from_windows(windows).await?;
        tracing::info!(tx_hash = %tx.hash, ?windows, "Withdrew from windows");
        self.store.clear_deposits(windows)?;
        Ok(tx)
    }

    async fn handle_new_window(&self, window: u64, amount: U256) {
        tracing::debug!(window, "New window");
        *self.current_oracle_window.lock() = Some(window);

        if let Err(e) = self.withdraw_past_windows(window).await {
            tracing::error!(window, error = %e, "Failed to withdraw from past windows");
        }

        let next_window = window + self.oracle_window_offset + 1;
        if self.is_deposited(next_window).await {
            return;
        }

        match self.registry.deposit_for_window(next_window, amount).await {
            Ok(tx) => {
                tracing::info!(tx_hash = %tx.hash, window = next_window, %amount, "Deposited to next window");
                if let Err(e) = self.store.store_deposits(&[next_window]) {
                    tracing::error!(window = next_window, error = %e, "Failed to record deposit");
                }
            }
            Err(e) => {
                tracing::error!(window = next_window, error = %e, "Failed to deposit to next window");
            }
        }
    }

    async fn withdraw_past_windows(&self, current: u64) -> Result<(), AutoDepositError> {
        let Some(last) = current.checked_sub(1) else {
            return Ok(());
        };
        let windows = self.store.list_deposits(Some(last))?;
        if windows.is_empty() {
            return Ok(());
        }

        tracing::info!(?windows, "Withdrawing from past windows");
        self.withdraw(&windows).await?;
        Ok(())
    }

    async fn initial_deposit(&self, start_window: u64, amount: U256) -> Result<(), AutoDepositError> {
        let mut windows = Vec::with_capacity(2);
        for window in [start_window, start_window + 1] {
            if !self.is_deposited(window).await {
                windows.push(window);
            }
        }
        if windows.is_empty() {
            tracing::info!(start_window, "Initial windows already funded");
            return Ok(());
        }

        let value = amount * U256::from(windows.len());
        let tx = self.registry.deposit_for_windows(&windows, value).await?;
        tracing::info!(tx_hash = %tx.hash, ?windows, %value, "Initial deposit");
        self.store.store_deposits(&windows)?;
        Ok(())
    }

    /// Falls back to the registry when the local record is missing, e.g. after
    /// a restart that lost it.
    async fn is_deposited(&self, window: u64) -> bool {
        match self.store.is_deposit_made(window) {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => tracing::warn!(window, error = %e, "Failed to read deposit record"),
        }

        match self.registry.get_deposit(self.owner, window).await {
            Ok(deposit) if !deposit.is_zero() => {
                if let Err(e) = self.store.store_deposits(&[window]) {
                    tracing::warn!(window, error = %e, "Failed to record existing deposit");
                }
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::error!(window, error = %e, "Failed to get deposit");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodeposit::InMemoryDepositStore;
    use alloy_primitives::B256;
    use common::events::{Listener, LogEvent};
    use common::interfaces::known_contracts;
    use std::collections::{BTreeSet, HashMap};
    use std::time::Duration;

    const OWNER: Address = Address::repeat_byte(0xa1);

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        DepositMany(Vec<u64>, U256),
        Deposit(u64, U256),
        Withdraw(Vec<u64>),
    }

    #[derive(Default)]
    struct FakeRegistry {
        on_chain: Mutex<HashMap<u64, U256>>,
        calls: Mutex<Vec<Call>>,
        fail_withdraw: std::sync::atomic::AtomicBool,
    }

    impl FakeRegistry {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn tx(&self) -> SubmittedTx {
            let nonce = self.calls.lock().len() as u64;
            SubmittedTx {
                hash: B256::with_last_byte(nonce as u8),
                nonce,
            }
        }
    }

    #[async_trait::async_trait]
    impl BidderRegistryContract for FakeRegistry {
        async fn get_deposit(&self, bidder: Address, window: u64) -> Result<U256, ChainError> {
            assert_eq!(bidder, OWNER);
            Ok(self.on_chain.lock().get(&window).copied().unwrap_or_default())
        }

        async fn deposit_for_windows(&self, windows: &[u64], value: U256) -> Result<SubmittedTx, ChainError> {
            self.calls.lock().push(Call::DepositMany(windows.to_vec(), value));
            Ok(self.tx())
        }

        async fn deposit_for_window(&self, window: u64, value: U256) -> Result<SubmittedTx, ChainError> {
            self.calls.lock().push(Call::Deposit(window, value));
            Ok(self.tx())
        }

        async fn withdraw_from_windows(&self, windows: &[u64]) -> Result<SubmittedTx, ChainError> {
            if self.fail_withdraw.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ChainError::Submission("nonce too low".into()));
            }
            self.calls.lock().push(Call::Withdraw(windows.to_vec()));
            Ok(self.tx())
        }
    }

    struct FixedTracker(Result<u64, ChainError>);

    #[async_trait::async_trait]
    impl BlockTrackerContract for FixedTracker {
        async fn blocks_per_window(&self) -> Result<u64, ChainError> {
            Ok(10)
        }

        async fn current_window(&self) -> Result<u64, ChainError> {
            self.0.clone()
        }
    }

    struct Harness {
        tracker: Arc<AutoDepositTracker>,
        registry: Arc<FakeRegistry>,
        store: Arc<InMemoryDepositStore>,
        listener: Arc<Listener>,
    }

    fn harness(current_window: Result<u64, ChainError>) -> Harness {
        let registry = Arc::new(FakeRegistry::default());
        let store = Arc::new(InMemoryDepositStore::new());
        let listener = Arc::new(Listener::new(known_contracts()));
        let tracker = Arc::new(AutoDepositTracker::new(
            OWNER,
            store.clone(),
            registry.clone(),
            Arc::new(FixedTracker(current_window)),
            listener.clone(),
        ));
        Harness {
            tracker,
            registry,
            store,
            listener,
        }
    }

    async fn new_window(listener: &Listener, window: u64) {
        let event = NewWindow {
            window: U256::from(window),
        };
        listener
            .publish_log_event(LogEvent::from_event(Address::ZERO, &event, window * 10))
            .await;
    }

    async fn wait_for_windows(store: &InMemoryDepositStore, expected: &[u64]) -> Vec<u64> {
        let mut windows = Vec::new();
        for _ in 0..100 {
            windows = store.list_deposits(None).unwrap();
            if windows == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        windows
    }

    #[tokio::test]
    async fn test_rolls_deposits_ahead_of_new_windows() {
        let h = harness(Ok(1));
        h.tracker.start(Some(2), U256::from(100u64)).await.unwrap();

        assert_eq!(h.store.list_deposits(None).unwrap(), vec![2, 3]);
        assert_eq!(
            h.registry.calls(),
            vec![Call::DepositMany(vec![2, 3], U256::from(200u64))]
        );

        new_window(&h.listener, 1).await;
        assert_eq!(wait_for_windows(&h.store, &[2, 3, 4]).await, vec![2, 3, 4]);

        new_window(&h.listener, 2).await;
        assert_eq!(wait_for_windows(&h.store, &[2, 3, 4, 5]).await, vec![2, 3, 4, 5]);

        new_window(&h.listener, 3).await;
        assert_eq!(wait_for_windows(&h.store, &[3, 4, 5, 6]).await, vec![3, 4, 5, 6]);

        assert!(h.registry.calls().contains(&Call::Withdraw(vec![2])));
        assert!(h.registry.calls().contains(&Call::Deposit(6, U256::from(100u64))));

        let status = h.tracker.status().unwrap();
        assert!(status.is_working);
        assert_eq!(status.current_oracle_window, Some(3));

        assert_eq!(h.tracker.stop().unwrap(), vec![3, 4, 5, 6]);
        assert!(!h.tracker.is_working());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let h = harness(Ok(1));
        h.tracker.start(Some(2), U256::from(1u64)).await.unwrap();

        let err = h.tracker.start(Some(2), U256::from(1u64)).await.unwrap_err();
        assert_eq!(err, AutoDepositError::AlreadyRunning);
        assert_eq!(h.registry.calls().len(), 1);
        h.tracker.stop().unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_an_error() {
        let h = harness(Ok(1));
        assert_eq!(h.tracker.stop().unwrap_err(), AutoDepositError::NotRunning);
    }

    #[tokio::test]
    async fn test_stop_sends_no_transaction() {
        let h = harness(Ok(1));
        h.tracker.start(Some(2), U256::from(1u64)).await.unwrap();
        let before = h.registry.calls();

        assert_eq!(h.tracker.stop().unwrap(), vec![2, 3]);
        assert_eq!(h.registry.calls(), before);

        // Restart after a stop is allowed.
        h.tracker.start(Some(2), U256::from(1u64)).await.unwrap();
        assert!(h.tracker.is_working());
        h.tracker.stop().unwrap();
    }

    #[tokio::test]
    async fn test_default_start_window_and_onchain_deposits() {
        let h = harness(Ok(4));
        h.registry.on_chain.lock().insert(6, U256::from(5u64));

        h.tracker.start(None, U256::from(10u64)).await.unwrap();

        assert_eq!(
            h.registry.calls(),
            vec![Call::DepositMany(vec![7], U256::from(10u64))]
        );
        assert_eq!(h.store.list_deposits(None).unwrap(), vec![6, 7]);
        h.tracker.stop().unwrap();
    }

    #[tokio::test]
    async fn test_start_withdraws_stale_windows() {
        let h = harness(Ok(5));
        h.store.store_deposits(&[2, 3, 5]).unwrap();

        h.tracker.start(Some(6), U256::from(1u64)).await.unwrap();

        assert_eq!(h.registry.calls()[0], Call::Withdraw(vec![2, 3]));
        assert_eq!(h.store.list_deposits(None).unwrap(), vec![5, 6, 7]);
        h.tracker.stop().unwrap();
    }

    #[tokio::test]
    async fn test_failed_current_window_leaves_tracker_idle() {
        let h = harness(Err(ChainError::Rpc("connection refused".into())));

        let err = h.tracker.start(Some(2), U256::from(1u64)).await.unwrap_err();
        assert!(matches!(err, AutoDepositError::CurrentWindow(_)));
        assert!(!h.tracker.is_working());
        assert!(h.registry.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_withdrawal_keeps_windows_tracked() {
        let h = harness(Ok(1));
        h.tracker.start(Some(2), U256::from(1u64)).await.unwrap();
        h.registry
            .fail_withdraw
            .store(true, std::sync::atomic::Ordering::SeqCst);

        new_window(&h.listener, 3).await;
        let windows = wait_for_windows(&h.store, &[2, 3, 6]).await;

        assert_eq!(windows, vec![2, 3, 6]);
        assert!(h.tracker.is_working());
        h.tracker.stop().unwrap();
    }

    #[tokio::test]
    async fn test_manual_withdraw_clears_windows() {
        let h = harness(Ok(1));
        h.tracker.start(Some(2), U256::from(1u64)).await.unwrap();
        h.tracker.stop().unwrap();

        h.tracker.withdraw(&[2, 3]).await.unwrap();
        assert!(h.store.list_deposits(None).unwrap().is_empty());

        let withdrawn: BTreeSet<_> = h
            .registry
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Withdraw(w) => Some(w),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(withdrawn, BTreeSet::from([2, 3]));
    }
}
