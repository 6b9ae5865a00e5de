//! Opens stored commitments for the block they target and follows them
//! through settlement.
//!
//! All chain events are funnelled through one bounded inbox and handled by a
//! single worker, so a block is processed only after every earlier event has
//! been applied. Transaction outcomes are awaited on separate watch tasks and
//! never block the worker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alloy_primitives::{Bytes, B256};
use common::events::{channel, EventError, EventManager};
use common::interfaces::bidder_registry::IBidderRegistry::{FundsRetrieved, FundsRewarded};
use common::interfaces::block_tracker::IBlockTracker::NewL1Block;
use common::interfaces::oracle::IOracle::CommitmentProcessed;
use common::interfaces::preconf_manager::IPreconfManager::{
    OpenedCommitmentStored, UnopenedCommitmentStored,
};
use common::uint::to_u64_saturating;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::store::CommitmentStore;
use super::types::{BlockWinner, Commitment, CommitmentStatus, Payment, PeerRole};
use crate::chain::{ChainError, OpenCommitmentParams, PreconfContract, SubmittedTx, TxReceipt, TxWatcher};
use crate::notifications::{Notification, Notifier, Topic};
use crate::storage::StoreError;

/// Bidders open block N only once the winner of N+2 is known, leaving the
/// provider the first chance to open. This and the auto-deposit window
/// offset both assume the oracle settles two windows behind the chain.
pub const BIDDER_BLOCK_LAG: u64 = 2;

pub const DEFAULT_HISTORY_LIMIT: u64 = 10_000;

/// Queued commitments more than this many blocks behind the block being
/// processed are given up on.
pub const ALLOWED_OPEN_DELAY: u64 = 10;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub role: PeerRole,
    /// Settled history is kept for this many blocks behind the last processed one.
    pub history_limit: u64,
    pub inbox_capacity: usize,
}

impl TrackerConfig {
    pub fn new(role: PeerRole) -> Self {
        Self {
            role,
            history_limit: DEFAULT_HISTORY_LIMIT,
            inbox_capacity: 64,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerStats {
    blocks_processed: AtomicU64,
    open_attempts: AtomicU64,
    opened: AtomicU64,
    open_failed: AtomicU64,
    not_winner: AtomicU64,
    settled: AtomicU64,
    slashed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStatsSnapshot {
    pub blocks_processed: u64,
    pub open_attempts: u64,
    pub opened: u64,
    pub open_failed: u64,
    pub not_winner: u64,
    pub settled: u64,
    pub slashed: u64,
}

enum TrackerEvent {
    NewL1Block(NewL1Block),
    Unopened(UnopenedCommitmentStored),
    Opened(OpenedCommitmentStored),
    Processed(CommitmentProcessed),
    Rewarded(FundsRewarded),
    Retrieved(FundsRetrieved),
}

impl From<NewL1Block> for TrackerEvent {
    fn from(ev: NewL1Block) -> Self {
        TrackerEvent::NewL1Block(ev)
    }
}

impl From<UnopenedCommitmentStored> for TrackerEvent {
    fn from(ev: UnopenedCommitmentStored) -> Self {
        TrackerEvent::Unopened(ev)
    }
}

impl From<OpenedCommitmentStored> for TrackerEvent {
    fn from(ev: OpenedCommitmentStored) -> Self {
        TrackerEvent::Opened(ev)
    }
}

impl From<CommitmentProcessed> for TrackerEvent {
    fn from(ev: CommitmentProcessed) -> Self {
        TrackerEvent::Processed(ev)
    }
}

impl From<FundsRewarded> for TrackerEvent {
    fn from(ev: FundsRewarded) -> Self {
        TrackerEvent::Rewarded(ev)
    }
}

impl From<FundsRetrieved> for TrackerEvent {
    fn from(ev: FundsRetrieved) -> Self {
        TrackerEvent::Retrieved(ev)
    }
}

#[derive(Debug, Clone, Copy)]
enum WatchKind {
    Store,
    Open,
}

/// Open transactions awaiting a receipt, and which of them were seen opened
/// on chain meanwhile.
#[derive(Default)]
struct OpenTracking {
    in_flight: HashSet<B256>,
    observed: HashSet<B256>,
}

pub struct CommitmentTracker {
    config: TrackerConfig,
    store: Arc<dyn CommitmentStore>,
    events: Arc<dyn EventManager>,
    contract: Arc<dyn PreconfContract>,
    watcher: Arc<dyn TxWatcher>,
    notifier: Arc<dyn Notifier>,
    opens: Mutex<OpenTracking>,
    stats: TrackerStats,
    watches: TaskTracker,
    cancel_token: CancellationToken,
}

impl CommitmentTracker {
    pub fn new(
        config: TrackerConfig,
        store: Arc<dyn CommitmentStore>,
        events: Arc<dyn EventManager>,
        contract: Arc<dyn PreconfContract>,
        watcher: Arc<dyn TxWatcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            events,
            contract,
            watcher,
            notifier,
            opens: Mutex::new(OpenTracking::default()),
            stats: TrackerStats::default(),
            watches: TaskTracker::new(),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn role(&self) -> PeerRole {
        self.config.role
    }

    pub fn stats(&self) -> TrackerStatsSnapshot {
        TrackerStatsSnapshot {
            blocks_processed: self.stats.blocks_processed.load(Ordering::Relaxed),
            open_attempts: self.stats.open_attempts.load(Ordering::Relaxed),
            opened: self.stats.opened.load(Ordering::Relaxed),
            open_failed: self.stats.open_failed.load(Ordering::Relaxed),
            not_winner: self.stats.not_winner.load(Ordering::Relaxed),
            settled: self.stats.settled.load(Ordering::Relaxed),
            slashed: self.stats.slashed.load(Ordering::Relaxed),
        }
    }

    /// Number of tracked commitments in each status.
    pub fn status_counts(&self) -> Result<HashMap<CommitmentStatus, usize>, StoreError> {
        self.store.status_counts()
    }

    /// Starts tracking a commitment this node made.
    ///
    /// With a store transaction the commitment is `Pending` until the
    /// transaction is mined; without one it is taken as already stored.
    pub fn track_commitment(
        self: &Arc<Self>,
        mut commitment: Commitment,
        store_tx: Option<SubmittedTx>,
    ) -> Result<(), StoreError> {
        commitment.status = match store_tx {
            Some(_) => CommitmentStatus::Pending,
            None => CommitmentStatus::Stored,
        };
        tracing::debug!(
            digest = %commitment.digest,
            block = commitment.block_number,
            status = ?commitment.status,
            "Tracking commitment"
        );
        self.store.add_commitment(commitment.clone())?;

        if let Some(tx) = store_tx {
            self.spawn_watch(commitment, tx, WatchKind::Store);
        }
        Ok(())
    }

    /// Subscribes to the tracker's events and runs the worker until the
    /// cancel token fires or the subscription reports an error.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<eyre::Result<()>>, EventError> {
        let cancel = self.cancel_token.clone();
        let (tx, mut inbox) = mpsc::channel::<TrackerEvent>(self.config.inbox_capacity.max(1));

        let mut subscription = self.events.subscribe(vec![
            channel::<NewL1Block, TrackerEvent>(tx.clone(), cancel.clone()),
            channel::<UnopenedCommitmentStored, TrackerEvent>(tx.clone(), cancel.clone()),
            channel::<OpenedCommitmentStored, TrackerEvent>(tx.clone(), cancel.clone()),
            channel::<CommitmentProcessed, TrackerEvent>(tx.clone(), cancel.clone()),
            channel::<FundsRewarded, TrackerEvent>(tx.clone(), cancel.clone()),
            channel::<FundsRetrieved, TrackerEvent>(tx, cancel.clone()),
        ])?;

        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            tracing::info!(role = %this.config.role, "Commitment tracker started");

            let result = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break Ok(()),
                    Some(err) = subscription.err() => {
                        break Err(eyre::Report::new(err).wrap_err("commitment tracker subscription failed"));
                    }
                    Some(event) = inbox.recv() => {
                        if let Err(e) = this.handle_event(event).await {
                            break Err(eyre::Report::new(e).wrap_err("commitment store failed"));
                        }
                    }
                }
            };

            drop(subscription);
            if result.is_err() {
                cancel.cancel();
            }
            this.watches.close();
            this.watches.wait().await;

            match this.status_counts() {
                Ok(statuses) => tracing::info!(stats = ?this.stats(), ?statuses, "Commitment tracker stopped"),
                Err(e) => tracing::info!(stats = ?this.stats(), error = %e, "Commitment tracker stopped"),
            }
            result
        }))
    }

    async fn handle_event(self: &Arc<Self>, event: TrackerEvent) -> Result<(), StoreError> {
        match event {
            TrackerEvent::NewL1Block(ev) => {
                let winner = BlockWinner {
                    block_number: to_u64_saturating(ev.blockNumber),
                    winner: ev.winner,
                    window: to_u64_saturating(ev.window),
                };
                self.handle_new_l1_block(winner).await
            }
            TrackerEvent::Unopened(ev) => self.handle_unopened(&ev),
            TrackerEvent::Opened(ev) => self.handle_opened(&ev),
            TrackerEvent::Processed(ev) => {
                let status = self.store.record_verdict(&ev.commitmentIndex, ev.isSlash)?;
                self.on_settled(ev.commitmentIndex, status);
                Ok(())
            }
            TrackerEvent::Rewarded(ev) => {
                let status = self
                    .store
                    .record_payment(&ev.commitmentDigest, Payment::Reward(ev.amount))?;
                self.on_settled(ev.commitmentDigest, status);
                Ok(())
            }
            TrackerEvent::Retrieved(ev) => {
                let status = self
                    .store
                    .record_payment(&ev.commitmentDigest, Payment::Refund(ev.amount))?;
                self.on_settled(ev.commitmentDigest, status);
                Ok(())
            }
        }
    }

    pub(crate) async fn handle_new_l1_block(self: &Arc<Self>, winner: BlockWinner) -> Result<(), StoreError> {
        tracing::debug!(
            block = winner.block_number,
            winner = %winner.winner,
            window = winner.window,
            "New L1 block"
        );

        match self.config.role {
            PeerRole::Provider => self.process_block(&winner).await,
            PeerRole::Bidder => {
                self.store.add_winner(winner)?;

                let Some(target) = winner.block_number.checked_sub(BIDDER_BLOCK_LAG) else {
                    return Ok(());
                };
                let Some(previous) = self.store.winner(target)? else {
                    tracing::debug!(block = target, "No winner recorded yet, deferring");
                    return Ok(());
                };

                self.process_block(&previous).await?;
                self.store
                    .prune_winners_before(previous.block_number.saturating_sub(1))?;
                Ok(())
            }
        }
    }

    async fn process_block(self: &Arc<Self>, winner: &BlockWinner) -> Result<(), StoreError> {
        let block = winner.block_number;
        let commitments = self.store.commitments_for_block(block)?;

        let mut attempted = 0usize;
        let mut failed = 0usize;
        for commitment in commitments {
            if commitment.status == CommitmentStatus::Pending {
                // The block is gone; a later store receipt must not revive it.
                let details = match commitment.index {
                    None => "commitment index not found",
                    Some(_) => "store transaction not confirmed before block",
                };
                tracing::warn!(
                    digest = %commitment.digest,
                    block,
                    details,
                    "Commitment still pending at its block, cannot open"
                );
                self.store
                    .set_status(&commitment.digest, CommitmentStatus::Failed, details)?;
                failed += 1;
                continue;
            }

            if commitment.status != CommitmentStatus::Stored {
                tracing::debug!(
                    digest = %commitment.digest,
                    status = ?commitment.status,
                    "Skipping commitment not in stored state"
                );
                continue;
            }

            let Some(index) = commitment.index else {
                tracing::warn!(
                    digest = %commitment.digest,
                    block,
                    "Commitment was never stored on chain, cannot open"
                );
                self.store.set_status(
                    &commitment.digest,
                    CommitmentStatus::Failed,
                    "commitment index not found",
                )?;
                failed += 1;
                continue;
            };

            if commitment.committer != winner.winner {
                self.stats.not_winner.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            {
                let mut opens = self.opens.lock();
                if !opens.in_flight.insert(commitment.digest) {
                    continue;
                }
            }

            attempted += 1;
            self.stats.open_attempts.fetch_add(1, Ordering::Relaxed);
            let params = self.open_params(&commitment, index);
            match self.contract.open_commitment(params).await {
                Ok(tx) => {
                    tracing::info!(
                        digest = %commitment.digest,
                        %index,
                        block,
                        tx_hash = %tx.hash,
                        "Commitment open submitted"
                    );
                    self.spawn_watch(commitment, tx, WatchKind::Open);
                }
                Err(e) => {
                    failed += 1;
                    self.finish_open(&commitment.digest);
                    self.fail_open(&commitment, &e);
                }
            }
        }

        self.store.clear_block(block)?;
        self.stats.blocks_processed.fetch_add(1, Ordering::Relaxed);
        if attempted > 0 || failed > 0 {
            tracing::info!(block, attempted, failed, "Processed block");
        }

        if let Some(cutoff) = block.checked_sub(ALLOWED_OPEN_DELAY) {
            self.expire_queued_before(cutoff)?;
        }

        if let Some(horizon) = block.checked_sub(self.config.history_limit) {
            let pruned = self.store.prune_before(horizon)?;
            if pruned > 0 {
                tracing::debug!(pruned, horizon, "Pruned commitment history");
            }
        }
        Ok(())
    }

    /// Fails commitments left queued for blocks that were never processed.
    fn expire_queued_before(&self, cutoff: u64) -> Result<(), StoreError> {
        let expired = self.store.drain_queued_before(cutoff)?;
        if expired.is_empty() {
            return Ok(());
        }

        let mut failed = 0usize;
        for commitment in &expired {
            if !matches!(commitment.status, CommitmentStatus::Pending | CommitmentStatus::Stored) {
                continue;
            }
            if self.store.set_status(
                &commitment.digest,
                CommitmentStatus::Failed,
                "block not processed in time",
            )? {
                failed += 1;
            }
        }
        tracing::info!(cutoff, dropped = expired.len(), failed, "Dropped stale commitment queues");
        Ok(())
    }

    fn open_params(&self, commitment: &Commitment, index: B256) -> OpenCommitmentParams {
        let shared_secret = match self.config.role {
            PeerRole::Bidder => commitment.shared_secret.clone().unwrap_or_default(),
            PeerRole::Provider => Bytes::new(),
        };
        OpenCommitmentParams {
            commitment_index: index,
            bid_amount: commitment.bid_amount,
            slash_amount: commitment.slash_amount,
            block_number: commitment.block_number,
            txn_hash: commitment.txn_hash.clone(),
            reverting_tx_hashes: commitment.reverting_tx_hashes.clone(),
            decay_start: commitment.decay_start,
            decay_end: commitment.decay_end,
            bid_signature: commitment.bid_signature.clone(),
            commitment_signature: commitment.commitment_signature.clone(),
            shared_secret,
        }
    }

    fn handle_unopened(&self, ev: &UnopenedCommitmentStored) -> Result<(), StoreError> {
        let digest = ev.commitmentDigest;
        if !self
            .store
            .set_index(&digest, ev.commitmentIndex, ev.dispatchTimestamp)?
        {
            tracing::trace!(%digest, "Stored commitment is not ours");
            return Ok(());
        }

        tracing::debug!(
            %digest,
            index = %ev.commitmentIndex,
            dispatch_timestamp = ev.dispatchTimestamp,
            "Commitment stored on chain"
        );
        if let Some(c) = self.store.commitment(&digest)? {
            if c.status == CommitmentStatus::Pending {
                self.store.set_status(&digest, CommitmentStatus::Stored, "stored")?;
            }
        }
        Ok(())
    }

    fn handle_opened(&self, ev: &OpenedCommitmentStored) -> Result<(), StoreError> {
        if self.store.remove_pending_by_index(&ev.commitmentIndex)?.is_some() {
            tracing::debug!(index = %ev.commitmentIndex, "Commitment opened on chain, dropped from open queue");
        }

        let digest = ev.commitmentDigest;
        let Some(commitment) = self.store.commitment(&digest)? else {
            return Ok(());
        };
        if commitment.status.is_opened() {
            return Ok(());
        }

        {
            let mut opens = self.opens.lock();
            if opens.in_flight.contains(&digest) {
                opens.observed.insert(digest);
                return Ok(());
            }
        }

        let details = format!("opened by {}", self.config.role.other());
        self.store.set_status(&digest, CommitmentStatus::Opened, &details)?;
        Ok(())
    }

    fn on_settled(&self, key: B256, status: Option<CommitmentStatus>) {
        match status {
            Some(CommitmentStatus::Settled) => {
                self.stats.settled.fetch_add(1, Ordering::Relaxed);
                tracing::info!(commitment = %key, "Commitment settled");
            }
            Some(CommitmentStatus::Slashed) => {
                self.stats.slashed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(commitment = %key, "Commitment slashed");
            }
            _ => {}
        }
    }

    /// Clears the in-flight marker, returning whether the commitment was seen
    /// opened on chain while the transaction was pending.
    fn finish_open(&self, digest: &B256) -> bool {
        let mut opens = self.opens.lock();
        opens.in_flight.remove(digest);
        opens.observed.remove(digest)
    }

    fn spawn_watch(self: &Arc<Self>, commitment: Commitment, tx: SubmittedTx, kind: WatchKind) {
        let this = Arc::clone(self);
        let cancel = self.cancel_token.clone();
        self.watches.spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = this.watcher.watch_tx(tx.hash, tx.nonce) => outcome,
            };
            if let Err(e) = this.apply_watch_outcome(&commitment, tx, kind, outcome) {
                tracing::error!(digest = %commitment.digest, error = %e, "Failed to record transaction outcome");
            }
        });
    }

    fn apply_watch_outcome(
        &self,
        commitment: &Commitment,
        tx: SubmittedTx,
        kind: WatchKind,
        outcome: Result<TxReceipt, ChainError>,
    ) -> Result<(), StoreError> {
        let digest = commitment.digest;
        match (kind, outcome) {
            (WatchKind::Store, Ok(receipt)) => {
                tracing::debug!(%digest, block = receipt.block_number, "Store transaction mined");
                if let Some(c) = self.store.commitment(&digest)? {
                    if c.status == CommitmentStatus::Pending {
                        self.store.set_status(&digest, CommitmentStatus::Stored, "stored")?;
                    }
                }
            }
            (WatchKind::Store, Err(e)) => {
                tracing::error!(%digest, tx_hash = %tx.hash, error = %e, "Store transaction failed");
                self.store
                    .set_status(&digest, CommitmentStatus::Failed, &e.to_string())?;
                self.notify(Topic::CommitmentStoreFailed, commitment, tx.hash, &e);
            }
            (WatchKind::Open, Ok(receipt)) => {
                self.finish_open(&digest);
                self.stats.opened.fetch_add(1, Ordering::Relaxed);
                tracing::info!(%digest, block = receipt.block_number, gas_used = receipt.gas_used, "Commitment opened");
                let details = format!("opened by {}", self.config.role);
                self.store.set_status(&digest, CommitmentStatus::Opened, &details)?;
            }
            (WatchKind::Open, Err(e)) => {
                if self.finish_open(&digest) {
                    tracing::info!(%digest, error = %e, "Open transaction failed, commitment already opened by counterparty");
                    let details = format!("opened by {}", self.config.role.other());
                    self.store.set_status(&digest, CommitmentStatus::Opened, &details)?;
                } else {
                    self.fail_open(commitment, &e);
                }
            }
        }
        Ok(())
    }

    fn fail_open(&self, commitment: &Commitment, error: &ChainError) {
        self.stats.open_failed.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            digest = %commitment.digest,
            block = commitment.block_number,
            error = %error,
            "Failed to open commitment"
        );
        if let Err(e) = self
            .store
            .set_status(&commitment.digest, CommitmentStatus::Failed, &error.to_string())
        {
            tracing::error!(digest = %commitment.digest, error = %e, "Failed to mark commitment failed");
        }
        self.notify(Topic::CommitmentOpenFailed, commitment, B256::ZERO, error);
    }

    fn notify(&self, topic: Topic, commitment: &Commitment, tx_hash: B256, error: &ChainError) {
        self.notifier.notify(Notification::new(
            topic,
            json!({
                "commitmentDigest": commitment.digest.to_string(),
                "commitmentIndex": commitment.index.map(|i| i.to_string()),
                "blockNumber": commitment.block_number,
                "txnHash": commitment.txn_hash,
                "txHash": (tx_hash != B256::ZERO).then(|| tx_hash.to_string()),
                "error": error.to_string(),
            }),
        ));
    }
}
