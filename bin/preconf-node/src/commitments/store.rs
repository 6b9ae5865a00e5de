use std::collections::{BTreeMap, BTreeSet, HashMap};

use alloy_primitives::B256;
use parking_lot::Mutex;

use super::types::{BlockWinner, Commitment, CommitmentStatus, Payment};
use crate::storage::StoreError;

/// Commitments indexed by digest, by target block and by on-chain index.
///
/// Implementations must update all indexes of one call atomically.
pub trait CommitmentStore: Send + Sync {
    /// Adds a commitment, replacing any record with the same digest, and
    /// queues it for opening at its block.
    fn add_commitment(&self, commitment: Commitment) -> Result<(), StoreError>;

    fn commitment(&self, digest: &B256) -> Result<Option<Commitment>, StoreError>;

    /// Commitments still queued for opening at `block`.
    fn commitments_for_block(&self, block: u64) -> Result<Vec<Commitment>, StoreError>;

    /// Records the on-chain index of a stored commitment. Returns false if
    /// the digest is not tracked.
    fn set_index(&self, digest: &B256, index: B256, dispatch_timestamp: u64) -> Result<bool, StoreError>;

    /// Removes the commitment with this on-chain index from the open queue.
    fn remove_pending_by_index(&self, index: &B256) -> Result<Option<Commitment>, StoreError>;

    /// Drops the open queue of `block`. Records stay for settlement.
    fn clear_block(&self, block: u64) -> Result<usize, StoreError>;

    /// Drops the open queues of every block below `block`, returning the
    /// commitments that were still queued.
    fn drain_queued_before(&self, block: u64) -> Result<Vec<Commitment>, StoreError>;

    /// Returns false if the commitment is unknown or already final.
    fn set_status(&self, digest: &B256, status: CommitmentStatus, details: &str) -> Result<bool, StoreError>;

    /// Records the oracle verdict. Returns the new final status if this
    /// completed settlement.
    fn record_verdict(&self, index: &B256, is_slash: bool) -> Result<Option<CommitmentStatus>, StoreError>;

    /// Records a registry payment. Returns the new final status if this
    /// completed settlement.
    fn record_payment(&self, digest: &B256, payment: Payment) -> Result<Option<CommitmentStatus>, StoreError>;

    /// Forgets commitments targeting blocks below `block` that are no longer
    /// queued for opening.
    fn prune_before(&self, block: u64) -> Result<usize, StoreError>;

    fn add_winner(&self, winner: BlockWinner) -> Result<(), StoreError>;

    fn winner(&self, block: u64) -> Result<Option<BlockWinner>, StoreError>;

    fn prune_winners_before(&self, block: u64) -> Result<usize, StoreError>;

    fn status_counts(&self) -> Result<HashMap<CommitmentStatus, usize>, StoreError>;
}

#[derive(Default)]
struct Inner {
    records: HashMap<B256, Commitment>,
    pending: BTreeMap<u64, BTreeSet<B256>>,
    by_index: HashMap<B256, B256>,
    winners: BTreeMap<u64, BlockWinner>,
}

impl Inner {
    fn unqueue(&mut self, block: u64, digest: &B256) -> bool {
        let Some(set) = self.pending.get_mut(&block) else {
            return false;
        };
        let removed = set.remove(digest);
        if set.is_empty() {
            self.pending.remove(&block);
        }
        removed
    }
}

#[derive(Default)]
pub struct InMemoryCommitmentStore {
    inner: Mutex<Inner>,
}

impl InMemoryCommitmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CommitmentStore for InMemoryCommitmentStore {
    fn add_commitment(&self, commitment: Commitment) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(index) = commitment.index {
            inner.by_index.insert(index, commitment.digest);
        }
        inner
            .pending
            .entry(commitment.block_number)
            .or_default()
            .insert(commitment.digest);
        inner.records.insert(commitment.digest, commitment);
        Ok(())
    }

    fn commitment(&self, digest: &B256) -> Result<Option<Commitment>, StoreError> {
        Ok(self.inner.lock().records.get(digest).cloned())
    }

    fn commitments_for_block(&self, block: u64) -> Result<Vec<Commitment>, StoreError> {
        let inner = self.inner.lock();
        let Some(digests) = inner.pending.get(&block) else {
            return Ok(Vec::new());
        };
        Ok(digests
            .iter()
            .filter_map(|d| inner.records.get(d).cloned())
            .collect())
    }

    fn set_index(&self, digest: &B256, index: B256, dispatch_timestamp: u64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.get_mut(digest) else {
            return Ok(false);
        };
        record.index = Some(index);
        record.dispatch_timestamp = dispatch_timestamp;
        inner.by_index.insert(index, *digest);
        Ok(true)
    }

    fn remove_pending_by_index(&self, index: &B256) -> Result<Option<Commitment>, StoreError> {
        let mut inner = self.inner.lock();
        let Some(digest) = inner.by_index.get(index).copied() else {
            return Ok(None);
        };
        let Some(block) = inner.records.get(&digest).map(|c| c.block_number) else {
            return Ok(None);
        };
        if !inner.unqueue(block, &digest) {
            return Ok(None);
        }
        Ok(inner.records.get(&digest).cloned())
    }

    fn clear_block(&self, block: u64) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .lock()
            .pending
            .remove(&block)
            .map_or(0, |set| set.len()))
    }

    fn drain_queued_before(&self, block: u64) -> Result<Vec<Commitment>, StoreError> {
        let mut inner = self.inner.lock();
        let kept = inner.pending.split_off(&block);
        let stale = std::mem::replace(&mut inner.pending, kept);
        Ok(stale
            .into_values()
            .flatten()
            .filter_map(|d| inner.records.get(&d).cloned())
            .collect())
    }

    fn set_status(&self, digest: &B256, status: CommitmentStatus, details: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        Ok(inner
            .records
            .get_mut(digest)
            .is_some_and(|c| c.transition(status, details)))
    }

    fn record_verdict(&self, index: &B256, is_slash: bool) -> Result<Option<CommitmentStatus>, StoreError> {
        let mut inner = self.inner.lock();
        let Some(digest) = inner.by_index.get(index).copied() else {
            return Ok(None);
        };
        Ok(inner.records.get_mut(&digest).and_then(|c| {
            c.settlement.is_slash = Some(is_slash);
            c.try_settle()
        }))
    }

    fn record_payment(&self, digest: &B256, payment: Payment) -> Result<Option<CommitmentStatus>, StoreError> {
        let mut inner = self.inner.lock();
        Ok(inner.records.get_mut(digest).and_then(|c| {
            match payment {
                Payment::Reward(amount) => c.settlement.reward = Some(amount),
                Payment::Refund(amount) => c.settlement.refund = Some(amount),
            }
            c.try_settle()
        }))
    }

    fn prune_before(&self, block: u64) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let Inner {
            records,
            pending,
            by_index,
            ..
        } = &mut *inner;

        let stale: Vec<B256> = records
            .values()
            .filter(|c| c.block_number < block)
            .filter(|c| !pending.get(&c.block_number).is_some_and(|s| s.contains(&c.digest)))
            .map(|c| c.digest)
            .collect();

        for digest in &stale {
            if let Some(record) = records.remove(digest) {
                if let Some(index) = record.index {
                    by_index.remove(&index);
                }
            }
        }
        Ok(stale.len())
    }

    fn add_winner(&self, winner: BlockWinner) -> Result<(), StoreError> {
        self.inner.lock().winners.insert(winner.block_number, winner);
        Ok(())
    }

    fn winner(&self, block: u64) -> Result<Option<BlockWinner>, StoreError> {
        Ok(self.inner.lock().winners.get(&block).copied())
    }

    fn prune_winners_before(&self, block: u64) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let kept = inner.winners.split_off(&block);
        let removed = inner.winners.len();
        inner.winners = kept;
        Ok(removed)
    }

    fn status_counts(&self) -> Result<HashMap<CommitmentStatus, usize>, StoreError> {
        let mut counts = HashMap::new();
        for c in self.inner.lock().records.values() {
            *counts.entry(c.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
