use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// Which side of a commitment this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Bidder,
    Provider,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Bidder => write!(f, "bidder"),
            PeerRole::Provider => write!(f, "provider"),
        }
    }
}

impl PeerRole {
    pub fn other(&self) -> PeerRole {
        match self {
            PeerRole::Bidder => PeerRole::Provider,
            PeerRole::Provider => PeerRole::Bidder,
        }
    }
}

impl FromStr for PeerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bidder" => Ok(PeerRole::Bidder),
            "provider" => Ok(PeerRole::Provider),
            other => Err(format!("unknown peer role {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitmentStatus {
    /// Store transaction sent, not yet mined.
    Pending,
    /// Hashed form is on chain.
    Stored,
    /// Fully revealed on chain.
    Opened,
    Failed,
    Settled,
    Slashed,
}

impl CommitmentStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, CommitmentStatus::Settled | CommitmentStatus::Slashed)
    }

    pub fn is_opened(&self) -> bool {
        matches!(
            self,
            CommitmentStatus::Opened | CommitmentStatus::Settled | CommitmentStatus::Slashed
        )
    }
}

/// Settlement facts collected from the oracle and the registry, in whatever
/// order they arrive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settlement {
    pub is_slash: Option<bool>,
    pub reward: Option<U256>,
    pub refund: Option<U256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payment {
    /// `FundsRewarded`: the provider was paid.
    Reward(U256),
    /// `FundsRetrieved`: the bidder got the bid back.
    Refund(U256),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commitment {
    pub digest: B256,
    /// On-chain index, known once the hashed commitment is stored.
    pub index: Option<B256>,
    pub bidder: Address,
    pub committer: Address,
    pub bid_amount: U256,
    pub slash_amount: U256,
    pub block_number: u64,
    pub decay_start: u64,
    pub decay_end: u64,
    pub dispatch_timestamp: u64,
    pub txn_hash: String,
    pub reverting_tx_hashes: String,
    pub bid_signature: Bytes,
    pub commitment_signature: Bytes,
    /// Only the bidder holds it.
    pub shared_secret: Option<Bytes>,
    pub status: CommitmentStatus,
    pub details: String,
    pub settlement: Settlement,
}

impl Commitment {
    /// Moves to `status` unless already settled or slashed. A failed
    /// commitment is never taken back to `Stored`.
    pub fn transition(&mut self, status: CommitmentStatus, details: impl Into<String>) -> bool {
        if self.status.is_final() {
            return false;
        }
        if self.status == CommitmentStatus::Failed && status == CommitmentStatus::Stored {
            return false;
        }
        self.status = status;
        self.details = details.into();
        true
    }

    /// Applies collected settlement facts. Returns the final status the first
    /// time both the verdict and the matching payment are known.
    pub fn try_settle(&mut self) -> Option<CommitmentStatus> {
        if self.status.is_final() {
            return None;
        }
        let status = match self.settlement {
            Settlement {
                is_slash: Some(false),
                reward: Some(_),
                ..
            } => CommitmentStatus::Settled,
            Settlement {
                is_slash: Some(true),
                refund: Some(_),
                ..
            } => CommitmentStatus::Slashed,
            _ => return None,
        };
        self.status = status;
        Some(status)
    }
}

/// Winner of an L1 block as announced by the block tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWinner {
    pub block_number: u64,
    pub winner: Address,
    pub window: u64,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn commitment(digest: u8, block_number: u64, committer: Address) -> Commitment {
        Commitment {
            digest: B256::repeat_byte(digest),
            index: None,
            bidder: Address::repeat_byte(0xb1),
            committer,
            bid_amount: U256::from(100u64),
            slash_amount: U256::ZERO,
            block_number,
            decay_start: 1,
            decay_end: 2,
            dispatch_timestamp: 0,
            txn_hash: format!("0x{digest:02x}"),
            reverting_tx_hashes: String::new(),
            bid_signature: Bytes::from(vec![1u8]),
            commitment_signature: Bytes::from(vec![2u8]),
            shared_secret: Some(Bytes::from(vec![3u8])),
            status: CommitmentStatus::Stored,
            details: String::new(),
            settlement: Settlement::default(),
        }
    }
}
