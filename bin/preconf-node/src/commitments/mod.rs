//! Commitment lifecycle: storage, opening and settlement tracking.

pub mod store;
pub mod tracker;
mod types;

pub use store::{CommitmentStore, InMemoryCommitmentStore};
pub use tracker::{CommitmentTracker, TrackerConfig, TrackerStatsSnapshot, BIDDER_BLOCK_LAG};
pub use types::{BlockWinner, Commitment, CommitmentStatus, Payment, PeerRole, Settlement};
