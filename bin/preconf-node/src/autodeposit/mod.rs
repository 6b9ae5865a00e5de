//! Automatic per-window deposits for the bidder role.

mod store;
mod tracker;

pub use store::{DepositStore, InMemoryDepositStore};
pub use tracker::{AutoDepositError, AutoDepositStatus, AutoDepositTracker, ORACLE_WINDOW_OFFSET};
