pub mod autodeposit;
pub mod chain;
pub mod commitments;
pub mod config;
pub mod deposit;
pub mod notifications;
pub mod storage;
