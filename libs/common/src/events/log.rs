use alloy_primitives::{Address, Bytes, LogData, B256};
use alloy_sol_types::SolEvent;

/// A raw log as it was emitted on chain, with the position it was found at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogEvent {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl LogEvent {
    /// Builds the log a contract at `address` would emit for `event`.
    pub fn from_event<E: SolEvent>(address: Address, event: &E, block_number: u64) -> Self {
        let data = event.encode_log_data();
        Self {
            address,
            topics: data.topics().to_vec(),
            data: data.data,
            block_number,
            ..Default::default()
        }
    }

    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }

    pub fn log_data(&self) -> LogData {
        LogData::new_unchecked(self.topics.clone(), self.data.clone())
    }
}

impl From<alloy::rpc::types::Log> for LogEvent {
    fn from(log: alloy::rpc::types::Log) -> Self {
        Self {
            address: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
            block_number: log.block_number.unwrap_or_default(),
            tx_hash: log.transaction_hash.unwrap_or_default(),
            log_index: log.log_index.unwrap_or_default(),
        }
    }
}
