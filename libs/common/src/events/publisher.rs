//! Polling log publisher.
//!
//! Every tick the publisher asks the chain for its head, pulls the logs of
//! the watched contracts for `(checkpoint, head]` in bounded chunks, hands
//! each log to the [`EventManager`] in chain order and then advances the
//! checkpoint to the head.
//!
//! A failed chain query ends the run with an error and leaves the checkpoint
//! untouched, so the next start replays the interrupted range.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::listener::EventManager;
use super::log::LogEvent;
use super::progress::{ProgressError, ProgressStore};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_BLOCK_RANGE: u64 = 5_000;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct QueryError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error("chain query failed: {0}")]
    Query(#[from] QueryError),

    #[error(transparent)]
    Progress(#[from] ProgressError),
}

/// Inclusive block range plus the contracts whose logs are wanted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
}

/// Minimal chain access the publisher needs.
#[async_trait::async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, QueryError>;

    /// Logs matching the filter, in block then log-index order.
    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<LogEvent>, QueryError>;
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub poll_interval: Duration,
    pub max_block_range: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_block_range: DEFAULT_MAX_BLOCK_RANGE,
        }
    }
}

pub struct Publisher {
    config: PublisherConfig,
    client: Arc<dyn ChainClient>,
    progress: Arc<dyn ProgressStore>,
    sink: Arc<dyn EventManager>,
    contracts: RwLock<Vec<Address>>,
}

impl Publisher {
    pub fn new(
        config: PublisherConfig,
        client: Arc<dyn ChainClient>,
        progress: Arc<dyn ProgressStore>,
        sink: Arc<dyn EventManager>,
    ) -> Self {
        Self {
            config,
            client,
            progress,
            sink,
            contracts: RwLock::new(Vec::new()),
        }
    }

    /// Add a contract to the watch list, returns false if already watched.
    pub async fn add_contract(&self, address: Address) -> bool {
        let mut contracts = self.contracts.write().await;
        if contracts.contains(&address) {
            return false;
        }
        tracing::info!(%address, "Watching contract");
        contracts.push(address);
        true
    }

    pub async fn contracts(&self) -> Vec<Address> {
        self.contracts.read().await.clone()
    }

    /// Run the polling loop on a background task.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<Result<(), PublisherError>> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PublisherError> {
        let mut last_block = self.progress.last_block()?;
        tracing::info!(
            last_block,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_block_range = self.config.max_block_range,
            "Starting log publisher"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(last_block, "Log publisher stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    last_block = self.poll_once(last_block).await.inspect_err(|e| {
                        tracing::error!(error = %e, last_block, "Log publisher failed");
                    })?;
                }
            }
        }
    }

    /// Publish everything in `(last_block, head]`, returning the new checkpoint.
    pub async fn poll_once(&self, last_block: u64) -> Result<u64, PublisherError> {
        let head = self.client.block_number().await?;
        if head <= last_block {
            return Ok(last_block);
        }

        let addresses = self.contracts().await;
        if addresses.is_empty() {
            tracing::trace!(head, "No contracts to watch, advancing checkpoint");
            self.progress.set_last_block(head)?;
            return Ok(head);
        }

        let range = self.config.max_block_range.max(1);
        let mut from_block = last_block + 1;
        let mut published = 0usize;
        while from_block <= head {
            let to_block = head.min(from_block.saturating_add(range - 1));
            let filter = LogFilter {
                from_block,
                to_block,
                addresses: addresses.clone(),
            };

            let logs = self.client.filter_logs(&filter).await?;
            tracing::debug!(from_block, to_block, logs = logs.len(), "Fetched logs");

            for log in logs {
                self.sink.publish_log_event(log).await;
                published += 1;
            }
            from_block = to_block + 1;
        }

        self.progress.set_last_block(head)?;
        if published > 0 {
            tracing::debug!(head, published, "Published logs");
        }
        Ok(head)
    }
}
