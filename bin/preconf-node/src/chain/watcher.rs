use std::time::Duration;

use alloy::providers::Provider;
use alloy_primitives::{Address, B256};
use tokio::time::{sleep, Instant};

use super::contracts::{TxReceipt, TxWatcher};
use super::ChainError;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Polls for receipts of transactions sent by `sender`.
///
/// A transaction with no receipt whose nonce has already been consumed was
/// replaced or dropped.
pub struct ReceiptWatcher<P> {
    provider: P,
    sender: Address,
    config: WatcherConfig,
}

impl<P> ReceiptWatcher<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    pub fn new(provider: P, sender: Address, config: WatcherConfig) -> Self {
        Self {
            provider,
            sender,
            config,
        }
    }

    async fn receipt(&self, hash: B256) -> Result<Option<TxReceipt>, ChainError> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        Ok(receipt.map(|r| TxReceipt {
            tx_hash: hash,
            block_number: r.block_number.unwrap_or(0),
            gas_used: r.gas_used,
            status: r.status(),
        }))
    }
}

#[async_trait::async_trait]
impl<P> TxWatcher for ReceiptWatcher<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    async fn watch_tx(&self, hash: B256, nonce: u64) -> Result<TxReceipt, ChainError> {
        let deadline = Instant::now() + self.config.timeout;

        loop {
            match self.receipt(hash).await {
                Ok(Some(receipt)) if receipt.status => return Ok(receipt),
                Ok(Some(_)) => return Err(ChainError::Reverted { hash }),
                Ok(None) => match self.provider.get_transaction_count(self.sender).await {
                    Ok(confirmed) if confirmed > nonce => {
                        // The nonce may have been mined by this very transaction
                        // between the two queries.
                        return match self.receipt(hash).await? {
                            Some(receipt) if receipt.status => Ok(receipt),
                            Some(_) => Err(ChainError::Reverted { hash }),
                            None => Err(ChainError::Dropped { hash, nonce }),
                        };
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(%hash, error = %e, "Nonce query failed, retrying");
                    }
                },
                Err(e) => {
                    tracing::warn!(%hash, error = %e, "Receipt query failed, retrying");
                }
            }

            if Instant::now() >= deadline {
                return Err(ChainError::Timeout { hash });
            }
            sleep(self.config.poll_interval).await;
        }
    }
}
