use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_primitives::U256;
use common::events::publisher::DEFAULT_MAX_BLOCK_RANGE;
use common::events::PublisherConfig;
use serde::{Deserialize, Serialize};

use crate::autodeposit::ORACLE_WINDOW_OFFSET;
use crate::chain::{ContractAddresses, WatcherConfig};
use crate::commitments::tracker::DEFAULT_HISTORY_LIMIT;
use crate::commitments::{PeerRole, TrackerConfig};
use crate::deposit::parse_bid_amount;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: PeerRole,
    pub chain: ChainConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub deposit: DepositConfig,
    #[serde(default)]
    pub autodeposit: AutoDepositConfig,
    #[serde(default)]
    pub tracker: CommitmentTrackerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub contracts: ContractAddresses,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub poll_interval_ms: u64,
    /// Upper bound on blocks covered by one `eth_getLogs` call.
    pub max_block_range: u64,
    pub progress_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DepositConfig {
    /// Read from the block tracker when unset.
    pub blocks_per_window: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoDepositConfig {
    pub enabled: bool,
    /// Per-window amount in wei, as a decimal string.
    pub amount: String,
    pub start_window: Option<u64>,
    pub oracle_window_offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitmentTrackerConfig {
    pub receipt_poll_interval_ms: u64,
    pub receipt_timeout_secs: u64,
    pub history_limit: u64,
}

impl NodeConfig {
    pub async fn load_from_file(path: &Path) -> eyre::Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn with_env_overrides(mut self) -> eyre::Result<Self> {
        if let Ok(url) = std::env::var("PRECONF_RPC_URL") {
            self.chain.rpc_url = url;
        }
        if let Ok(role) = std::env::var("PRECONF_ROLE") {
            self.role = role.parse().map_err(|e: String| eyre::eyre!(e))?;
        }
        if let Ok(ms) = std::env::var("PRECONF_POLL_INTERVAL_MS") {
            self.listener.poll_interval_ms = ms
                .parse()
                .map_err(|e| eyre::eyre!("invalid PRECONF_POLL_INTERVAL_MS {ms:?}: {e}"))?;
        }
        if let Ok(amount) = std::env::var("PRECONF_AUTODEPOSIT_AMOUNT") {
            self.autodeposit.amount = amount;
        }
        Ok(self)
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            poll_interval: Duration::from_millis(self.listener.poll_interval_ms),
            max_block_range: self.listener.max_block_range.max(1),
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_millis(self.tracker.receipt_poll_interval_ms),
            timeout: Duration::from_secs(self.tracker.receipt_timeout_secs),
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            history_limit: self.tracker.history_limit,
            ..TrackerConfig::new(self.role)
        }
    }
}

impl AutoDepositConfig {
    pub fn amount(&self) -> eyre::Result<U256> {
        let amount = parse_bid_amount(&self.amount)?;
        if amount.is_zero() {
            eyre::bail!("auto deposit amount must be positive");
        }
        Ok(amount)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: PeerRole::Bidder,
            chain: ChainConfig {
                rpc_url: "http://localhost:8545".to_string(),
                contracts: ContractAddresses::default(),
            },
            listener: ListenerConfig::default(),
            deposit: DepositConfig::default(),
            autodeposit: AutoDepositConfig::default(),
            tracker: CommitmentTrackerConfig::default(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_block_range: DEFAULT_MAX_BLOCK_RANGE,
            progress_path: PathBuf::from("./data/progress.json"),
        }
    }
}

impl Default for AutoDepositConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            amount: "0".to_string(),
            start_window: None,
            oracle_window_offset: ORACLE_WINDOW_OFFSET,
        }
    }
}

impl Default for CommitmentTrackerConfig {
    fn default() -> Self {
        Self {
            receipt_poll_interval_ms: 1_000,
            receipt_timeout_secs: 120,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path() -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("preconf-node-config-{}-{}.json", std::process::id(), n))
    }

    #[tokio::test]
    async fn test_load_partial_file_fills_defaults() {
        let path = temp_path();
        let json = r#"{
            "role": "provider",
            "chain": {
                "rpc_url": "http://node:8545",
                "contracts": {
                    "block_tracker": "0x0000000000000000000000000000000000000001",
                    "bidder_registry": "0x0000000000000000000000000000000000000002",
                    "preconf_manager": "0x0000000000000000000000000000000000000003",
                    "oracle": "0x0000000000000000000000000000000000000004"
                }
            },
            "autodeposit": { "enabled": true, "amount": "1000" }
        }"#;
        tokio::fs::write(&path, json).await.unwrap();

        let config = NodeConfig::load_from_file(&path).await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;

        assert_eq!(config.role, PeerRole::Provider);
        assert_eq!(config.chain.contracts.oracle, Address::with_last_byte(4));
        assert_eq!(config.listener.poll_interval_ms, 500);
        assert_eq!(config.listener.max_block_range, 5_000);
        assert_eq!(config.autodeposit.oracle_window_offset, 2);
        assert_eq!(config.autodeposit.amount().unwrap(), U256::from(1000u64));
        assert_eq!(config.tracker.history_limit, 10_000);
        assert_eq!(config.deposit.blocks_per_window, None);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        assert!(NodeConfig::load_from_file(&temp_path()).await.is_err());
    }

    #[test]
    fn test_zero_autodeposit_amount_is_rejected() {
        assert!(AutoDepositConfig::default().amount().is_err());
    }

    #[test]
    fn test_derived_component_configs() {
        let mut config = NodeConfig::default();
        config.role = PeerRole::Provider;
        config.tracker.history_limit = 42;
        config.listener.max_block_range = 0;

        let tracker = config.tracker_config();
        assert_eq!(tracker.role, PeerRole::Provider);
        assert_eq!(tracker.history_limit, 42);
        assert_eq!(config.publisher_config().max_block_range, 1);
        assert_eq!(config.watcher_config().timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("Bidder".parse::<PeerRole>().unwrap(), PeerRole::Bidder);
        assert!("builder".parse::<PeerRole>().is_err());
    }
}
