use std::path::PathBuf;
use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use clap::Parser;
use common::events::{FileProgressStore, Listener, Publisher};
use common::interfaces::known_contracts;
use common::tasks::TaskGroup;
use eyre::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use preconf_node::autodeposit::{AutoDepositTracker, InMemoryDepositStore};
use preconf_node::chain::{ReceiptWatcher, RpcClient};
use preconf_node::commitments::{CommitmentTracker, InMemoryCommitmentStore, PeerRole};
use preconf_node::config::NodeConfig;
use preconf_node::deposit::{DepositManager, InMemoryBalanceStore};
use preconf_node::notifications::LogNotifier;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration directory
    #[arg(long, default_value = "./configs/dev")]
    config_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Runs a component's worker inside the group and cancels it when the group stops.
fn supervise(
    group: &mut TaskGroup,
    name: &'static str,
    cancel: CancellationToken,
    mut handle: JoinHandle<eyre::Result<()>>,
) {
    let group_token = group.token();
    group.spawn(name, async move {
        tokio::select! {
            joined = &mut handle => joined?,
            _ = group_token.cancelled() => {
                cancel.cancel();
                handle.await?
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting preconf node");

    let config_path = PathBuf::from(&cli.config_path).join("node.json");
    let config = if config_path.exists() {
        NodeConfig::load_from_file(&config_path).await?
    } else {
        tracing::warn!(path = %config_path.display(), "node.json not found, using defaults");
        NodeConfig::default()
    };
    let config = config.with_env_overrides()?;

    tracing::info!(role = %config.role, rpc_url = %config.chain.rpc_url, "Config loaded");

    let private_key = std::env::var("PRIVATE_KEY")
        .map_err(|_| eyre::eyre!("PRIVATE_KEY environment variable is required"))?;
    let signer: PrivateKeySigner = private_key.parse()?;
    let owner = signer.address();
    let wallet = EthereumWallet::from(signer);
    tracing::info!(from = %owner, "Wallet loaded for signing transactions");

    let provider = ProviderBuilder::new()
        .wallet(wallet)
        .connect_http(config.chain.rpc_url.parse()?);

    let client = Arc::new(RpcClient::new(provider.clone(), config.chain.contracts, owner));
    let watcher = Arc::new(ReceiptWatcher::new(provider, owner, config.watcher_config()));

    let listener = Arc::new(Listener::new(known_contracts()));
    let progress = Arc::new(FileProgressStore::new(&config.listener.progress_path));
    let publisher = Arc::new(Publisher::new(
        config.publisher_config(),
        client.clone(),
        progress,
        listener.clone(),
    ));
    for address in config.chain.contracts.all() {
        publisher.add_contract(address).await;
    }

    let shutdown = CancellationToken::new();
    let mut group = TaskGroup::new(&shutdown);

    let tracker = Arc::new(CommitmentTracker::new(
        config.tracker_config(),
        Arc::new(InMemoryCommitmentStore::new()),
        listener.clone(),
        client.clone(),
        watcher,
        Arc::new(LogNotifier),
    ));
    supervise(&mut group, "commitment-tracker", tracker.cancel_token(), tracker.start()?);

    if config.role == PeerRole::Provider {
        let mut manager = DepositManager::new(
            Arc::new(InMemoryBalanceStore::new()),
            client.clone(),
            client.clone(),
            listener.clone(),
        );
        if let Some(blocks_per_window) = config.deposit.blocks_per_window {
            manager = manager.with_blocks_per_window(blocks_per_window);
        }
        let manager = Arc::new(manager);
        supervise(&mut group, "deposit-manager", manager.cancel_token(), manager.start()?);
    }

    let autodeposit = if config.role == PeerRole::Bidder && config.autodeposit.enabled {
        let amount = config.autodeposit.amount()?;
        let autodeposit = Arc::new(
            AutoDepositTracker::new(
                owner,
                Arc::new(InMemoryDepositStore::new()),
                client.clone(),
                client.clone(),
                listener.clone(),
            )
            .with_oracle_window_offset(config.autodeposit.oracle_window_offset),
        );
        autodeposit.start(config.autodeposit.start_window, amount).await?;
        Some(autodeposit)
    } else {
        None
    };

    {
        let publisher = publisher.clone();
        let token = group.token();
        group.spawn("publisher", async move { Ok(publisher.run(token).await?) });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                shutdown.cancel();
            }
        });
    }

    let result = group.wait().await;

    if let Some(autodeposit) = autodeposit {
        match autodeposit.stop() {
            Ok(windows) => tracing::info!(?windows, "Windows still holding a deposit"),
            Err(e) => tracing::warn!(error = %e, "Auto deposit tracker already stopped"),
        }
    }

    tracing::info!("Preconf node stopped");
    result
}
