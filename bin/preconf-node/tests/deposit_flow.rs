mod support;

use std::sync::Arc;

use alloy_primitives::U256;
use common::events::Listener;
use common::interfaces::bidder_registry::IBidderRegistry::BidderRegistered;
use common::interfaces::block_tracker::IBlockTracker::NewWindow;
use common::interfaces::known_contracts;
use preconf_node::deposit::{BalanceStore, BlockKey, DepositError, DepositManager, InMemoryBalanceStore};

use support::{eventually, publish, MockBlockTracker, MockRegistry, BIDDER};

struct Node {
    listener: Arc<Listener>,
    manager: Arc<DepositManager>,
    store: Arc<InMemoryBalanceStore>,
}

fn node() -> Node {
    let listener = Arc::new(Listener::new(known_contracts()));
    let store = Arc::new(InMemoryBalanceStore::new());
    let manager = Arc::new(DepositManager::new(
        store.clone(),
        Arc::new(MockRegistry::default()),
        Arc::new(MockBlockTracker {
            blocks_per_window: 10,
            current_window: 1,
        }),
        listener.clone(),
    ));
    Node {
        listener,
        manager,
        store,
    }
}

async fn register(node: &Node, window: u64, amount: u64) {
    let event = BidderRegistered {
        bidder: BIDDER,
        depositedAmount: U256::from(amount),
        windowNumber: U256::from(window),
    };
    publish(&node.listener, &event, window * 10).await;

    let store = node.store.clone();
    assert!(
        eventually(|| {
            let store = store.clone();
            async move { store.window_balance(BIDDER, window).unwrap().is_some() }
        })
        .await,
        "registration for window {window} was not applied"
    );
}

#[tokio::test]
async fn test_registered_deposit_is_spent_once_per_block() {
    let node = node();
    let handle = node.manager.start().unwrap();
    register(&node, 1, 100).await;

    assert_eq!(node.store.window_balance(BIDDER, 1).unwrap(), Some(U256::from(10u64)));

    let refund = node.manager.check_and_deduct_deposit(BIDDER, "10", 5).await.unwrap();
    assert_eq!(refund.remaining(), U256::ZERO);

    let err = node
        .manager
        .check_and_deduct_deposit(BIDDER, "10", 5)
        .await
        .unwrap_err();
    assert!(matches!(err, DepositError::InsufficientBalance { block: 5, .. }));
    assert!(err.is_failed_precondition());
    assert!(!err.is_not_found());

    // Other blocks of the window have their own allowance.
    node.manager.check_and_deduct_deposit(BIDDER, "10", 6).await.unwrap();

    node.manager.cancel_token().cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_deduction_leaves_balance_untouched() {
    let node = node();
    let handle = node.manager.start().unwrap();
    register(&node, 1, 100).await;

    node.manager.check_and_deduct_deposit(BIDDER, "7", 5).await.unwrap();
    assert!(node.manager.check_and_deduct_deposit(BIDDER, "4", 5).await.is_err());

    let key = BlockKey {
        bidder: BIDDER,
        window: 1,
        block: 5,
    };
    assert_eq!(node.store.block_balance(key).unwrap(), Some(U256::from(3u64)));

    node.manager.cancel_token().cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_refund_restores_exact_balance() {
    let node = node();
    let handle = node.manager.start().unwrap();
    register(&node, 1, 100).await;

    let key = BlockKey {
        bidder: BIDDER,
        window: 1,
        block: 3,
    };
    node.manager.check_and_deduct_deposit(BIDDER, "2", 3).await.unwrap();
    let before = node.store.block_balance(key).unwrap();

    let refund = node.manager.check_and_deduct_deposit(BIDDER, "5", 3).await.unwrap();
    assert_eq!(refund.amount(), U256::from(5u64));
    refund.refund().unwrap();

    assert_eq!(node.store.block_balance(key).unwrap(), before);

    node.manager.cancel_token().cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_new_window_clears_overlays_two_windows_back() {
    let node = node();
    let handle = node.manager.start().unwrap();

    for window in 1..=3 {
        register(&node, window, 100).await;
        let block = (window - 1) * 10 + 1;
        node.manager
            .check_and_deduct_deposit(BIDDER, "1", block)
            .await
            .unwrap();
    }
    assert_eq!(node.store.overlay_windows(), vec![1, 2, 3]);

    publish(&node.listener, &NewWindow { window: U256::from(3u64) }, 21).await;

    let store = node.store.clone();
    assert!(
        eventually(|| {
            let store = store.clone();
            async move { store.overlay_windows() == vec![2, 3] }
        })
        .await
    );
    assert_eq!(node.store.window_balance(BIDDER, 1).unwrap(), None);

    node.manager.cancel_token().cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_malformed_amount_is_invalid_argument() {
    let node = node();
    let err = node
        .manager
        .check_and_deduct_deposit(BIDDER, "ten", 5)
        .await
        .unwrap_err();
    assert!(err.is_invalid_argument());
    assert!(!err.is_failed_precondition());
}
