//! Solidity bindings for the contracts the node listens to and calls.

use crate::events::ContractAbi;

pub mod bidder_registry;
pub mod block_tracker;
pub mod oracle;
pub mod preconf_manager;

/// Every contract interface the event listener resolves names against.
pub fn known_contracts() -> Vec<ContractAbi> {
    vec![
        block_tracker::abi(),
        bidder_registry::abi(),
        preconf_manager::abi(),
        oracle::abi(),
    ]
}
