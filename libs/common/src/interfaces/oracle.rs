use alloy_sol_types::sol;

use crate::events::ContractAbi;

sol! {
    interface IOracle {
        /// Settlement verdict for an opened commitment.
        #[derive(Debug)]
        event CommitmentProcessed(bytes32 indexed commitmentIndex, bool isSlash);
    }
}

pub const CONTRACT_NAME: &str = "Oracle";

pub fn abi() -> ContractAbi {
    ContractAbi::new(CONTRACT_NAME).with_event::<IOracle::CommitmentProcessed>()
}
