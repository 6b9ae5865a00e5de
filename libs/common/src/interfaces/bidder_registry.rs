use alloy_sol_types::sol;

use crate::events::ContractAbi;

sol! {
    interface IBidderRegistry {
        #[derive(Debug)]
        event BidderRegistered(address indexed bidder, uint256 indexed depositedAmount, uint256 indexed windowNumber);

        #[derive(Debug)]
        event BidderWithdrawal(address indexed bidder, uint256 indexed window, uint256 indexed amount);

        #[derive(Debug)]
        event FundsRewarded(bytes32 indexed commitmentDigest, address indexed bidder, address indexed provider, uint256 window, uint256 amount);

        #[derive(Debug)]
        event FundsRetrieved(bytes32 indexed commitmentDigest, address indexed bidder, uint256 indexed window, uint256 amount);

        function depositForWindow(uint256 window) external payable;

        function depositForWindows(uint256[] calldata windows) external payable;

        function withdrawFromWindows(uint256[] calldata windows) external;

        function getDeposit(address bidder, uint256 window) external view returns (uint256);
    }
}

pub const CONTRACT_NAME: &str = "BidderRegistry";

pub fn abi() -> ContractAbi {
    ContractAbi::new(CONTRACT_NAME)
        .with_event::<IBidderRegistry::BidderRegistered>()
        .with_event::<IBidderRegistry::BidderWithdrawal>()
        .with_event::<IBidderRegistry::FundsRewarded>()
        .with_event::<IBidderRegistry::FundsRetrieved>()
}
