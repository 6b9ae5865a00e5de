use alloy_sol_types::sol;

use crate::events::ContractAbi;

sol! {
    interface IBlockTracker {
        #[derive(Debug)]
        event NewL1Block(uint256 indexed blockNumber, address indexed winner, uint256 indexed window);

        #[derive(Debug)]
        event NewWindow(uint256 indexed window);

        function getBlocksPerWindow() external view returns (uint256);

        function getCurrentWindow() external view returns (uint256);

        function getBlockWinner(uint256 blockNumber) external view returns (address);
    }
}

pub const CONTRACT_NAME: &str = "BlockTracker";

pub fn abi() -> ContractAbi {
    ContractAbi::new(CONTRACT_NAME)
        .with_event::<IBlockTracker::NewL1Block>()
        .with_event::<IBlockTracker::NewWindow>()
}
