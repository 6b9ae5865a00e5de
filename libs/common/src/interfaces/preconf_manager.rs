use alloy_sol_types::sol;

use crate::events::ContractAbi;

sol! {
    interface IPreconfManager {
        /// Emitted when a provider stores the hashed form of a commitment.
        #[derive(Debug)]
        event UnopenedCommitmentStored(
            bytes32 indexed commitmentIndex,
            address committer,
            bytes32 commitmentDigest,
            bytes commitmentSignature,
            uint64 dispatchTimestamp
        );

        /// Emitted when either party reveals the full commitment on chain.
        #[derive(Debug)]
        event OpenedCommitmentStored(
            bytes32 indexed commitmentIndex,
            address bidder,
            address committer,
            uint256 bidAmt,
            uint64 blockNumber,
            bytes32 bidHash,
            uint64 decayStartTimeStamp,
            uint64 decayEndTimeStamp,
            string txnHash,
            string revertingTxHashes,
            bytes32 commitmentDigest,
            bytes bidSignature,
            bytes commitmentSignature,
            uint64 dispatchTimestamp,
            bytes sharedSecretKey
        );

        function storeUnopenedCommitment(
            bytes32 commitmentDigest,
            bytes commitmentSignature,
            uint64 dispatchTimestamp
        ) external returns (bytes32 commitmentIndex);

        function openCommitment(
            bytes32 unopenedCommitmentIndex,
            uint256 bidAmt,
            uint256 slashAmt,
            uint64 blockNumber,
            string txnHash,
            string revertingTxHashes,
            uint64 decayStartTimeStamp,
            uint64 decayEndTimeStamp,
            bytes bidSignature,
            bytes commitmentSignature,
            bytes sharedSecretKey
        ) external returns (bytes32 commitmentIndex);
    }
}

pub const CONTRACT_NAME: &str = "PreconfManager";

pub fn abi() -> ContractAbi {
    ContractAbi::new(CONTRACT_NAME)
        .with_event::<IPreconfManager::UnopenedCommitmentStored>()
        .with_event::<IPreconfManager::OpenedCommitmentStored>()
}
