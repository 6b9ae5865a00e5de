use alloy_primitives::U256;

/// Narrows an on-chain quantity such as a block or window number to `u64`,
/// saturating when the value does not fit.
#[inline]
pub fn to_u64_saturating(value: U256) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// Widens a list of window numbers for a contract call.
#[inline]
pub fn windows_to_u256(windows: &[u64]) -> Vec<U256> {
    windows.iter().map(|w| U256::from(*w)).collect()
}
