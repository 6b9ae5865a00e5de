use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::storage::StoreError;

/// Windows the auto-depositor currently holds a deposit in.
pub trait DepositStore: Send + Sync {
    fn store_deposits(&self, windows: &[u64]) -> Result<(), StoreError>;

    /// Tracked windows in ascending order, all of them or only those `<= till`.
    fn list_deposits(&self, till: Option<u64>) -> Result<Vec<u64>, StoreError>;

    fn clear_deposits(&self, windows: &[u64]) -> Result<(), StoreError>;

    fn is_deposit_made(&self, window: u64) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryDepositStore {
    windows: Mutex<BTreeMap<u64, bool>>,
}

impl InMemoryDepositStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DepositStore for InMemoryDepositStore {
    fn store_deposits(&self, windows: &[u64]) -> Result<(), StoreError> {
        let mut tracked = self.windows.lock();
        for window in windows {
            tracked.insert(*window, true);
        }
        Ok(())
    }

    fn list_deposits(&self, till: Option<u64>) -> Result<Vec<u64>, StoreError> {
        let tracked = self.windows.lock();
        Ok(tracked
            .iter()
            .filter(|(w, active)| **active && till.map_or(true, |t| **w <= t))
            .map(|(w, _)| *w)
            .collect())
    }

    fn clear_deposits(&self, windows: &[u64]) -> Result<(), StoreError> {
        let mut tracked = self.windows.lock();
        for window in windows {
            tracked.remove(window);
        }
        Ok(())
    }

    fn is_deposit_made(&self, window: u64) -> Result<bool, StoreError> {
        Ok(self.windows.lock().get(&window).copied().unwrap_or(false))
    }
}
