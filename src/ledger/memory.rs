//! In-memory credit ledger

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{CreditLedger, LedgerError};
use crate::types::OwnerId;

/// Ledger kept in process memory
///
/// Unknown owners start with `default_balance`.
#[derive(Debug, Default)]
pub struct InMemoryCreditLedger {
    balances: Mutex<HashMap<OwnerId, u64>>,
    default_balance: u64,
}

impl InMemoryCreditLedger {
    pub fn new(default_balance: u64) -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
            default_balance,
        }
    }

    pub fn with_balance(self, owner: impl Into<OwnerId>, balance: u64) -> Self {
        self.balances.lock().insert(owner.into(), balance);
        self
    }

    pub fn grant(&self, owner: &OwnerId, amount: u64) {
        let mut balances = self.balances.lock();
        let balance = balances.entry(owner.clone()).or_insert(self.default_balance);
        *balance = balance.saturating_add(amount);
    }

    pub fn balance(&self, owner: &OwnerId) -> u64 {
        self.balances
            .lock()
            .get(owner)
            .copied()
            .unwrap_or(self.default_balance)
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn try_reserve(&self, owner: &OwnerId, amount: u64) -> Result<bool, LedgerError> {
        let mut balances = self.balances.lock();
        let balance = balances.entry(owner.clone()).or_insert(self.default_balance);
        if *balance < amount {
            debug!(owner_id = %owner, balance = *balance, amount, "reservation refused");
            return Ok(false);
        }
        *balance -= amount;
        Ok(true)
    }

    async fn refund(&self, owner: &OwnerId, amount: u64) -> Result<(), LedgerError> {
        self.grant(owner, amount);
        Ok(())
    }
}
