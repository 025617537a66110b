//! SQLite-backed credit ledger

use async_trait::async_trait;

use super::{CreditLedger, LedgerError};
use crate::db::{CreditRepository, Database};
use crate::types::OwnerId;

/// Ledger persisted in the `credit_accounts` table
///
/// Unknown owners are created with `initial_balance` on first use.
pub struct SqliteCreditLedger {
    credits: CreditRepository,
    initial_balance: u64,
}

impl SqliteCreditLedger {
    pub fn new(db: Database, initial_balance: u64) -> Self {
        Self {
            credits: CreditRepository::new(db),
            initial_balance,
        }
    }

    pub fn repository(&self) -> &CreditRepository {
        &self.credits
    }
}

#[async_trait]
impl CreditLedger for SqliteCreditLedger {
    async fn try_reserve(&self, owner: &OwnerId, amount: u64) -> Result<bool, LedgerError> {
        self.credits
            .ensure_account(owner.as_str(), self.initial_balance)
            .await?;
        Ok(self.credits.reserve(owner.as_str(), amount).await?)
    }

    async fn refund(&self, owner: &OwnerId, amount: u64) -> Result<(), LedgerError> {
        Ok(self.credits.refund(owner.as_str(), amount).await?)
    }
}
