//! Credit ledger adapters
//!
//! The coordinator only needs an atomic `try_reserve` and a `refund`; both
//! adapters here provide that, one in memory and one on SQLite.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::types::OwnerId;

pub use memory::InMemoryCreditLedger;
pub use sqlite::SqliteCreditLedger;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// External credit ledger
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Deduct `amount` if the balance covers it; must not double-spend
    /// under concurrent reservations
    async fn try_reserve(&self, owner: &OwnerId, amount: u64) -> Result<bool, LedgerError>;

    /// Return `amount` to the owner's balance
    async fn refund(&self, owner: &OwnerId, amount: u64) -> Result<(), LedgerError>;
}
