//! Credit account repository

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CreditEventKind {
    Grant,
    Reserve,
    Refund,
}

impl CreditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditEventKind::Grant => "grant",
            CreditEventKind::Reserve => "reserve",
            CreditEventKind::Refund => "refund",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "grant" => Ok(CreditEventKind::Grant),
            "reserve" => Ok(CreditEventKind::Reserve),
            "refund" => Ok(CreditEventKind::Refund),
            _ => anyhow::bail!("Unknown credit event kind: {}", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditEvent {
    pub id: String,
    pub owner_id: String,
    pub kind: CreditEventKind,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
}

pub struct CreditRepository {
    db: Database,
}

impl CreditRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the account with `initial_balance` unless it already exists
    pub async fn ensure_account(&self, owner_id: &str, initial_balance: u64) -> Result<()> {
        let balance = to_sql_amount(initial_balance)?;
        let now = Utc::now().to_rfc3339();

        let conn = self.db.lock().await;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO credit_accounts (owner_id, balance, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![owner_id, balance, now],
            )
            .context("Failed to create credit account")?;

        if inserted == 1 {
            tracing::debug!("Created credit account {} with {} credits", owner_id, initial_balance);
        }
        Ok(())
    }

    /// Current balance, or `None` for unknown owners
    pub async fn balance(&self, owner_id: &str) -> Result<Option<u64>> {
        let conn = self.db.lock().await;
        let balance: Option<i64> = conn
            .query_row(
                "SELECT balance FROM credit_accounts WHERE owner_id = ?1",
                params![owner_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read credit balance")?;

        Ok(balance.map(|b| b.max(0) as u64))
    }

    /// Deduct `amount` iff the balance covers it
    ///
    /// The check and the deduction are one conditional UPDATE.
    pub async fn reserve(&self, owner_id: &str, amount: u64) -> Result<bool> {
        let amount_sql = to_sql_amount(amount)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let updated = tx
            .execute(
                "UPDATE credit_accounts SET balance = balance - ?1, updated_at = ?2
                 WHERE owner_id = ?3 AND balance >= ?1",
                params![amount_sql, now, owner_id],
            )
            .context("Failed to reserve credits")?;

        if updated == 0 {
            return Ok(false);
        }

        insert_event(&tx, owner_id, CreditEventKind::Reserve, amount_sql, &now)?;
        tx.commit()?;
        Ok(true)
    }

    /// Add `amount` back to the account
    pub async fn refund(&self, owner_id: &str, amount: u64) -> Result<()> {
        self.credit(owner_id, amount, CreditEventKind::Refund).await
    }

    /// Top up an account, creating it if needed
    pub async fn grant(&self, owner_id: &str, amount: u64) -> Result<()> {
        self.credit(owner_id, amount, CreditEventKind::Grant).await
    }

    async fn credit(&self, owner_id: &str, amount: u64, kind: CreditEventKind) -> Result<()> {
        let amount_sql = to_sql_amount(amount)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO credit_accounts (owner_id, balance, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(owner_id) DO UPDATE SET
                balance = balance + excluded.balance,
                updated_at = excluded.updated_at",
            params![owner_id, amount_sql, now],
        )
        .with_context(|| format!("Failed to apply credit {}", kind.as_str()))?;
        insert_event(&tx, owner_id, kind, amount_sql, &now)?;
        tx.commit()?;

        tracing::debug!("Applied {} of {} credits to {}", kind.as_str(), amount, owner_id);
        Ok(())
    }

    /// Journal entries for an owner, oldest first
    pub async fn events(&self, owner_id: &str) -> Result<Vec<CreditEvent>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, kind, amount, created_at
             FROM credit_events WHERE owner_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;

        let events = stmt.query_map(params![owner_id], Self::map_row)?;
        events
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to collect credit events")
    }

    fn map_row(row: &rusqlite::Row) -> rusqlite::Result<CreditEvent> {
        Ok(CreditEvent {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            kind: CreditEventKind::from_str(&row.get::<_, String>(2)?)
                .unwrap_or(CreditEventKind::Grant),
            amount: row.get::<_, i64>(3)?.max(0) as u64,
            created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(4)?)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

fn insert_event(
    conn: &rusqlite::Connection,
    owner_id: &str,
    kind: CreditEventKind,
    amount: i64,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO credit_events (id, owner_id, kind, amount, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![Uuid::new_v4().to_string(), owner_id, kind.as_str(), amount, now],
    )
    .context("Failed to journal credit event")?;
    Ok(())
}

fn to_sql_amount(amount: u64) -> Result<i64> {
    i64::try_from(amount).context("Credit amount out of range")
}
