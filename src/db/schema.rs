//! SQL schema definitions

pub const SCHEMA: &str = r#"
-- Credit balances, one row per owner
CREATE TABLE IF NOT EXISTS credit_accounts (
    owner_id TEXT PRIMARY KEY,
    balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Append-only journal of balance changes
CREATE TABLE IF NOT EXISTS credit_events (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    amount INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (owner_id) REFERENCES credit_accounts(owner_id) ON DELETE CASCADE
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_credit_events_owner_id ON credit_events(owner_id);
"#;
