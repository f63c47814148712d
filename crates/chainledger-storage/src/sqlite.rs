//! SQLite persistence sink for ChainLedger.
//!
//! Persists the chain head, transactions, balances, per-key history and token
//! metadata to a single SQLite file. Uses `sqlx` with WAL mode so readers do
//! not block the commit worker.
//!
//! # Usage
//! ```rust,no_run
//! use chainledger_storage::sqlite::SqliteSink;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let sink = SqliteSink::open("./ledger.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let sink = SqliteSink::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use alloy_primitives::I256;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use chainledger_core::types::split_key;
use chainledger_core::{
    Amount, AppliedBlock, BlockHeader, LedgerError, PersistenceSink, TokenInfo, Transaction,
};

fn storage_err(e: sqlx::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

/// SQLite-backed [`PersistenceSink`].
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./ledger.db"`) or a full
    /// SQLite URL (`"sqlite:./ledger.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, LedgerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let sink = Self { pool };
        sink.init_schema().await?;
        Ok(sink)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection to `sqlite::memory:` is a separate database, so the
    /// pool holds exactly one connection and never recycles it.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let sink = Self { pool };
        sink.init_schema().await?;
        Ok(sink)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), LedgerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        // Single-row chain head
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chain_head (
                id          INTEGER PRIMARY KEY CHECK (id = 1),
                height      INTEGER NOT NULL,
                hash        TEXT    NOT NULL,
                parent_hash TEXT    NOT NULL,
                timestamp   INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transactions (
                hash   TEXT    PRIMARY KEY,
                height INTEGER NOT NULL,
                body   TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        // Balances are signed 256-bit decimals, stored as text
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS balances (
                key     TEXT PRIMARY KEY,
                balance TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        // Insertion order is history order
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS history (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT    NOT NULL,
                hash    TEXT    NOT NULL,
                UNIQUE (address, hash)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_address ON history (address, id);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tokens (
                address  TEXT    PRIMARY KEY,
                name     TEXT    NOT NULL,
                symbol   TEXT    NOT NULL,
                decimals INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Number of stored transactions.
    pub async fn transaction_count(&self) -> Result<u64, LedgerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM transactions")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        let cnt: i64 = row.try_get("cnt").map_err(storage_err)?;
        Ok(cnt as u64)
    }
}

fn parse_balance(key: &str, raw: &str) -> Result<Amount, LedgerError> {
    I256::from_str(raw)
        .map_err(|e| LedgerError::Storage(format!("corrupt balance for {key}: {raw:?} ({e})")))
}

fn decode_tx(row: &SqliteRow) -> Result<Transaction, LedgerError> {
    let body: String = row.try_get("body").map_err(storage_err)?;
    serde_json::from_str(&body).map_err(|e| LedgerError::Storage(format!("corrupt transaction: {e}")))
}

// ─── PersistenceSink impl ────────────────────────────────────────────────────

#[async_trait]
impl PersistenceSink for SqliteSink {
    async fn head(&self) -> Result<Option<BlockHeader>, LedgerError> {
        let row = sqlx::query(
            "SELECT height, hash, parent_hash, timestamp FROM chain_head WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(|r| {
            Ok(BlockHeader {
                height: r.try_get::<i64, _>("height").map_err(storage_err)? as u64,
                hash: r.try_get("hash").map_err(storage_err)?,
                parent_hash: r.try_get("parent_hash").map_err(storage_err)?,
                timestamp: r.try_get("timestamp").map_err(storage_err)?,
            })
        })
        .transpose()
    }

    async fn balance(&self, key: &str) -> Result<Option<Amount>, LedgerError> {
        let row = sqlx::query("SELECT balance FROM balances WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        match row {
            Some(r) => {
                let raw: String = r.try_get("balance").map_err(storage_err)?;
                parse_balance(key, &raw).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn commit_block(&self, block: &AppliedBlock) -> Result<(), LedgerError> {
        let header = block.header();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(
            "INSERT OR REPLACE INTO chain_head (id, height, hash, parent_hash, timestamp)
             VALUES (1, ?, ?, ?, ?)",
        )
        .bind(header.height as i64)
        .bind(&header.hash)
        .bind(&header.parent_hash)
        .bind(header.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        for (hash, transaction) in &block.block.transactions {
            let body = serde_json::to_string(transaction.as_ref())
                .map_err(|e| LedgerError::Storage(format!("cannot encode {hash}: {e}")))?;
            sqlx::query("INSERT OR IGNORE INTO transactions (hash, height, body) VALUES (?, ?, ?)")
                .bind(hash)
                .bind(transaction.height as i64)
                .bind(&body)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }

        for (key, account) in &block.accounts {
            sqlx::query("INSERT OR REPLACE INTO balances (key, balance) VALUES (?, ?)")
                .bind(key)
                .bind(account.balance.to_string())
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;

            for hash in &account.history {
                sqlx::query("INSERT OR IGNORE INTO history (address, hash) VALUES (?, ?)")
                    .bind(key)
                    .bind(hash)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
            }
        }

        tx.commit().await.map_err(storage_err)?;

        debug!(
            height = header.height,
            txs = block.block.transactions.len(),
            accounts = block.accounts.len(),
            "block stored"
        );
        Ok(())
    }

    async fn history(
        &self,
        key: &str,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let rows = sqlx::query(
            "SELECT t.body FROM history h
             JOIN transactions t ON t.hash = h.hash
             WHERE h.address = ?
             ORDER BY h.id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(key)
        .bind(limit as i64)
        .bind(skip as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(decode_tx).collect()
    }

    async fn token(&self, address: &str) -> Result<Option<TokenInfo>, LedgerError> {
        let row = sqlx::query("SELECT address, name, symbol, decimals FROM tokens WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        row.map(|r| {
            Ok(TokenInfo {
                address: r.try_get("address").map_err(storage_err)?,
                name: r.try_get("name").map_err(storage_err)?,
                symbol: r.try_get("symbol").map_err(storage_err)?,
                decimals: r.try_get::<i64, _>("decimals").map_err(storage_err)? as u32,
            })
        })
        .transpose()
    }

    async fn save_token(&self, info: TokenInfo) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO tokens (address, name, symbol, decimals) VALUES (?, ?, ?, ?)",
        )
        .bind(&info.address)
        .bind(&info.name)
        .bind(&info.symbol)
        .bind(i64::from(info.decimals))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(token = %info.address, symbol = %info.symbol, "token saved");
        Ok(())
    }

    async fn token_keys(&self, address: &str) -> Result<Vec<String>, LedgerError> {
        let prefix = format!("{address}-");
        let rows = sqlx::query("SELECT key FROM balances WHERE substr(key, 1, ?) = ? ORDER BY key")
            .bind(prefix.len() as i64)
            .bind(&prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let mut tokens = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key").map_err(storage_err)?;
            if let (_, Some(token)) = split_key(&key) {
                tokens.push(token.to_string());
            }
        }
        Ok(tokens)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
