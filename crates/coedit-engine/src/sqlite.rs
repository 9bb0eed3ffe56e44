//! SQLite-backed lock store
//!
//! One row per locked block. The `block_id` primary key is the mutual
//! exclusion guarantee: a losing concurrent insert fails with a uniqueness
//! violation, which is reported as `InsertOutcome::Conflict`. Timestamps are
//! stored as epoch milliseconds.

use crate::store::{InsertOutcome, LockStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coedit_core::{Actor, Error, Lock, LockType, Result, SessionKey, MAX_LOCK_TTL_MS};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS block_locks (
    block_id TEXT PRIMARY KEY NOT NULL,
    document_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    locked_by TEXT NOT NULL,
    lock_type TEXT NOT NULL CHECK(lock_type IN ('human', 'agent')),
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_block_locks_document ON block_locks(document_id);
CREATE INDEX IF NOT EXISTS idx_block_locks_session ON block_locks(session_id);
CREATE INDEX IF NOT EXISTS idx_block_locks_expires ON block_locks(expires_at);
";

const COLUMNS: &str =
    "block_id, document_id, session_id, locked_by, lock_type, acquired_at, expires_at";

#[derive(Clone)]
pub struct SqliteLockStore {
    pool: SqlitePool,
}

impl SqliteLockStore {
    /// Open (creating if needed) a database file.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect_with(options)
            .await
            .map_err(|e| Error::storage(format!("failed to open {}: {e}", path.display())))?;
        info!("Lock store opened at {}", path.display());
        Self::with_pool(pool).await
    }

    /// Private in-memory database. A single pooled connection that never
    /// recycles, since each SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::storage(format!("bad connection string: {e}")))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| Error::storage(format!("failed to open in-memory database: {e}")))?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::storage(format!("failed to initialize schema: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch(&self, sql: &str, binds: &[Bind<'_>]) -> Result<Vec<Lock>> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = match *bind {
                Bind::Text(s) => query.bind(s),
                Bind::Int(i) => query.bind(i),
            };
        }
        query
            .fetch_all(&self.pool)
            .await
            .map_err(Error::storage)?
            .into_iter()
            .map(parse_lock_row)
            .collect()
    }

    async fn fetch_one(&self, sql: &str, binds: &[Bind<'_>]) -> Result<Option<Lock>> {
        Ok(self.fetch(sql, binds).await?.into_iter().next())
    }
}

#[derive(Clone, Copy)]
enum Bind<'a> {
    Text(&'a str),
    Int(i64),
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn parse_timestamp(ms: i64, column: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::storage(format!("{column} out of range: {ms}")))
}

fn parse_lock_row(row: SqliteRow) -> Result<Lock> {
    let get_text = |column: &str| -> Result<String> {
        row.try_get::<String, _>(column)
            .map_err(|e| Error::storage(format!("failed to read {column}: {e}")))
    };
    let get_int = |column: &str| -> Result<i64> {
        row.try_get::<i64, _>(column)
            .map_err(|e| Error::storage(format!("failed to read {column}: {e}")))
    };

    let locked_by = Actor::from(get_text("locked_by")?);
    let lock_type = LockType::from_str(&get_text("lock_type")?)?;
    Ok(Lock {
        block_id: get_text("block_id")?,
        document_id: get_text("document_id")?,
        session_id: SessionKey::new(get_text("session_id")?),
        locked_by,
        acquired_at: parse_timestamp(get_int("acquired_at")?, "acquired_at")?,
        expires_at: parse_timestamp(get_int("expires_at")?, "expires_at")?,
        lock_type,
    })
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn insert_if_absent(&self, lock: Lock) -> Result<InsertOutcome> {
        let result = sqlx::query(&format!(
            "INSERT INTO block_locks ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&lock.block_id)
        .bind(&lock.document_id)
        .bind(lock.session_id.as_str())
        .bind(lock.locked_by.to_string())
        .bind(lock.lock_type.as_str())
        .bind(millis(lock.acquired_at))
        .bind(millis(lock.expires_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Ok(InsertOutcome::Conflict)
            }
            Err(e) => Err(Error::storage(format!("failed to insert lock: {e}"))),
        }
    }

    async fn get(&self, block_id: &str) -> Result<Option<Lock>> {
        self.fetch_one(
            &format!("SELECT {COLUMNS} FROM block_locks WHERE block_id = ?"),
            &[Bind::Text(block_id)],
        )
        .await
    }

    async fn list(&self) -> Result<Vec<Lock>> {
        self.fetch(
            &format!("SELECT {COLUMNS} FROM block_locks ORDER BY acquired_at"),
            &[],
        )
        .await
    }

    async fn list_document(&self, document_id: &str) -> Result<Vec<Lock>> {
        self.fetch(
            &format!(
                "SELECT {COLUMNS} FROM block_locks WHERE document_id = ? ORDER BY acquired_at"
            ),
            &[Bind::Text(document_id)],
        )
        .await
    }

    async fn delete_held(&self, block_id: &str, holder: &Actor) -> Result<Option<Lock>> {
        let holder = holder.to_string();
        self.fetch_one(
            &format!("DELETE FROM block_locks WHERE block_id = ? AND locked_by = ? RETURNING {COLUMNS}"),
            &[Bind::Text(block_id), Bind::Text(&holder)],
        )
        .await
    }

    async fn delete(&self, block_id: &str) -> Result<Option<Lock>> {
        self.fetch_one(
            &format!("DELETE FROM block_locks WHERE block_id = ? RETURNING {COLUMNS}"),
            &[Bind::Text(block_id)],
        )
        .await
    }

    async fn delete_session(&self, session: &SessionKey) -> Result<Vec<Lock>> {
        self.fetch(
            &format!("DELETE FROM block_locks WHERE session_id = ? RETURNING {COLUMNS}"),
            &[Bind::Text(session.as_str())],
        )
        .await
    }

    async fn delete_if_expired(&self, block_id: &str, now: DateTime<Utc>) -> Result<Option<Lock>> {
        self.fetch_one(
            &format!(
                "DELETE FROM block_locks WHERE block_id = ? AND expires_at <= ? RETURNING {COLUMNS}"
            ),
            &[Bind::Text(block_id), Bind::Int(millis(now))],
        )
        .await
    }

    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        document_id: Option<&str>,
    ) -> Result<Vec<Lock>> {
        match document_id {
            Some(doc) => {
                self.fetch(
                    &format!(
                        "DELETE FROM block_locks WHERE expires_at <= ? AND document_id = ? RETURNING {COLUMNS}"
                    ),
                    &[Bind::Int(millis(now)), Bind::Text(doc)],
                )
                .await
            }
            None => {
                self.fetch(
                    &format!("DELETE FROM block_locks WHERE expires_at <= ? RETURNING {COLUMNS}"),
                    &[Bind::Int(millis(now))],
                )
                .await
            }
        }
    }

    async fn extend(
        &self,
        block_id: &str,
        holder: &Actor,
        additional_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<Lock>> {
        let holder = holder.to_string();
        let additional = additional_ms.min(MAX_LOCK_TTL_MS) as i64;
        self.fetch_one(
            &format!(
                "UPDATE block_locks SET expires_at = expires_at + ? \
                 WHERE block_id = ? AND locked_by = ? AND expires_at > ? RETURNING {COLUMNS}"
            ),
            &[
                Bind::Int(additional),
                Bind::Text(block_id),
                Bind::Text(&holder),
                Bind::Int(millis(now)),
            ],
        )
        .await
    }
}
