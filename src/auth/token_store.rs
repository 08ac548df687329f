//! Ephemeral Token Store
//! Mission: Persist single-use, expiring secrets with atomic redemption
//!
//! Secrets are stored as SHA-256 digests; the plaintext only ever exists in
//! the response that hands it to the client.

use crate::auth::{
    errors::StoreError,
    models::{SecretKind, SecretRecord},
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Secret storage contract shared by every backend.
///
/// `find_and_consume` must be atomic: of N concurrent callers presenting the
/// same secret, exactly one receives the record and the rest `NotFound`.
#[async_trait]
pub trait EphemeralTokenStore: Send + Sync {
    /// Store a secret for `owner`; a repeated secret overwrites the old row.
    async fn put(
        &self,
        kind: SecretKind,
        secret: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Drop every secret of `kind` owned by `owner` and store `secret` in its
    /// place, as one step. Concurrent callers leave exactly one secret behind.
    async fn replace_for_owner(
        &self,
        kind: SecretKind,
        secret: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Read and delete a secret in one step.
    async fn find_and_consume(
        &self,
        kind: SecretKind,
        secret: &str,
    ) -> Result<SecretRecord, StoreError>;

    /// Non-destructive read.
    async fn peek(&self, kind: SecretKind, secret: &str) -> Result<SecretRecord, StoreError>;

    /// Delete every secret of `kind` owned by `owner`. Returns the count removed.
    async fn delete_all_for_owner(&self, kind: SecretKind, owner: &str)
        -> Result<u64, StoreError>;

    /// Delete every secret whose expiry has passed. Returns the count removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// SHA-256 digest of a secret (single pass - secrets are already high-entropy).
pub fn hash_secret(secret: &str) -> String {
    let mut h = Sha256::new();
    h.update(secret.as_bytes());
    hex::encode(h.finalize())
}

pub(crate) fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .with_context(|| format!("Timestamp out of range: {ms}"))
        .map_err(StoreError::Backend)
}

fn insert_secret(
    conn: &Connection,
    kind: SecretKind,
    secret: &str,
    owner: &str,
    expires_at: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO ephemeral_secrets (kind, secret_hash, owner, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(kind, secret_hash) DO UPDATE SET
            owner = excluded.owner,
            expires_at = excluded.expires_at,
            created_at = excluded.created_at",
        params![
            kind.as_str(),
            hash_secret(secret),
            owner,
            expires_at.timestamp_millis(),
            Utc::now().timestamp_millis(),
        ],
    )
}

/// Token store with SQLite backend
#[derive(Clone)]
pub struct SqliteTokenStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTokenStore {
    /// Open (or create) the token database at the given path.
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open token database at {}", db_path))?;
        Self::init(conn)
    }

    /// Private in-memory database, for tests and throwaway deployments.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ephemeral_secrets (
                kind TEXT NOT NULL,
                secret_hash TEXT NOT NULL,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (kind, secret_hash)
            ) WITHOUT ROWID;
            CREATE INDEX IF NOT EXISTS idx_ephemeral_secrets_owner
                ON ephemeral_secrets(kind, owner);
            CREATE INDEX IF NOT EXISTS idx_ephemeral_secrets_expires
                ON ephemeral_secrets(expires_at);",
        )
        .context("Failed to initialize token schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl EphemeralTokenStore for SqliteTokenStore {
    async fn put(
        &self,
        kind: SecretKind,
        secret: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        insert_secret(&conn, kind, secret, owner, expires_at)?;
        debug!(kind = kind.as_str(), owner, "Stored secret");
        Ok(())
    }

    async fn replace_for_owner(
        &self,
        kind: SecretKind,
        secret: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let replaced = tx.execute(
            "DELETE FROM ephemeral_secrets WHERE kind = ?1 AND owner = ?2",
            params![kind.as_str(), owner],
        )?;
        insert_secret(&tx, kind, secret, owner, expires_at)?;
        tx.commit()?;

        debug!(kind = kind.as_str(), owner, replaced, "Replaced secrets");
        Ok(())
    }

    async fn find_and_consume(
        &self,
        kind: SecretKind,
        secret: &str,
    ) -> Result<SecretRecord, StoreError> {
        // Single statement: the row is gone in the same step that reads it.
        let conn = self.conn.lock().await;
        let row: Option<(String, i64)> = conn
            .query_row(
                "DELETE FROM ephemeral_secrets
                 WHERE kind = ?1 AND secret_hash = ?2
                 RETURNING owner, expires_at",
                params![kind.as_str(), hash_secret(secret)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (owner, expires_at) = row.ok_or(StoreError::NotFound)?;
        Ok(SecretRecord {
            owner,
            expires_at: millis_to_datetime(expires_at)?,
        })
    }

    async fn peek(&self, kind: SecretKind, secret: &str) -> Result<SecretRecord, StoreError> {
        let conn = self.conn.lock().await;
        let (owner, expires_at): (String, i64) = conn.query_row(
            "SELECT owner, expires_at FROM ephemeral_secrets
             WHERE kind = ?1 AND secret_hash = ?2",
            params![kind.as_str(), hash_secret(secret)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(SecretRecord {
            owner,
            expires_at: millis_to_datetime(expires_at)?,
        })
    }

    async fn delete_all_for_owner(
        &self,
        kind: SecretKind,
        owner: &str,
    ) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM ephemeral_secrets WHERE kind = ?1 AND owner = ?2",
            params![kind.as_str(), owner],
        )?;
        Ok(deleted as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM ephemeral_secrets WHERE expires_at < ?1",
            params![now.timestamp_millis()],
        )?;
        if deleted > 0 {
            info!("🧹 Purged {} expired secrets", deleted);
        }
        Ok(deleted as u64)
    }
}
