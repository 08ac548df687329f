//! Identity Storage
//! Mission: Durable accounts and pending registrations, keyed by email and id

use crate::auth::{
    errors::StoreError,
    models::{Identity, NewIdentity, PendingRegistration, Profile, UserRole},
    token_store::millis_to_datetime,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Identity storage contract.
///
/// Emails arrive already normalised (see `models::normalize_email`).
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Insert an activated standard identity, discarding any pending
    /// registration for the same email in the same step. `Conflict` if the
    /// email is taken.
    async fn create_identity(&self, new: NewIdentity) -> Result<Identity, StoreError>;

    /// Insert a pending registration. `Conflict` if the email belongs to an
    /// identity or another pending registration.
    async fn create_pending(&self, pending: &PendingRegistration) -> Result<(), StoreError>;

    async fn find_identity_by_email(&self, email: &str) -> Result<Identity, StoreError>;

    async fn find_identity_by_id(&self, id: Uuid) -> Result<Identity, StoreError>;

    async fn find_pending_by_email(&self, email: &str) -> Result<PendingRegistration, StoreError>;

    /// Swap in a fresh activation secret and expiry; bumps `updated_at`.
    async fn replace_activation_secret(
        &self,
        email: &str,
        secret: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Atomically delete the unexpired pending row whose email AND secret
    /// match and create the identity from it. `NotFound` if no such pending
    /// row exists (including when a concurrent activation already consumed
    /// it, or its window lapsed).
    async fn activate_pending(&self, email: &str, secret: &str) -> Result<Identity, StoreError>;

    /// Idempotent: deleting an absent pending row is not an error.
    async fn delete_pending(&self, email: &str) -> Result<(), StoreError>;

    async fn promote_role(&self, id: Uuid, role: UserRole) -> Result<(), StoreError>;

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<(), StoreError>;

    async fn update_profile(&self, id: Uuid, profile: &Profile) -> Result<(), StoreError>;

    /// Delete pending registrations whose activation window has lapsed.
    async fn purge_expired_pending(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

const IDENTITY_COLUMNS: &str = "id, username, email, password_hash, role, bio, avatar_url, \
                                contact_info, created_at, updated_at";

const PENDING_COLUMNS: &str = "email, username, password_hash, activation_secret, \
                               activation_expires_at, created_at, updated_at";

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<(Identity, i64, i64)> {
    let id: String = row.get(0)?;
    let role: String = row.get(4)?;
    let identity = Identity {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        role: UserRole::from_str(&role).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown role: {role}").into(),
            )
        })?,
        activated: true,
        profile: Profile {
            bio: row.get(5)?,
            avatar_url: row.get(6)?,
            contact_info: row.get(7)?,
        },
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    Ok((identity, row.get(8)?, row.get(9)?))
}

fn finish_identity(raw: (Identity, i64, i64)) -> Result<Identity, StoreError> {
    let (mut identity, created_at, updated_at) = raw;
    identity.created_at = millis_to_datetime(created_at)?;
    identity.updated_at = millis_to_datetime(updated_at)?;
    Ok(identity)
}

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<(PendingRegistration, [i64; 3])> {
    let pending = PendingRegistration {
        email: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        activation_secret: row.get(3)?,
        activation_expires_at: Utc::now(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    Ok((pending, [row.get(4)?, row.get(5)?, row.get(6)?]))
}

fn finish_pending(raw: (PendingRegistration, [i64; 3])) -> Result<PendingRegistration, StoreError> {
    let (mut pending, [expires_at, created_at, updated_at]) = raw;
    pending.activation_expires_at = millis_to_datetime(expires_at)?;
    pending.created_at = millis_to_datetime(created_at)?;
    pending.updated_at = millis_to_datetime(updated_at)?;
    Ok(pending)
}

fn insert_identity(conn: &Connection, new: NewIdentity) -> Result<Identity, StoreError> {
    let now = Utc::now();
    let identity = Identity {
        id: Uuid::new_v4(),
        username: new.username,
        email: new.email,
        password_hash: new.password_hash,
        role: UserRole::Standard,
        activated: true,
        profile: Profile::default(),
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO identities (id, username, email, password_hash, role, bio, avatar_url,
                                 contact_info, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, '', '', '', ?6, ?6)",
        params![
            identity.id.to_string(),
            identity.username,
            identity.email,
            identity.password_hash,
            identity.role.as_str(),
            now.timestamp_millis(),
        ],
    )?;

    Ok(identity)
}

fn expect_one_row(rows: usize) -> Result<(), StoreError> {
    if rows == 0 {
        Err(StoreError::NotFound)
    } else {
        Ok(())
    }
}

/// Identity storage with SQLite backend
#[derive(Clone)]
pub struct SqliteIdentityStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteIdentityStore {
    /// Create a new identity store and initialize database
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open identity database at {}", db_path))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Initialize database schema
    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS identities (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                bio TEXT NOT NULL DEFAULT '',
                avatar_url TEXT NOT NULL DEFAULT '',
                contact_info TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pending_registrations (
                email TEXT PRIMARY KEY COLLATE NOCASE,
                username TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                activation_secret TEXT NOT NULL,
                activation_expires_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pending_expires
                ON pending_registrations(activation_expires_at);",
        )
        .context("Failed to initialize identity schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn create_identity(&self, new: NewIdentity) -> Result<Identity, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let discarded = tx.execute(
            "DELETE FROM pending_registrations WHERE email = ?1",
            params![new.email],
        )?;
        let identity = insert_identity(&tx, new)?;
        tx.commit()?;

        if discarded > 0 {
            info!("Discarded pending registration for {}", identity.id);
        }
        info!("✅ Created identity {} ({})", identity.id, identity.role.as_str());
        Ok(identity)
    }

    async fn create_pending(&self, pending: &PendingRegistration) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let active: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM identities WHERE email = ?1)",
            params![pending.email],
            |row| row.get(0),
        )?;
        if active {
            return Err(StoreError::Conflict);
        }

        tx.execute(
            "INSERT INTO pending_registrations (email, username, password_hash, activation_secret,
                                               activation_expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                pending.email,
                pending.username,
                pending.password_hash,
                pending.activation_secret,
                pending.activation_expires_at.timestamp_millis(),
                pending.created_at.timestamp_millis(),
                pending.updated_at.timestamp_millis(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn find_identity_by_email(&self, email: &str) -> Result<Identity, StoreError> {
        let conn = self.conn.lock().await;
        let raw = conn.query_row(
            &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE email = ?1"),
            params![email],
            identity_from_row,
        )?;
        finish_identity(raw)
    }

    async fn find_identity_by_id(&self, id: Uuid) -> Result<Identity, StoreError> {
        let conn = self.conn.lock().await;
        let raw = conn.query_row(
            &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
            params![id.to_string()],
            identity_from_row,
        )?;
        finish_identity(raw)
    }

    async fn find_pending_by_email(&self, email: &str) -> Result<PendingRegistration, StoreError> {
        let conn = self.conn.lock().await;
        let raw = conn.query_row(
            &format!("SELECT {PENDING_COLUMNS} FROM pending_registrations WHERE email = ?1"),
            params![email],
            pending_from_row,
        )?;
        finish_pending(raw)
    }

    async fn replace_activation_secret(
        &self,
        email: &str,
        secret: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE pending_registrations
             SET activation_secret = ?2, activation_expires_at = ?3, updated_at = ?4
             WHERE email = ?1",
            params![
                email,
                secret,
                expires_at.timestamp_millis(),
                Utc::now().timestamp_millis(),
            ],
        )?;
        expect_one_row(rows)
    }

    async fn activate_pending(&self, email: &str, secret: &str) -> Result<Identity, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let claimed: Option<(String, String)> = tx
            .query_row(
                "DELETE FROM pending_registrations
                 WHERE email = ?1 AND activation_secret = ?2 AND activation_expires_at >= ?3
                 RETURNING username, password_hash",
                params![email, secret, Utc::now().timestamp_millis()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (username, password_hash) = claimed.ok_or(StoreError::NotFound)?;

        // Dropping `tx` on error rolls the pending row back.
        let identity = insert_identity(
            &tx,
            NewIdentity {
                username,
                email: email.to_string(),
                password_hash,
            },
        )?;
        tx.commit()?;

        info!("✅ Activated identity {}", identity.id);
        Ok(identity)
    }

    async fn delete_pending(&self, email: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM pending_registrations WHERE email = ?1",
            params![email],
        )?;
        Ok(())
    }

    async fn promote_role(&self, id: Uuid, role: UserRole) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE identities SET role = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), role.as_str(), Utc::now().timestamp_millis()],
        )?;
        expect_one_row(rows)
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE identities SET password_hash = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), password_hash, Utc::now().timestamp_millis()],
        )?;
        expect_one_row(rows)
    }

    async fn update_profile(&self, id: Uuid, profile: &Profile) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE identities
             SET bio = ?2, avatar_url = ?3, contact_info = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                id.to_string(),
                profile.bio,
                profile.avatar_url,
                profile.contact_info,
                Utc::now().timestamp_millis(),
            ],
        )?;
        expect_one_row(rows)
    }

    async fn purge_expired_pending(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM pending_registrations WHERE activation_expires_at < ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn create_test_store() -> (SqliteIdentityStore, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        let store = SqliteIdentityStore::new(db_path).unwrap();
        (store, temp_file)
    }

    fn pending(email: &str, secret: &str, expires_in: Duration) -> PendingRegistration {
        let now = Utc::now();
        PendingRegistration {
            username: "bob".to_string(),
            email: email.to_string(),
            password_hash: "hash".to_string(),
            activation_secret: secret.to_string(),
            activation_expires_at: now + expires_in,
            created_at: now,
            updated_at: now,
        }
    }

    fn new_identity(email: &str) -> NewIdentity {
        NewIdentity {
            username: "alice".to_string(),
            email: email.to_string(),
            password_hash: "hash".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_retrieve_identity() {
        let (store, _temp) = create_test_store();
        let created = store.create_identity(new_identity("alice@x.com")).await.unwrap();
        assert_eq!(created.role, UserRole::Standard);
        assert!(created.activated);

        let by_email = store.find_identity_by_email("alice@x.com").await.unwrap();
        assert_eq!(by_email.id, created.id);

        let by_id = store.find_identity_by_id(created.id).await.unwrap();
        assert_eq!(by_id.email, "alice@x.com");
        assert_eq!(
            by_id.created_at.timestamp_millis(),
            created.created_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_duplicate_identity_email_conflicts() {
        let (store, _temp) = create_test_store();
        store.create_identity(new_identity("alice@x.com")).await.unwrap();
        let dup = store.create_identity(new_identity("ALICE@x.com")).await;
        assert!(matches!(dup, Err(StoreError::Conflict)));
    }

    #[tokio::test]
    async fn test_missing_identity_not_found() {
        let (store, _temp) = create_test_store();
        assert!(matches!(
            store.find_identity_by_email("ghost@x.com").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.find_identity_by_id(Uuid::new_v4()).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_pending_conflicts_with_identity_and_pending() {
        let (store, _temp) = create_test_store();
        store.create_identity(new_identity("alice@x.com")).await.unwrap();
        let against_identity = store
            .create_pending(&pending("alice@x.com", "s", Duration::hours(1)))
            .await;
        assert!(matches!(against_identity, Err(StoreError::Conflict)));

        store
            .create_pending(&pending("bob@x.com", "s1", Duration::hours(1)))
            .await
            .unwrap();
        let against_pending = store
            .create_pending(&pending("bob@x.com", "s2", Duration::hours(1)))
            .await;
        assert!(matches!(against_pending, Err(StoreError::Conflict)));
    }

    #[tokio::test]
    async fn test_activate_pending_moves_row() {
        let (store, _temp) = create_test_store();
        store
            .create_pending(&pending("bob@x.com", "secret", Duration::hours(1)))
            .await
            .unwrap();

        let identity = store.activate_pending("bob@x.com", "secret").await.unwrap();
        assert_eq!(identity.username, "bob");
        assert_eq!(identity.password_hash, "hash");

        assert!(matches!(
            store.find_pending_by_email("bob@x.com").await,
            Err(StoreError::NotFound)
        ));
        assert!(store.find_identity_by_email("bob@x.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_activate_pending_requires_matching_secret() {
        let (store, _temp) = create_test_store();
        store
            .create_pending(&pending("bob@x.com", "secret", Duration::hours(1)))
            .await
            .unwrap();

        let wrong = store.activate_pending("bob@x.com", "other").await;
        assert!(matches!(wrong, Err(StoreError::NotFound)));
        assert!(store.find_pending_by_email("bob@x.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_activate_pending_rolls_back_on_conflict() {
        let (store, temp) = create_test_store();
        store
            .create_pending(&pending("bob@x.com", "secret", Duration::hours(1)))
            .await
            .unwrap();

        // An identity slipped in behind the pending row's back.
        let conn = Connection::open(temp.path()).unwrap();
        conn.execute(
            "INSERT INTO identities (id, username, email, password_hash, role, created_at, updated_at)
             VALUES (?1, 'x', 'bob@x.com', 'h', 'standard', 0, 0)",
            params![Uuid::new_v4().to_string()],
        )
        .unwrap();
        drop(conn);

        let result = store.activate_pending("bob@x.com", "secret").await;
        assert!(matches!(result, Err(StoreError::Conflict)));
        assert!(store.find_pending_by_email("bob@x.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_activate_pending_rejects_lapsed_window() {
        let (store, _temp) = create_test_store();
        store
            .create_pending(&pending("bob@x.com", "secret", Duration::minutes(-1)))
            .await
            .unwrap();

        let result = store.activate_pending("bob@x.com", "secret").await;
        assert!(matches!(result, Err(StoreError::NotFound)));
        assert!(store.find_pending_by_email("bob@x.com").await.is_ok());
        assert!(store.find_identity_by_email("bob@x.com").await.is_err());
    }

    #[tokio::test]
    async fn test_create_identity_discards_pending() {
        let (store, _temp) = create_test_store();
        store
            .create_pending(&pending("bob@x.com", "secret", Duration::hours(1)))
            .await
            .unwrap();

        store.create_identity(new_identity("BOB@x.com")).await.unwrap();

        assert!(matches!(
            store.find_pending_by_email("bob@x.com").await,
            Err(StoreError::NotFound)
        ));
        assert!(store.find_identity_by_email("bob@x.com").await.is_ok());
        let late = store
            .create_pending(&pending("bob@x.com", "again", Duration::hours(1)))
            .await;
        assert!(matches!(late, Err(StoreError::Conflict)));
    }

    #[tokio::test]
    async fn test_unknown_role_is_a_backend_error() {
        let (store, temp) = create_test_store();
        let identity = store.create_identity(new_identity("alice@x.com")).await.unwrap();

        let conn = Connection::open(temp.path()).unwrap();
        conn.execute(
            "UPDATE identities SET role = 'superuser' WHERE id = ?1",
            params![identity.id.to_string()],
        )
        .unwrap();
        drop(conn);

        assert!(matches!(
            store.find_identity_by_id(identity.id).await,
            Err(StoreError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_replace_activation_secret() {
        let (store, _temp) = create_test_store();
        let original = pending("bob@x.com", "first", Duration::hours(1));
        store.create_pending(&original).await.unwrap();

        let new_expiry = Utc::now() + Duration::hours(2);
        store
            .replace_activation_secret("bob@x.com", "second", new_expiry)
            .await
            .unwrap();

        let reloaded = store.find_pending_by_email("bob@x.com").await.unwrap();
        assert_eq!(reloaded.activation_secret, "second");
        assert_eq!(
            reloaded.activation_expires_at.timestamp_millis(),
            new_expiry.timestamp_millis()
        );
        assert!(reloaded.updated_at >= original.updated_at);

        let missing = store
            .replace_activation_secret("ghost@x.com", "s", new_expiry)
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_role_password_and_profile_updates() {
        let (store, _temp) = create_test_store();
        let identity = store.create_identity(new_identity("alice@x.com")).await.unwrap();

        store.promote_role(identity.id, UserRole::Admin).await.unwrap();
        store.set_password_hash(identity.id, "new-hash").await.unwrap();
        let profile = Profile {
            bio: "Writes about Rust".to_string(),
            avatar_url: "https://cdn.example/a.png".to_string(),
            contact_info: "@alice".to_string(),
        };
        store.update_profile(identity.id, &profile).await.unwrap();

        let reloaded = store.find_identity_by_id(identity.id).await.unwrap();
        assert_eq!(reloaded.role, UserRole::Admin);
        assert_eq!(reloaded.password_hash, "new-hash");
        assert_eq!(reloaded.profile, profile);

        let missing = store.promote_role(Uuid::new_v4(), UserRole::Admin).await;
        assert!(matches!(missing, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_delete_pending_is_idempotent() {
        let (store, _temp) = create_test_store();
        store
            .create_pending(&pending("bob@x.com", "s", Duration::hours(1)))
            .await
            .unwrap();
        store.delete_pending("bob@x.com").await.unwrap();
        store.delete_pending("bob@x.com").await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_expired_pending() {
        let store = SqliteIdentityStore::open_in_memory().unwrap();
        store
            .create_pending(&pending("old@x.com", "s", Duration::minutes(-5)))
            .await
            .unwrap();
        store
            .create_pending(&pending("new@x.com", "s", Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(store.purge_expired_pending(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.purge_expired_pending(Utc::now()).await.unwrap(), 0);
        assert!(store.find_pending_by_email("new@x.com").await.is_ok());
    }
}
