//! In-memory identity and token stores.
//!
//! Same contracts as the SQLite stores, state lives behind a single
//! `parking_lot` mutex per store so every operation is atomic.

use crate::auth::{
    errors::StoreError,
    identity_store::IdentityStore,
    models::{Identity, NewIdentity, PendingRegistration, Profile, SecretKind, SecretRecord, UserRole},
    token_store::{hash_secret, EphemeralTokenStore},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct IdentityTables {
    identities: HashMap<Uuid, Identity>,
    by_email: HashMap<String, Uuid>,
    pending: HashMap<String, PendingRegistration>,
}

impl IdentityTables {
    fn insert_identity(&mut self, new: NewIdentity) -> Result<Identity, StoreError> {
        let key = new.email.to_lowercase();
        if self.by_email.contains_key(&key) {
            return Err(StoreError::Conflict);
        }
        self.pending.remove(&key);

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
        self.by_email.insert(key, identity.id);
        self.identities.insert(identity.id, identity.clone());
        Ok(identity)
    }

    fn identity_mut(&mut self, id: Uuid) -> Result<&mut Identity, StoreError> {
        self.identities.get_mut(&id).ok_or(StoreError::NotFound)
    }
}

/// Identity store kept in process memory.
#[derive(Default)]
pub struct MemoryIdentityStore {
    tables: Mutex<IdentityTables>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn create_identity(&self, new: NewIdentity) -> Result<Identity, StoreError> {
        self.tables.lock().insert_identity(new)
    }

    async fn create_pending(&self, pending: &PendingRegistration) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let key = pending.email.to_lowercase();
        if tables.by_email.contains_key(&key) || tables.pending.contains_key(&key) {
            return Err(StoreError::Conflict);
        }
        tables.pending.insert(key, pending.clone());
        Ok(())
    }

    async fn find_identity_by_email(&self, email: &str) -> Result<Identity, StoreError> {
        let tables = self.tables.lock();
        tables
            .by_email
            .get(&email.to_lowercase())
            .and_then(|id| tables.identities.get(id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_identity_by_id(&self, id: Uuid) -> Result<Identity, StoreError> {
        self.tables
            .lock()
            .identities
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_pending_by_email(&self, email: &str) -> Result<PendingRegistration, StoreError> {
        self.tables
            .lock()
            .pending
            .get(&email.to_lowercase())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn replace_activation_secret(
        &self,
        email: &str,
        secret: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let pending = tables
            .pending
            .get_mut(&email.to_lowercase())
            .ok_or(StoreError::NotFound)?;
        pending.activation_secret = secret.to_string();
        pending.activation_expires_at = expires_at;
        pending.updated_at = Utc::now();
        Ok(())
    }

    async fn activate_pending(&self, email: &str, secret: &str) -> Result<Identity, StoreError> {
        let mut tables = self.tables.lock();
        let key = email.to_lowercase();
        let matches = tables
            .pending
            .get(&key)
            .is_some_and(|p| p.activation_secret == secret && p.activation_expires_at >= Utc::now());
        if !matches {
            return Err(StoreError::NotFound);
        }
        if tables.by_email.contains_key(&key) {
            return Err(StoreError::Conflict);
        }

        let Some(pending) = tables.pending.remove(&key) else {
            return Err(StoreError::NotFound);
        };
        tables.insert_identity(NewIdentity {
            username: pending.username,
            email: pending.email,
            password_hash: pending.password_hash,
        })
    }

    async fn delete_pending(&self, email: &str) -> Result<(), StoreError> {
        self.tables.lock().pending.remove(&email.to_lowercase());
        Ok(())
    }

    async fn promote_role(&self, id: Uuid, role: UserRole) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let identity = tables.identity_mut(id)?;
        identity.role = role;
        identity.updated_at = Utc::now();
        Ok(())
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let identity = tables.identity_mut(id)?;
        identity.password_hash = password_hash.to_string();
        identity.updated_at = Utc::now();
        Ok(())
    }

    async fn update_profile(&self, id: Uuid, profile: &Profile) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let identity = tables.identity_mut(id)?;
        identity.profile = profile.clone();
        identity.updated_at = Utc::now();
        Ok(())
    }

    async fn purge_expired_pending(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock();
        let before = tables.pending.len();
        tables.pending.retain(|_, p| p.activation_expires_at >= now);
        Ok((before - tables.pending.len()) as u64)
    }
}

/// Token store kept in process memory.
#[derive(Default)]
pub struct MemoryTokenStore {
    secrets: Mutex<HashMap<(SecretKind, String), SecretRecord>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EphemeralTokenStore for MemoryTokenStore {
    async fn put(
        &self,
        kind: SecretKind,
        secret: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.secrets.lock().insert(
            (kind, hash_secret(secret)),
            SecretRecord {
                owner: owner.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn replace_for_owner(
        &self,
        kind: SecretKind,
        secret: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut secrets = self.secrets.lock();
        secrets.retain(|(k, _), record| !(*k == kind && record.owner == owner));
        secrets.insert(
            (kind, hash_secret(secret)),
            SecretRecord {
                owner: owner.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn find_and_consume(
        &self,
        kind: SecretKind,
        secret: &str,
    ) -> Result<SecretRecord, StoreError> {
        self.secrets
            .lock()
            .remove(&(kind, hash_secret(secret)))
            .ok_or(StoreError::NotFound)
    }

    async fn peek(&self, kind: SecretKind, secret: &str) -> Result<SecretRecord, StoreError> {
        self.secrets
            .lock()
            .get(&(kind, hash_secret(secret)))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn delete_all_for_owner(
        &self,
        kind: SecretKind,
        owner: &str,
    ) -> Result<u64, StoreError> {
        let mut secrets = self.secrets.lock();
        let before = secrets.len();
        secrets.retain(|(k, _), record| !(*k == kind && record.owner == owner));
        Ok((before - secrets.len()) as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut secrets = self.secrets.lock();
        let before = secrets.len();
        secrets.retain(|_, record| record.expires_at >= now);
        Ok((before - secrets.len()) as u64)
    }
}
