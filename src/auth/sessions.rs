//! Session Lifecycle
//! Mission: Registration, activation, login, rotation, logout and password reset
//!
//! State per email: unregistered -> pending -> activated. All state lives in
//! the identity and token stores; the manager itself is immutable and can be
//! shared across request handlers.
//!
//! Access tokens are stateless. `logout_all` stops new sessions from being
//! minted from existing refresh secrets, but an access token already handed
//! out stays valid until its own (short) expiry.

use crate::auth::{
    errors::{AuthError, StoreError},
    identity_store::IdentityStore,
    jwt::{generate_secret, JwtHandler},
    models::{
        normalize_email, Identity, NewIdentity, PendingRegistration, Profile, SecretKind,
        TokenPair, UserRole,
    },
    password::{constant_time_eq, CredentialHasher},
    token_store::EphemeralTokenStore,
};
use crate::config::AuthConfig;
use crate::email::EmailNotifier;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tokens plus the identity they were issued for.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub tokens: TokenPair,
    pub identity: Identity,
}

/// Counts removed by one sweep of expired state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub pending: u64,
    pub secrets: u64,
}

/// Orchestrates the identity and token stores, the hasher and the issuer.
pub struct SessionManager {
    config: Arc<AuthConfig>,
    identities: Arc<dyn IdentityStore>,
    tokens: Arc<dyn EphemeralTokenStore>,
    hasher: Arc<CredentialHasher>,
    jwt: Arc<JwtHandler>,
    notifier: Arc<dyn EmailNotifier>,
}

impl SessionManager {
    pub fn new(
        config: Arc<AuthConfig>,
        identities: Arc<dyn IdentityStore>,
        tokens: Arc<dyn EphemeralTokenStore>,
        hasher: Arc<CredentialHasher>,
        jwt: Arc<JwtHandler>,
        notifier: Arc<dyn EmailNotifier>,
    ) -> Self {
        Self {
            config,
            identities,
            tokens,
            hasher,
            jwt,
            notifier,
        }
    }

    pub fn jwt(&self) -> &Arc<JwtHandler> {
        &self.jwt
    }

    // ── Registration & activation ───────────────────────────────────

    /// Create a pending registration and send the activation email.
    ///
    /// An expired pending registration for the same email is discarded and
    /// replaced; a live one fails `AlreadyPending`.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<PendingRegistration, AuthError> {
        let email = normalize_email(email);
        let now = Utc::now();

        match self
            .store(self.identities.find_identity_by_email(&email))
            .await
        {
            Ok(_) => return Err(AuthError::AlreadyActive),
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        match self.store(self.identities.find_pending_by_email(&email)).await {
            Ok(pending) if !pending.is_expired(now) => return Err(AuthError::AlreadyPending),
            Ok(_) => {
                debug!("Replacing expired pending registration");
                self.store(self.identities.delete_pending(&email)).await?;
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let password_hash = self.hash_password(password).await?;
        let pending = PendingRegistration {
            username: username.trim().to_string(),
            email: email.clone(),
            password_hash,
            activation_secret: generate_secret(),
            activation_expires_at: expiry_from(now, self.config.activation_token_ttl)?,
            created_at: now,
            updated_at: now,
        };

        match self.store(self.identities.create_pending(&pending)).await {
            Ok(()) => {}
            Err(StoreError::Conflict) => return Err(self.registration_conflict(&email).await),
            Err(e) => return Err(e.into()),
        }

        info!("📝 Registration pending activation for {}", pending.username);
        self.spawn_activation_email(&email, &pending.activation_secret);

        Ok(pending)
    }

    /// Promote a pending registration to an activated identity.
    pub async fn activate_user(&self, token: &str, email: &str) -> Result<Identity, AuthError> {
        let email = normalize_email(email);
        let pending = self
            .store(self.identities.find_pending_by_email(&email))
            .await?;

        if !constant_time_eq(pending.activation_secret.as_bytes(), token.as_bytes()) {
            return Err(AuthError::InvalidToken);
        }

        if pending.is_expired(Utc::now()) {
            if let Err(e) = self.store(self.identities.delete_pending(&email)).await {
                warn!("Failed to delete expired pending registration: {}", e);
            }
            return Err(AuthError::Expired);
        }

        let identity = match self
            .store(self.identities.activate_pending(&email, token))
            .await
        {
            Ok(identity) => identity,
            // Another request activated it between our read and the swap.
            Err(StoreError::NotFound) => return Err(AuthError::InvalidToken),
            Err(StoreError::Conflict) => return Err(AuthError::AlreadyActive),
            Err(e) => return Err(e.into()),
        };

        info!("✅ Activated identity {} ({})", identity.id, identity.username);
        Ok(identity)
    }

    /// Issue a fresh activation secret and re-send the email.
    ///
    /// Always regenerates (the previous link stops working) as long as the
    /// minimum resend interval has passed and the current window has not
    /// lapsed. A lapsed registration is deleted so the email can register
    /// again.
    pub async fn resend_activation(&self, email: &str) -> Result<(), AuthError> {
        let email = normalize_email(email);
        let pending = self
            .store(self.identities.find_pending_by_email(&email))
            .await?;

        let now = Utc::now();
        let since_update = (now - pending.updated_at).to_std().unwrap_or_default();
        if since_update < self.config.activation_resend_interval {
            return Err(AuthError::RateLimited {
                retry_after: self.config.activation_resend_interval - since_update,
            });
        }

        if pending.is_expired(now) {
            if let Err(e) = self.store(self.identities.delete_pending(&email)).await {
                warn!("Failed to delete expired pending registration: {}", e);
            }
            return Err(AuthError::Expired);
        }

        let secret = generate_secret();
        let expires_at = expiry_from(now, self.config.activation_token_ttl)?;
        self.store(
            self.identities
                .replace_activation_secret(&email, &secret, expires_at),
        )
        .await?;

        info!("📧 Re-issued activation secret for {}", pending.username);
        self.spawn_activation_email(&email, &secret);
        Ok(())
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Password login. A missing account and a wrong password produce the
    /// same error after the same amount of bcrypt work.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let email = normalize_email(email);

        match self.store(self.identities.find_pending_by_email(&email)).await {
            Ok(_) => return Err(AuthError::NotActivated),
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let identity = match self
            .store(self.identities.find_identity_by_email(&email))
            .await
        {
            Ok(identity) => Some(identity),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };

        let stored_hash = identity.as_ref().map(|i| i.password_hash.clone());
        let valid = self.verify_password(stored_hash, password).await?;

        let Some(identity) = identity.filter(|_| valid) else {
            warn!("❌ Failed login attempt");
            return Err(AuthError::InvalidCredentials);
        };

        let tokens = self.issue_session(&identity).await?;
        info!(
            "✅ Login successful: {} ({})",
            identity.id,
            identity.role.as_str()
        );

        Ok(AuthSession { tokens, identity })
    }

    /// Login for an identity already verified by an external provider.
    ///
    /// Creates an activated standard identity on first sight; any pending
    /// registration for the email is discarded since the provider has proven
    /// ownership of the address.
    pub async fn federated_login(
        &self,
        email: &str,
        display_name: &str,
    ) -> Result<AuthSession, AuthError> {
        let email = normalize_email(email);

        let identity = match self
            .store(self.identities.find_identity_by_email(&email))
            .await
        {
            Ok(identity) => identity,
            Err(StoreError::NotFound) => self.create_federated_identity(&email, display_name).await?,
            Err(e) => return Err(e.into()),
        };

        let tokens = self.issue_session(&identity).await?;
        info!("✅ Federated login: {}", identity.id);

        Ok(AuthSession { tokens, identity })
    }

    /// Redeem a refresh secret for a new access token and a new refresh secret.
    pub async fn refresh_tokens(&self, refresh_secret: &str) -> Result<TokenPair, AuthError> {
        // Consumed before anything else: a replayed or concurrent redemption
        // of the same secret sees NotFound here.
        let record = self
            .store(self.tokens.find_and_consume(SecretKind::Refresh, refresh_secret))
            .await
            .map_err(AuthError::from_token_lookup)?;

        if record.is_expired(Utc::now()) {
            return Err(AuthError::Expired);
        }

        let identity_id = Uuid::parse_str(&record.owner).map_err(|_| AuthError::InvalidToken)?;
        let identity = self
            .store(self.identities.find_identity_by_id(identity_id))
            .await?;

        debug!("Rotating refresh secret for {}", identity.id);
        self.issue_session(&identity).await
    }

    /// End one session. Returns whether a live refresh secret was removed.
    pub async fn logout(&self, refresh_secret: &str) -> Result<bool, AuthError> {
        match self
            .store(self.tokens.find_and_consume(SecretKind::Refresh, refresh_secret))
            .await
        {
            Ok(record) => {
                info!("👋 Logged out one session of {}", record.owner);
                Ok(true)
            }
            Err(StoreError::NotFound) => {
                debug!("Logout with unknown refresh secret");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// End every session of an identity. Returns the number of secrets removed.
    pub async fn logout_all(&self, identity_id: Uuid) -> Result<u64, AuthError> {
        let removed = self
            .store(
                self.tokens
                    .delete_all_for_owner(SecretKind::Refresh, &identity_id.to_string()),
            )
            .await?;
        info!("👋 Logged out {} sessions of {}", removed, identity_id);
        Ok(removed)
    }

    // ── Password reset ──────────────────────────────────────────────

    /// Start a password reset. Succeeds whether or not the email is known.
    pub async fn forgot_password(&self, email: &str) -> Result<(), AuthError> {
        let email = normalize_email(email);

        match self
            .store(self.identities.find_identity_by_email(&email))
            .await
        {
            Ok(_) => {}
            Err(StoreError::NotFound) => {
                debug!("Password reset requested for unknown email");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        // Only the latest reset secret per email stays redeemable.
        let secret = generate_secret();
        let expires_at = expiry_from(Utc::now(), self.config.reset_token_ttl)?;
        self.store(self.tokens.replace_for_owner(
            SecretKind::PasswordReset,
            &secret,
            &email,
            expires_at,
        ))
        .await?;

        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.send_password_reset_email(&email, &secret).await {
                warn!("Failed to send password reset email: {:#}", e);
            }
        });

        Ok(())
    }

    /// Check a reset secret without consuming it.
    pub async fn verify_reset_token(&self, token: &str) -> Result<(), AuthError> {
        let record = self
            .store(self.tokens.peek(SecretKind::PasswordReset, token))
            .await
            .map_err(AuthError::from_token_lookup)?;

        if record.is_expired(Utc::now()) {
            return Err(AuthError::Expired);
        }
        Ok(())
    }

    /// Redeem a reset secret and overwrite the password. Ends every session
    /// of the identity.
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), AuthError> {
        let record = self
            .store(self.tokens.find_and_consume(SecretKind::PasswordReset, token))
            .await
            .map_err(AuthError::from_token_lookup)?;

        if record.is_expired(Utc::now()) {
            return Err(AuthError::Expired);
        }

        let identity = self
            .store(self.identities.find_identity_by_email(&record.owner))
            .await
            .map_err(AuthError::from_token_lookup)?;

        let password_hash = self.hash_password(new_password).await?;
        self.store(
            self.identities
                .set_password_hash(identity.id, &password_hash),
        )
        .await?;

        let ended = self
            .store(
                self.tokens
                    .delete_all_for_owner(SecretKind::Refresh, &identity.id.to_string()),
            )
            .await?;

        info!(
            "🔑 Password reset for {} ({} sessions ended)",
            identity.id, ended
        );
        Ok(())
    }

    // ── Account administration ──────────────────────────────────────

    pub async fn promote_user(&self, email: &str) -> Result<Identity, AuthError> {
        self.change_role(email, UserRole::Admin).await
    }

    pub async fn demote_user(&self, email: &str) -> Result<Identity, AuthError> {
        self.change_role(email, UserRole::Standard).await
    }

    pub async fn current_identity(&self, identity_id: Uuid) -> Result<Identity, AuthError> {
        Ok(self
            .store(self.identities.find_identity_by_id(identity_id))
            .await?)
    }

    pub async fn update_profile(
        &self,
        identity_id: Uuid,
        profile: Profile,
    ) -> Result<Identity, AuthError> {
        self.store(self.identities.update_profile(identity_id, &profile))
            .await?;
        self.current_identity(identity_id).await
    }

    /// Sweep pending registrations and secrets whose expiry has passed.
    pub async fn purge_expired(&self) -> Result<PurgeStats, AuthError> {
        let now = Utc::now();
        let pending = self
            .store(self.identities.purge_expired_pending(now))
            .await?;
        let secrets = self.store(self.tokens.purge_expired(now)).await?;
        Ok(PurgeStats { pending, secrets })
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Bound a store call by the configured timeout. A timed-out call is
    /// reported as a backend failure, which surfaces as `Transient`.
    async fn store<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Backend(anyhow!(
                "store call timed out after {}ms",
                self.config.store_timeout.as_millis()
            ))),
        }
    }

    async fn issue_session(&self, identity: &Identity) -> Result<TokenPair, AuthError> {
        let (access_token, _) = self
            .jwt
            .issue_access(identity.id, identity.role)
            .map_err(AuthError::Internal)?;

        let refresh_token = self.jwt.issue_refresh_secret();
        let expires_at = expiry_from(Utc::now(), self.config.refresh_token_ttl)?;
        self.store(self.tokens.put(
            SecretKind::Refresh,
            &refresh_token,
            &identity.id.to_string(),
            expires_at,
        ))
        .await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.jwt.access_ttl().as_secs(),
        })
    }

    async fn create_federated_identity(
        &self,
        email: &str,
        display_name: &str,
    ) -> Result<Identity, AuthError> {
        // Random password nobody knows; the account logs in through the provider.
        let password_hash = self.hash_password(&generate_secret()).await?;
        let username = match display_name.trim() {
            "" => email.split('@').next().unwrap_or(email).to_string(),
            name => name.to_string(),
        };

        match self
            .store(self.identities.create_identity(NewIdentity {
                username,
                email: email.to_string(),
                password_hash,
            }))
            .await
        {
            Ok(identity) => Ok(identity),
            // Lost a race with a concurrent first login.
            Err(StoreError::Conflict) => Ok(self
                .store(self.identities.find_identity_by_email(email))
                .await?),
            Err(e) => Err(e.into()),
        }
    }

    async fn change_role(&self, email: &str, role: UserRole) -> Result<Identity, AuthError> {
        let email = normalize_email(email);
        let mut identity = self
            .store(self.identities.find_identity_by_email(&email))
            .await?;

        if identity.role == role {
            return Err(AuthError::Conflict(format!(
                "user is already {}",
                role.as_str()
            )));
        }

        self.store(self.identities.promote_role(identity.id, role))
            .await?;
        identity.role = role;
        info!("🛡️  {} is now {}", identity.id, role.as_str());
        Ok(identity)
    }

    async fn registration_conflict(&self, email: &str) -> AuthError {
        match self.store(self.identities.find_identity_by_email(email)).await {
            Ok(_) => AuthError::AlreadyActive,
            _ => AuthError::AlreadyPending,
        }
    }

    async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AuthError::Internal(e.into()))?
            .map_err(AuthError::Internal)
    }

    async fn verify_password(
        &self,
        stored_hash: Option<String>,
        password: &str,
    ) -> Result<bool, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || match stored_hash {
            Some(hash) => hasher.verify(&hash, &password),
            None => hasher.verify_dummy(&password),
        })
        .await
        .map_err(|e| AuthError::Internal(e.into()))
    }

    fn spawn_activation_email(&self, email: &str, secret: &str) {
        let notifier = self.notifier.clone();
        let to = email.to_string();
        let link = self.config.activation_link(email, secret);
        tokio::spawn(async move {
            if let Err(e) = notifier.send_activation_email(&to, &link).await {
                warn!("Failed to send activation email: {:#}", e);
            }
        });
    }
}

fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, AuthError> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| AuthError::Internal(anyhow!("expiry window out of range: {:?}", ttl)))
}
