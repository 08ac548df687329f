//! Authentication Models
//! Mission: Define identity, pending registration and session data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Activated account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // bcrypt hash - never serialize
    pub role: UserRole,
    pub activated: bool,
    pub profile: Profile,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Public profile attached to an identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub bio: String,
    pub avatar_url: String,
    pub contact_info: String,
}

/// Fields needed to create an identity row.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

/// Registration that has not completed email activation yet.
#[derive(Debug, Clone)]
pub struct PendingRegistration {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub activation_secret: String,
    pub activation_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingRegistration {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.activation_expires_at
    }
}

/// User roles for RBAC
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UserRole {
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "admin")]
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &str {
        match self {
            UserRole::Standard => "standard",
            UserRole::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "standard" | "user" => Some(UserRole::Standard),
            "admin" => Some(UserRole::Admin),
            _ => None,
        }
    }
}

/// Namespaces of the ephemeral token store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretKind {
    PasswordReset,
    Refresh,
}

impl SecretKind {
    pub fn as_str(&self) -> &str {
        match self {
            SecretKind::PasswordReset => "reset",
            SecretKind::Refresh => "refresh",
        }
    }
}

/// Owner and expiry of a stored secret, as returned by consume/peek.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl SecretRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// JWT Claims payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // subject (identity id)
    pub role: UserRole,
    pub iat: i64,
    pub exp: i64, // expiration timestamp
}

impl Claims {
    pub fn identity_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }
}

/// Access + refresh pair handed out by login and refresh.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64, // seconds until the access token expires
}

/// Login response
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub user: UserResponse,
}

/// User response (sanitized)
#[derive(Debug, Clone, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub username: String,
    pub email: String,
    pub role: UserRole,
    pub profile: Profile,
    pub created_at: DateTime<Utc>,
}

impl UserResponse {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            id: identity.id.to_string(),
            username: identity.username.clone(),
            email: identity.email.clone(),
            role: identity.role,
            profile: identity.profile.clone(),
            created_at: identity.created_at,
        }
    }
}

/// Pending registration as shown to the caller of register.
#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub username: String,
    pub email: String,
    pub activation_expires_at: DateTime<Utc>,
}

impl PendingResponse {
    pub fn from_pending(pending: &PendingRegistration) -> Self {
        Self {
            username: pending.username.clone(),
            email: pending.email.clone(),
            activation_expires_at: pending.activation_expires_at,
        }
    }
}

/// Trim and lower-case an email so lookups are case-insensitive.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
