//! Authentication Errors
//! Mission: Typed failures for the session lifecycle and its stores

use std::time::Duration;
use thiserror::Error;

/// Failures returned by the identity and token stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("record already exists")]
    Conflict,

    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict
            }
            other => StoreError::Backend(other.into()),
        }
    }
}

/// Access token validation failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,

    #[error("token is malformed")]
    Malformed,
}

/// Domain failures of the session lifecycle.
///
/// `InvalidCredentials` covers both a missing account and a wrong password;
/// `InvalidToken` covers both a consumed secret and one that never existed.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("account is already active")]
    AlreadyActive,

    #[error("registration is pending activation")]
    AlreadyPending,

    #[error("account has not been activated")]
    NotActivated,

    #[error("not found")]
    NotFound,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("token has expired")]
    Expired,

    #[error("too many requests, retry in {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("authentication required")]
    Unauthorized,

    #[error("insufficient permissions")]
    Forbidden,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("password must be at least {0} characters")]
    WeakPassword(usize),

    #[error("temporarily unavailable")]
    Transient(#[source] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl AuthError {
    /// Map a store failure where "not found" means the presented token is unknown.
    pub fn from_token_lookup(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => AuthError::InvalidToken,
            other => other.into(),
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => AuthError::NotFound,
            StoreError::Conflict => AuthError::Conflict("record already exists".to_string()),
            StoreError::Backend(err) => AuthError::Transient(err),
        }
    }
}

impl From<TokenError> for AuthError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Expired => AuthError::Expired,
            TokenError::InvalidSignature | TokenError::Malformed => AuthError::Unauthorized,
        }
    }
}
