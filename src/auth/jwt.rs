//! JWT Token Handler
//! Mission: Issue and validate short-lived access tokens, mint refresh secrets

use crate::auth::{
    errors::TokenError,
    models::{Claims, UserRole},
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use rand::{rngs::OsRng, RngCore};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Random bytes per opaque secret (256 bits).
const SECRET_BYTES: usize = 32;

/// JWT Handler for token operations
pub struct JwtHandler {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
}

impl JwtHandler {
    /// Create a new JWT handler with secret key and access-token lifetime
    pub fn new(secret: &str, access_ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    /// Sign an access token for an identity
    pub fn issue_access(&self, identity_id: Uuid, role: UserRole) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(
                chrono::Duration::from_std(self.access_ttl).context("Invalid access TTL")?,
            )
            .context("Invalid timestamp")?;

        let claims = Claims {
            sub: identity_id.to_string(),
            role,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        debug!(
            "Issuing access token for {} ({}), expires in {}s",
            identity_id,
            role.as_str(),
            self.access_ttl.as_secs()
        );

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("Failed to generate JWT")?;

        Ok((token, expires_at))
    }

    /// Validate an access token and extract its claims
    pub fn validate_access(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let decoded =
            decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
                match e.kind() {
                    ErrorKind::ExpiredSignature => TokenError::Expired,
                    ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                        TokenError::InvalidSignature
                    }
                    _ => TokenError::Malformed,
                }
            })?;

        if decoded.claims.identity_id().is_none() {
            return Err(TokenError::Malformed);
        }

        debug!("Validated access token for {}", decoded.claims.sub);

        Ok(decoded.claims)
    }

    /// Mint an opaque refresh secret. Not derived from identity data.
    pub fn issue_refresh_secret(&self) -> String {
        generate_secret()
    }
}

/// 256 random bits, base64url without padding.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
