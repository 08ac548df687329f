//! Runtime Configuration
//! Mission: Build every secret, expiry window and path once at startup

use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const DEV_JWT_SECRET: &str = "dev-secret-change-in-production-minimum-32-characters";

/// Which persistence engine backs the identity and token stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

impl StoreBackend {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Some(StoreBackend::Sqlite),
            "memory" | "mem" => Some(StoreBackend::Memory),
            _ => None,
        }
    }
}

/// Optional HTTP relay used to deliver activation and reset emails.
#[derive(Debug, Clone)]
pub struct EmailRelayConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub sender: String,
}

/// Authentication and session configuration.
///
/// Constructed once in `main` and shared by reference (`Arc`) with the
/// hasher, the token issuer and the session manager.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub activation_token_ttl: Duration,
    pub reset_token_ttl: Duration,
    pub activation_resend_interval: Duration,
    pub store_timeout: Duration,
    pub bcrypt_cost: u32,
    pub activation_link_base: String,
    pub store_backend: StoreBackend,
    pub identity_db_path: String,
    pub token_db_path: String,
    pub pending_purge_interval: Duration,
    pub port: u16,
    pub email_relay: Option<EmailRelayConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.to_string(),
            access_token_ttl: Duration::from_secs(15 * 60),
            refresh_token_ttl: Duration::from_secs(7 * 24 * 3600),
            activation_token_ttl: Duration::from_secs(24 * 3600),
            reset_token_ttl: Duration::from_secs(3600),
            activation_resend_interval: Duration::from_secs(30),
            store_timeout: Duration::from_millis(5000),
            bcrypt_cost: bcrypt::DEFAULT_COST,
            activation_link_base: "http://localhost:3000/api/auth/activate".to_string(),
            store_backend: StoreBackend::Sqlite,
            identity_db_path: default_data_path("inkpost_identity.db"),
            token_db_path: default_data_path("inkpost_tokens.db"),
            pending_purge_interval: Duration::from_secs(3600),
            port: 3000,
            email_relay: None,
        }
    }
}

impl AuthConfig {
    /// Read configuration from the environment, falling back to defaults.
    ///
    /// Unset keys take their default; keys that are set but unparseable are
    /// a startup error rather than a silent fallback.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let jwt_secret = match env::var("JWT_SECRET") {
            Ok(v) if !v.trim().is_empty() => v,
            _ => {
                warn!("⚠️  JWT_SECRET not set - using development secret. CHANGE IN PRODUCTION!");
                DEV_JWT_SECRET.to_string()
            }
        };
        if jwt_secret.len() < 32 {
            warn!("⚠️  JWT_SECRET is shorter than 32 bytes");
        }

        let store_backend = match env::var("AUTH_STORE_BACKEND") {
            Ok(v) if !v.trim().is_empty() => StoreBackend::from_str(&v)
                .with_context(|| format!("Invalid AUTH_STORE_BACKEND: {v}"))?,
            _ => defaults.store_backend,
        };

        let email_relay = env::var("EMAIL_RELAY_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|url| EmailRelayConfig {
                url,
                api_key: env::var("EMAIL_RELAY_API_KEY")
                    .ok()
                    .filter(|v| !v.trim().is_empty()),
                sender: env::var("EMAIL_SENDER")
                    .unwrap_or_else(|_| "no-reply@inkpost.local".to_string()),
            });

        Ok(Self {
            jwt_secret,
            access_token_ttl: secs_var("ACCESS_TOKEN_TTL_SECS", defaults.access_token_ttl)?,
            refresh_token_ttl: secs_var("REFRESH_TOKEN_TTL_SECS", defaults.refresh_token_ttl)?,
            activation_token_ttl: secs_var(
                "ACTIVATION_TOKEN_TTL_SECS",
                defaults.activation_token_ttl,
            )?,
            reset_token_ttl: secs_var("RESET_TOKEN_TTL_SECS", defaults.reset_token_ttl)?,
            activation_resend_interval: secs_var(
                "ACTIVATION_RESEND_INTERVAL_SECS",
                defaults.activation_resend_interval,
            )?,
            store_timeout: match parsed_var::<u64>("STORE_TIMEOUT_MS")? {
                Some(ms) => Duration::from_millis(ms),
                None => defaults.store_timeout,
            },
            bcrypt_cost: parsed_var::<u32>("BCRYPT_COST")?.unwrap_or(defaults.bcrypt_cost),
            activation_link_base: env::var("ACTIVATION_LINK_BASE")
                .unwrap_or(defaults.activation_link_base),
            store_backend,
            identity_db_path: resolve_data_path(
                env::var("IDENTITY_DB_PATH").ok(),
                "inkpost_identity.db",
            ),
            token_db_path: resolve_data_path(env::var("TOKEN_DB_PATH").ok(), "inkpost_tokens.db"),
            pending_purge_interval: secs_var(
                "PENDING_PURGE_INTERVAL_SECS",
                defaults.pending_purge_interval,
            )?,
            port: parsed_var::<u16>("PORT")?.unwrap_or(defaults.port),
            email_relay,
        })
    }

    /// Build the activation link embedded in activation emails.
    pub fn activation_link(&self, email: &str, token: &str) -> String {
        let sep = if self.activation_link_base.contains('?') {
            '&'
        } else {
            '?'
        };
        format!(
            "{}{}email={}&token={}",
            self.activation_link_base,
            sep,
            urlencoding::encode(email),
            urlencoding::encode(token)
        )
    }
}

/// Load `.env` from the cwd (and parents), then from the crate root.
pub fn load_env() {
    let _ = dotenv::dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let env_file = manifest_dir.join(".env");
    if env_file.exists() {
        let _ = dotenv::from_path(&env_file);
    }
}

fn parsed_var<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {key}={v}: {e}")),
        _ => Ok(None),
    }
}

fn secs_var(key: &str, default: Duration) -> Result<Duration> {
    Ok(parsed_var::<u64>(key)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}

fn default_data_path(filename: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join(filename)
        .to_string_lossy()
        .to_string()
}

/// Resolve a database path; relative paths are anchored at the crate root,
/// not the caller's cwd.
fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return default_data_path(default_filename);
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }

    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join(p)
        .to_string_lossy()
        .to_string()
}
