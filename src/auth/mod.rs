//! Authentication Module
//! Mission: Identity registration, activation and session-token lifecycle

pub mod api;
pub mod errors;
pub mod identity_store;
pub mod jwt;
pub mod memory;
pub mod middleware;
pub mod models;
pub mod password;
pub mod sessions;
pub mod token_store;

pub use api::AuthState;
pub use errors::{AuthError, StoreError, TokenError};
pub use identity_store::{IdentityStore, SqliteIdentityStore};
pub use jwt::JwtHandler;
pub use memory::{MemoryIdentityStore, MemoryTokenStore};
pub use middleware::auth_middleware;
pub use password::CredentialHasher;
pub use sessions::{AuthSession, PurgeStats, SessionManager};
pub use token_store::{EphemeralTokenStore, SqliteTokenStore};
