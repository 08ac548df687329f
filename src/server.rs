//! HTTP Server Wiring
//! Mission: Assemble stores, session manager, routes and background sweeps

use crate::{
    auth::{
        api as auth_api, auth_middleware, AuthState, CredentialHasher, EphemeralTokenStore,
        IdentityStore, JwtHandler, MemoryIdentityStore, MemoryTokenStore, SessionManager,
        SqliteIdentityStore, SqliteTokenStore,
    },
    config::{AuthConfig, StoreBackend},
    email::{notifier_from_config, EmailNotifier},
    middleware::request_logging,
};
use anyhow::Result;
use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Open the configured stores and build the session manager on top of them.
pub fn build_sessions(config: Arc<AuthConfig>) -> Result<Arc<SessionManager>> {
    let (identities, tokens): (Arc<dyn IdentityStore>, Arc<dyn EphemeralTokenStore>) =
        match config.store_backend {
            StoreBackend::Sqlite => {
                let identities = SqliteIdentityStore::new(&config.identity_db_path)?;
                let tokens = SqliteTokenStore::new(&config.token_db_path)?;
                info!("🗄️  Identity store at: {}", config.identity_db_path);
                info!("🗄️  Token store at: {}", config.token_db_path);
                (Arc::new(identities), Arc::new(tokens))
            }
            StoreBackend::Memory => {
                warn!("⚠️  Using in-memory stores - all accounts are lost on restart");
                (
                    Arc::new(MemoryIdentityStore::new()),
                    Arc::new(MemoryTokenStore::new()),
                )
            }
        };

    let notifier = notifier_from_config(config.email_relay.clone())?;
    build_sessions_with(config, identities, tokens, notifier)
}

/// Build the session manager over caller-supplied collaborators.
pub fn build_sessions_with(
    config: Arc<AuthConfig>,
    identities: Arc<dyn IdentityStore>,
    tokens: Arc<dyn EphemeralTokenStore>,
    notifier: Arc<dyn EmailNotifier>,
) -> Result<Arc<SessionManager>> {
    let hasher = Arc::new(CredentialHasher::new(config.bcrypt_cost)?);
    let jwt_handler = Arc::new(JwtHandler::new(
        &config.jwt_secret,
        config.access_token_ttl,
    ));

    Ok(Arc::new(SessionManager::new(
        config,
        identities,
        tokens,
        hasher,
        jwt_handler,
        notifier,
    )))
}

pub fn build_router(state: AuthState) -> Router {
    let jwt_handler = state.jwt_handler.clone();

    // Public auth routes
    let auth_router = Router::new()
        .route("/api/auth/register", post(auth_api::register))
        .route(
            "/api/auth/activate",
            get(auth_api::activate_from_link).post(auth_api::activate),
        )
        .route(
            "/api/auth/resend-activation",
            post(auth_api::resend_activation),
        )
        .route("/api/auth/login", post(auth_api::login))
        .route("/api/auth/refresh", post(auth_api::refresh))
        .route("/api/auth/logout", post(auth_api::logout))
        .route("/api/auth/forgot-password", post(auth_api::forgot_password))
        .route(
            "/api/auth/reset-password/verify",
            get(auth_api::verify_reset_token),
        )
        .route("/api/auth/reset-password", post(auth_api::reset_password))
        .with_state(state.clone());

    // Routes that need a valid access token
    let protected_routes = Router::new()
        .route("/api/auth/logout-all", post(auth_api::logout_all))
        .route("/api/auth/me", get(auth_api::get_current_user))
        .route("/api/users/me/profile", put(auth_api::update_profile))
        .route("/api/admin/users/promote", post(auth_api::promote_user))
        .route("/api/admin/users/demote", post(auth_api::demote_user))
        .route_layer(axum::middleware::from_fn_with_state(
            jwt_handler,
            auth_middleware,
        ))
        .with_state(state);

    Router::new()
        .route("/health", get(health_check))
        .merge(auth_router)
        .merge(protected_routes)
        .layer(axum::middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive())
}

/// Periodically sweep expired pending registrations and secrets.
pub fn spawn_purge_task(sessions: Arc<SessionManager>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match sessions.purge_expired().await {
                Ok(stats) if stats.pending + stats.secrets > 0 => info!(
                    "🧹 Purged {} expired registrations, {} expired secrets",
                    stats.pending, stats.secrets
                ),
                Ok(_) => debug!("Purge sweep found nothing to remove"),
                Err(e) => warn!("Purge sweep failed: {}", e),
            }
        }
    })
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
