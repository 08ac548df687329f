//! Authentication API Endpoints
//! Mission: Expose registration, login, session and account endpoints over HTTP

use crate::auth::{
    errors::AuthError,
    middleware::extract_claims,
    models::{normalize_email, Claims, LoginResponse, PendingResponse, Profile, TokenPair, UserResponse, UserRole},
    sessions::SessionManager,
    JwtHandler,
};
use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const MIN_PASSWORD_LEN: usize = 8;

/// Shared auth state
#[derive(Clone)]
pub struct AuthState {
    pub sessions: Arc<SessionManager>,
    pub jwt_handler: Arc<JwtHandler>,
}

impl AuthState {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        let jwt_handler = sessions.jwt().clone();
        Self {
            sessions,
            jwt_handler,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub email: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetTokenQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

fn check_password(password: &str) -> Result<(), AuthApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword(MIN_PASSWORD_LEN).into());
    }
    Ok(())
}

/// Register - POST /api/auth/register
pub async fn register(
    State(state): State<AuthState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<PendingResponse>), AuthApiError> {
    if payload.username.trim().is_empty() {
        return Err(AuthApiError::BadRequest("Username is required"));
    }
    if !payload.email.contains('@') {
        return Err(AuthApiError::BadRequest("Invalid email address"));
    }
    check_password(&payload.password)?;

    let pending = state
        .sessions
        .register(&payload.username, &payload.email, &payload.password)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(PendingResponse::from_pending(&pending)),
    ))
}

/// Activate account - POST /api/auth/activate
pub async fn activate(
    State(state): State<AuthState>,
    Json(payload): Json<ActivateRequest>,
) -> Result<Json<UserResponse>, AuthApiError> {
    let identity = state
        .sessions
        .activate_user(&payload.token, &payload.email)
        .await?;
    Ok(Json(UserResponse::from_identity(&identity)))
}

/// Activate from the emailed link - GET /api/auth/activate?email=..&token=..
pub async fn activate_from_link(
    State(state): State<AuthState>,
    Query(params): Query<ActivateRequest>,
) -> Result<Json<UserResponse>, AuthApiError> {
    let identity = state
        .sessions
        .activate_user(&params.token, &params.email)
        .await?;
    Ok(Json(UserResponse::from_identity(&identity)))
}

/// Resend activation email - POST /api/auth/resend-activation
pub async fn resend_activation(
    State(state): State<AuthState>,
    Json(payload): Json<EmailRequest>,
) -> Result<StatusCode, AuthApiError> {
    state.sessions.resend_activation(&payload.email).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Login endpoint - POST /api/auth/login
pub async fn login(
    State(state): State<AuthState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AuthApiError> {
    info!("🔐 Login attempt");

    let session = state
        .sessions
        .login(&payload.email, &payload.password)
        .await?;

    Ok(Json(LoginResponse {
        tokens: session.tokens,
        user: UserResponse::from_identity(&session.identity),
    }))
}

/// Rotate tokens - POST /api/auth/refresh
pub async fn refresh(
    State(state): State<AuthState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, AuthApiError> {
    let tokens = state.sessions.refresh_tokens(&payload.refresh_token).await?;
    Ok(Json(tokens))
}

/// End one session - POST /api/auth/logout
///
/// Always 204: an unknown refresh secret is not an error for the caller.
pub async fn logout(
    State(state): State<AuthState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<StatusCode, AuthApiError> {
    state.sessions.logout(&payload.refresh_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// End every session of the caller - POST /api/auth/logout-all
pub async fn logout_all(
    State(state): State<AuthState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, AuthApiError> {
    let identity_id = claims.identity_id().ok_or(AuthError::Unauthorized)?;
    let ended = state.sessions.logout_all(identity_id).await?;
    Ok(Json(json!({ "sessions_ended": ended })))
}

/// Request a reset email - POST /api/auth/forgot-password
///
/// Same 202 whether or not the address belongs to an account.
pub async fn forgot_password(
    State(state): State<AuthState>,
    Json(payload): Json<EmailRequest>,
) -> Result<StatusCode, AuthApiError> {
    state.sessions.forgot_password(&payload.email).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Check a reset token - GET /api/auth/reset-password/verify?token=...
pub async fn verify_reset_token(
    State(state): State<AuthState>,
    Query(query): Query<ResetTokenQuery>,
) -> Result<Json<Value>, AuthApiError> {
    state.sessions.verify_reset_token(&query.token).await?;
    Ok(Json(json!({ "valid": true })))
}

/// Set a new password - POST /api/auth/reset-password
pub async fn reset_password(
    State(state): State<AuthState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<StatusCode, AuthApiError> {
    check_password(&payload.new_password)?;
    state
        .sessions
        .reset_password(&payload.token, &payload.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Get current user info - GET /api/auth/me
pub async fn get_current_user(
    State(state): State<AuthState>,
    req: Request,
) -> Result<Json<UserResponse>, AuthApiError> {
    let identity_id = extract_claims(&req)
        .and_then(Claims::identity_id)
        .ok_or(AuthError::Unauthorized)?;

    let identity = state.sessions.current_identity(identity_id).await?;
    Ok(Json(UserResponse::from_identity(&identity)))
}

/// Update own profile - PUT /api/users/me/profile
pub async fn update_profile(
    State(state): State<AuthState>,
    Extension(claims): Extension<Claims>,
    Json(profile): Json<Profile>,
) -> Result<Json<UserResponse>, AuthApiError> {
    let identity_id = claims.identity_id().ok_or(AuthError::Unauthorized)?;
    let identity = state.sessions.update_profile(identity_id, profile).await?;
    Ok(Json(UserResponse::from_identity(&identity)))
}

/// Promote to admin - POST /api/admin/users/promote (Admin only)
pub async fn promote_user(
    State(state): State<AuthState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<EmailRequest>,
) -> Result<Json<UserResponse>, AuthApiError> {
    require_admin(&claims)?;

    let identity = state.sessions.promote_user(&payload.email).await?;
    info!("🛡️  Promoted by {}", claims.sub);
    Ok(Json(UserResponse::from_identity(&identity)))
}

/// Demote to standard - POST /api/admin/users/demote (Admin only)
pub async fn demote_user(
    State(state): State<AuthState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<EmailRequest>,
) -> Result<Json<UserResponse>, AuthApiError> {
    require_admin(&claims)?;

    let caller = claims.identity_id().ok_or(AuthError::Unauthorized)?;
    let current = state.sessions.current_identity(caller).await?;
    if is_same_account(&current.email, &payload.email) {
        return Err(AuthApiError::BadRequest("Cannot demote your own account"));
    }

    let identity = state.sessions.demote_user(&payload.email).await?;
    info!("🛡️  Demoted by {}", claims.sub);
    Ok(Json(UserResponse::from_identity(&identity)))
}

fn is_same_account(identity_email: &str, requested: &str) -> bool {
    identity_email == normalize_email(requested)
}

fn require_admin(claims: &Claims) -> Result<(), AuthApiError> {
    if claims.role != UserRole::Admin {
        warn!("Non-admin {} attempted an admin operation", claims.sub);
        return Err(AuthError::Forbidden.into());
    }
    Ok(())
}

/// Auth API errors
#[derive(Debug)]
pub enum AuthApiError {
    Auth(AuthError),
    BadRequest(&'static str),
}

impl From<AuthError> for AuthApiError {
    fn from(e: AuthError) -> Self {
        AuthApiError::Auth(e)
    }
}

impl IntoResponse for AuthApiError {
    fn into_response(self) -> Response {
        let err = match self {
            AuthApiError::BadRequest(message) => {
                return (StatusCode::BAD_REQUEST, message).into_response()
            }
            AuthApiError::Auth(err) => err,
        };

        let (status, message) = match &err {
            AuthError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "Invalid email or password")
            }
            AuthError::InvalidToken | AuthError::Expired => {
                (StatusCode::UNAUTHORIZED, "Invalid or expired token")
            }
            AuthError::Unauthorized => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::NotActivated => (StatusCode::FORBIDDEN, "Account has not been activated"),
            AuthError::Forbidden => (StatusCode::FORBIDDEN, "Insufficient permissions"),
            AuthError::NotFound => (StatusCode::NOT_FOUND, "Not found"),
            AuthError::AlreadyActive => (StatusCode::CONFLICT, "Account already exists"),
            AuthError::AlreadyPending => {
                (StatusCode::CONFLICT, "Registration is pending activation")
            }
            AuthError::Conflict(_) => (StatusCode::CONFLICT, "Conflicting request"),
            AuthError::WeakPassword(_) => (
                StatusCode::BAD_REQUEST,
                "Password must be at least 8 characters",
            ),
            AuthError::RateLimited { retry_after } => {
                let secs = retry_after.as_secs().max(1).to_string();
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, secs)],
                    "Too many requests",
                )
                    .into_response();
            }
            AuthError::Transient(e) => {
                warn!("Auth store unavailable: {:#}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service temporarily unavailable",
                )
            }
            AuthError::Internal(e) => {
                error!("Auth internal error: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, message).into_response()
    }
}
