//! Authentication Middleware
//! Mission: Protect API endpoints with access-token validation

use crate::auth::{errors::TokenError, jwt::JwtHandler, models::Claims};
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

/// Auth middleware that validates bearer access tokens
pub async fn auth_middleware(
    State(jwt_handler): State<Arc<JwtHandler>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AccessError> {
    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or(AccessError::MissingToken)?;

    let token = header_value
        .to_str()
        .ok()
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or(AccessError::InvalidFormat)?;

    let claims = jwt_handler.validate_access(token).map_err(|e| {
        debug!("Rejected access token: {}", e);
        AccessError::from(e)
    })?;

    // Add claims to request extensions so handlers can access them
    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

/// Extract claims from request (use after auth middleware)
pub fn extract_claims(req: &Request) -> Option<&Claims> {
    req.extensions().get::<Claims>()
}

/// Access token rejections
#[derive(Debug, PartialEq, Eq)]
pub enum AccessError {
    MissingToken,
    InvalidFormat,
    InvalidToken,
    ExpiredToken,
}

impl From<TokenError> for AccessError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Expired => AccessError::ExpiredToken,
            TokenError::InvalidSignature | TokenError::Malformed => AccessError::InvalidToken,
        }
    }
}

impl IntoResponse for AccessError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AccessError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization token"),
            AccessError::InvalidFormat => (
                StatusCode::UNAUTHORIZED,
                "Invalid authorization format. Use: Bearer {token}",
            ),
            AccessError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AccessError::ExpiredToken => (StatusCode::UNAUTHORIZED, "Token has expired"),
        };

        (status, message).into_response()
    }
}
