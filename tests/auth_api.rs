//! End-to-end tests of the HTTP surface, driven through `tower::ServiceExt::oneshot`.

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use inkpost_backend::{
    auth::{
        AuthState, EphemeralTokenStore, IdentityStore, MemoryIdentityStore, MemoryTokenStore,
        SessionManager, SqliteIdentityStore, SqliteTokenStore,
    },
    config::AuthConfig,
    email::EmailNotifier,
    server::{build_router, build_sessions_with},
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

#[derive(Default)]
struct RecordingNotifier {
    activation_links: Mutex<Vec<String>>,
    reset_tokens: Mutex<Vec<String>>,
}

#[async_trait]
impl EmailNotifier for RecordingNotifier {
    async fn send_activation_email(&self, _to: &str, link: &str) -> anyhow::Result<()> {
        self.activation_links.lock().push(link.to_string());
        Ok(())
    }

    async fn send_password_reset_email(&self, _to: &str, token: &str) -> anyhow::Result<()> {
        self.reset_tokens.lock().push(token.to_string());
        Ok(())
    }
}

impl RecordingNotifier {
    async fn next_activation_link(&self) -> String {
        for _ in 0..200 {
            if let Some(link) = self.activation_links.lock().last() {
                return link.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no activation email was sent");
    }

    async fn next_reset_token(&self) -> String {
        for _ in 0..200 {
            if let Some(token) = self.reset_tokens.lock().last() {
                return token.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no reset email was sent");
    }
}

struct TestApp {
    router: Router,
    sessions: Arc<SessionManager>,
    identities: Arc<dyn IdentityStore>,
    notifier: Arc<RecordingNotifier>,
}

fn test_config() -> AuthConfig {
    AuthConfig {
        jwt_secret: "integration-test-secret-of-32-bytes!".to_string(),
        bcrypt_cost: 4,
        ..AuthConfig::default()
    }
}

fn app_with(
    config: AuthConfig,
    identities: Arc<dyn IdentityStore>,
    tokens: Arc<dyn EphemeralTokenStore>,
) -> TestApp {
    let notifier = Arc::new(RecordingNotifier::default());
    let sessions = build_sessions_with(
        Arc::new(config),
        identities.clone(),
        tokens,
        notifier.clone(),
    )
    .unwrap();

    TestApp {
        router: build_router(AuthState::new(sessions.clone())),
        sessions,
        identities,
        notifier,
    }
}

fn memory_app() -> TestApp {
    app_with(
        test_config(),
        Arc::new(MemoryIdentityStore::new()),
        Arc::new(MemoryTokenStore::new()),
    )
}

impl TestApp {
    async fn call(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
        };
        (status, value)
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.call(Method::POST, uri, None, Some(body)).await
    }

    async fn activation_secret(&self, email: &str) -> String {
        self.identities
            .find_pending_by_email(email)
            .await
            .unwrap()
            .activation_secret
    }

    /// Register, activate and log in; returns the login body.
    async fn signed_in(&self, email: &str, password: &str) -> Value {
        let (status, _) = self
            .post(
                "/api/auth/register",
                json!({ "username": "writer", "email": email, "password": password }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let token = self.activation_secret(email).await;
        let (status, _) = self
            .post("/api/auth/activate", json!({ "email": email, "token": token }))
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = self
            .post("/api/auth/login", json!({ "email": email, "password": password }))
            .await;
        assert_eq!(status, StatusCode::OK);
        body
    }
}

#[tokio::test]
async fn test_health() {
    let app = memory_app();
    let (status, body) = app.call(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".to_string()));
}

#[tokio::test]
async fn test_registration_to_session_over_http() {
    let app = memory_app();

    let (status, body) = app
        .post(
            "/api/auth/register",
            json!({ "username": "bob", "email": "bob@x.com", "password": "pw123456" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["email"], "bob@x.com");
    assert!(body.get("activation_secret").is_none());
    assert!(body.get("password_hash").is_none());

    let (status, _) = app
        .post("/api/auth/login", json!({ "email": "bob@x.com", "password": "pw123456" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .post("/api/auth/activate", json!({ "email": "bob@x.com", "token": "wrong" }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let token = app.activation_secret("bob@x.com").await;
    let (status, user) = app
        .post("/api/auth/activate", json!({ "email": "bob@x.com", "token": token }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["role"], "standard");

    let (status, login) = app
        .post("/api/auth/login", json!({ "email": "bob@x.com", "password": "pw123456" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(login["expires_in"], 900);
    assert_eq!(login["user"]["username"], "bob");

    let access = login["access_token"].as_str().unwrap();
    let (status, me) = app.call(Method::GET, "/api/auth/me", Some(access), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["email"], "bob@x.com");
}

#[tokio::test]
async fn test_emailed_activation_link_activates() {
    let app = memory_app();

    let (status, _) = app
        .post(
            "/api/auth/register",
            json!({ "username": "bob", "email": "bob+blog@x.com", "password": "pw123456" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let link = app.notifier.next_activation_link().await;
    let path = link
        .strip_prefix("http://localhost:3000")
        .expect("link uses the default base");
    assert!(path.starts_with("/api/auth/activate?email=bob%2Bblog%40x.com&token="));

    let (status, user) = app.call(Method::GET, path, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["email"], "bob+blog@x.com");

    // Consumed with the pending row.
    let (status, _) = app.call(Method::GET, path, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .post("/api/auth/login", json!({ "email": "bob+blog@x.com", "password": "pw123456" }))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_register_validation() {
    let app = memory_app();

    let (status, _) = app
        .post(
            "/api/auth/register",
            json!({ "username": "bob", "email": "bob@x.com", "password": "short" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post(
            "/api/auth/register",
            json!({ "username": "bob", "email": "not-an-email", "password": "pw123456" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let body = json!({ "username": "bob", "email": "bob@x.com", "password": "pw123456" });
    assert_eq!(app.post("/api/auth/register", body.clone()).await.0, StatusCode::CREATED);
    assert_eq!(app.post("/api/auth/register", body).await.0, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_uniform_login_failures() {
    let app = memory_app();
    app.signed_in("bob@x.com", "pw123456").await;

    let missing = app
        .post("/api/auth/login", json!({ "email": "nobody@x.com", "password": "pw123456" }))
        .await;
    let wrong = app
        .post("/api/auth/login", json!({ "email": "bob@x.com", "password": "not-it-123" }))
        .await;

    assert_eq!(missing.0, StatusCode::UNAUTHORIZED);
    assert_eq!(missing, wrong);
}

#[tokio::test]
async fn test_protected_routes_require_bearer() {
    let app = memory_app();

    let (status, _) = app.call(Method::GET, "/api/auth/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call(Method::GET, "/api/auth/me", Some("garbage.token.value"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_refresh_rotation_and_logout() {
    let app = memory_app();
    let login = app.signed_in("bob@x.com", "pw123456").await;
    let original = login["refresh_token"].as_str().unwrap().to_string();

    let (status, rotated) = app
        .post("/api/auth/refresh", json!({ "refresh_token": original }))
        .await;
    assert_eq!(status, StatusCode::OK);
    let rotated = rotated["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(rotated, original);

    let (status, _) = app
        .post("/api/auth/refresh", json!({ "refresh_token": original }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .post("/api/auth/logout", json!({ "refresh_token": rotated }))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Idempotent from the client's point of view.
    let (status, _) = app
        .post("/api/auth/logout", json!({ "refresh_token": rotated }))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app
        .post("/api/auth/refresh", json!({ "refresh_token": rotated }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_all_over_http() {
    let app = memory_app();
    let first = app.signed_in("bob@x.com", "pw123456").await;
    let (_, second) = app
        .post("/api/auth/login", json!({ "email": "bob@x.com", "password": "pw123456" }))
        .await;

    let access = first["access_token"].as_str().unwrap();
    let (status, body) = app
        .call(Method::POST, "/api/auth/logout-all", Some(access), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions_ended"], 2);

    for login in [&first, &second] {
        let (status, _) = app
            .post(
                "/api/auth/refresh",
                json!({ "refresh_token": login["refresh_token"] }),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}

#[tokio::test]
async fn test_password_reset_over_http() {
    let app = memory_app();
    app.signed_in("bob@x.com", "pw123456").await;

    let (status, _) = app
        .post("/api/auth/forgot-password", json!({ "email": "ghost@x.com" }))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = app
        .post("/api/auth/forgot-password", json!({ "email": "bob@x.com" }))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let token = app.notifier.next_reset_token().await;

    let verify_uri = format!("/api/auth/reset-password/verify?token={token}");
    let (status, body) = app.call(Method::GET, &verify_uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);

    let (status, _) = app
        .post(
            "/api/auth/reset-password",
            json!({ "token": token, "new_password": "short" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post(
            "/api/auth/reset-password",
            json!({ "token": token, "new_password": "brand-new-pw" }),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app.call(Method::GET, &verify_uri, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .post(
            "/api/auth/login",
            json!({ "email": "bob@x.com", "password": "brand-new-pw" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_resend_activation_is_rate_limited() {
    let app = memory_app();
    app.post(
        "/api/auth/register",
        json!({ "username": "bob", "email": "bob@x.com", "password": "pw123456" }),
    )
    .await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/auth/resend-activation")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "email": "bob@x.com" }).to_string()))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=30).contains(&retry_after));

    let (status, _) = app
        .post("/api/auth/resend-activation", json!({ "email": "ghost@x.com" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_routes() {
    let app = memory_app();
    let writer = app.signed_in("writer@x.com", "pw123456").await;
    app.signed_in("admin@x.com", "pw123456").await;

    let writer_access = writer["access_token"].as_str().unwrap();
    let (status, _) = app
        .call(
            Method::POST,
            "/api/admin/users/promote",
            Some(writer_access),
            Some(json!({ "email": "writer@x.com" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Bootstrap the first admin out of band, then log in again for an admin token.
    app.sessions.promote_user("admin@x.com").await.unwrap();
    let (_, admin) = app
        .post("/api/auth/login", json!({ "email": "admin@x.com", "password": "pw123456" }))
        .await;
    let admin_access = admin["access_token"].as_str().unwrap();

    let (status, promoted) = app
        .call(
            Method::POST,
            "/api/admin/users/promote",
            Some(admin_access),
            Some(json!({ "email": "writer@x.com" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(promoted["role"], "admin");

    let (status, _) = app
        .call(
            Method::POST,
            "/api/admin/users/promote",
            Some(admin_access),
            Some(json!({ "email": "writer@x.com" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .call(
            Method::POST,
            "/api/admin/users/demote",
            Some(admin_access),
            Some(json!({ "email": "admin@x.com" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, demoted) = app
        .call(
            Method::POST,
            "/api/admin/users/demote",
            Some(admin_access),
            Some(json!({ "email": "writer@x.com" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(demoted["role"], "standard");
}

#[tokio::test]
async fn test_profile_update() {
    let app = memory_app();
    let login = app.signed_in("bob@x.com", "pw123456").await;
    let access = login["access_token"].as_str().unwrap();

    let (status, body) = app
        .call(
            Method::PUT,
            "/api/users/me/profile",
            Some(access),
            Some(json!({
                "bio": "Notes on systems programming",
                "avatar_url": "https://img.example/bob.png",
                "contact_info": "bob@x.com"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["profile"]["bio"], "Notes on systems programming");

    let (_, me) = app.call(Method::GET, "/api/auth/me", Some(access), None).await;
    assert_eq!(me["profile"]["avatar_url"], "https://img.example/bob.png");
}

#[tokio::test]
async fn test_sqlite_backed_flow() {
    let dir = tempfile::tempdir().unwrap();
    let identity_path = dir.path().join("identity.db");
    let token_path = dir.path().join("tokens.db");

    let identities = SqliteIdentityStore::new(identity_path.to_str().unwrap()).unwrap();
    let tokens = SqliteTokenStore::new(token_path.to_str().unwrap()).unwrap();
    let app = app_with(test_config(), Arc::new(identities), Arc::new(tokens));

    let login = app.signed_in("Bob@X.com", "pw123456").await;
    assert_eq!(login["user"]["email"], "bob@x.com");

    let (status, _) = app
        .post(
            "/api/auth/refresh",
            json!({ "refresh_token": login["refresh_token"] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let stats = app.sessions.purge_expired().await.unwrap();
    assert_eq!(stats.pending, 0);
}
