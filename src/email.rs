//! Email Notifications
//! Mission: Deliver activation and password-reset messages
//!
//! Delivery is always fire-and-forget from the caller's point of view; see
//! `SessionManager`, which spawns these calls off the request path.

use crate::config::EmailRelayConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Outbound email collaborator.
#[async_trait]
pub trait EmailNotifier: Send + Sync {
    async fn send_activation_email(&self, to_email: &str, activation_link: &str) -> Result<()>;

    async fn send_password_reset_email(&self, to_email: &str, reset_token: &str) -> Result<()>;
}

/// Notifier that only logs. Used when no relay is configured.
pub struct LogNotifier;

#[async_trait]
impl EmailNotifier for LogNotifier {
    async fn send_activation_email(&self, to_email: &str, _activation_link: &str) -> Result<()> {
        info!("📧 [log-only] activation email for {}", to_email);
        Ok(())
    }

    async fn send_password_reset_email(&self, to_email: &str, _reset_token: &str) -> Result<()> {
        info!("📧 [log-only] password reset email for {}", to_email);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct RelayEmailBody<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: String,
}

/// Notifier that POSTs JSON messages to an HTTP email relay.
pub struct HttpRelayNotifier {
    http: reqwest::Client,
    config: EmailRelayConfig,
}

impl HttpRelayNotifier {
    pub fn new(config: EmailRelayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, config })
    }

    async fn send(&self, to: &str, subject: &str, text: String) -> Result<()> {
        let body = RelayEmailBody {
            from: &self.config.sender,
            to,
            subject,
            text,
        };

        let mut req = self.http.post(&self.config.url).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.context("Email relay request failed")?;
        if !resp.status().is_success() {
            bail!("Email relay returned {}", resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl EmailNotifier for HttpRelayNotifier {
    async fn send_activation_email(&self, to_email: &str, activation_link: &str) -> Result<()> {
        self.send(
            to_email,
            "Activate your account",
            format!("Welcome! Activate your account by visiting:\n\n{activation_link}\n"),
        )
        .await
    }

    async fn send_password_reset_email(&self, to_email: &str, reset_token: &str) -> Result<()> {
        self.send(
            to_email,
            "Reset your password",
            format!(
                "Use this code to reset your password:\n\n{reset_token}\n\n\
                 If you did not ask for a reset, ignore this email."
            ),
        )
        .await
    }
}

/// Pick the relay notifier when configured, otherwise log-only.
pub fn notifier_from_config(relay: Option<EmailRelayConfig>) -> Result<Arc<dyn EmailNotifier>> {
    let notifier: Arc<dyn EmailNotifier> = match relay {
        Some(cfg) => {
            info!("📧 Email relay configured at {}", cfg.url);
            Arc::new(HttpRelayNotifier::new(cfg)?)
        }
        None => Arc::new(LogNotifier),
    };
    Ok(notifier)
}
