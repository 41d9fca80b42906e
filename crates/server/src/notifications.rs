//! Push notifications via Pushbullet.

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

const PUSHBULLET_ENDPOINT: &str = "https://api.pushbullet.com/v2/pushes";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Pushbullet request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Pushbullet API error: {status} - {body}")]
    Api { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub url: Option<String>,
}

/// A `note` push, or a `link` push when a URL is attached.
pub fn push_payload(notification: &Notification) -> Value {
    match &notification.url {
        Some(url) => json!({
            "type": "link",
            "title": notification.title,
            "body": notification.body,
            "url": url,
        }),
        None => json!({
            "type": "note",
            "title": notification.title,
            "body": notification.body,
        }),
    }
}

#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    endpoint: String,
}

impl Notifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: PUSHBULLET_ENDPOINT.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Send one push. Returns `Ok(false)` when no token is configured.
    pub async fn send(
        &self,
        token: &str,
        notification: &Notification,
    ) -> Result<bool, NotifyError> {
        if token.trim().is_empty() {
            warn!(
                component = "notifications",
                event = "notify.skipped_no_token",
                title = %notification.title,
                "Pushbullet token not configured, skipping notification"
            );
            return Ok(false);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header("Access-Token", token)
            .json(&push_payload(notification))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Api {
                status: status.as_u16(),
                body,
            });
        }

        info!(
            component = "notifications",
            event = "notify.sent",
            title = %notification.title,
            "Notification sent"
        );
        Ok(true)
    }
}
