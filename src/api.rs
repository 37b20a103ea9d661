//! REST backstop: the polled endpoints that reconcile missed push frames.
//!
//! DESIGN
//! ======
//! Consumers depend on the [`Backstop`] trait, not on HTTP. [`RestClient`]
//! is the reqwest-backed implementation; it attaches the stored bearer token
//! to every request and clears the token store when the server answers 401.
//! Response parsing lives in free functions so it can be tested without a
//! server.
//!
//! ERROR HANDLING
//! ==============
//! Every call returns [`ApiError`]. Consumers log and swallow these; nothing
//! here is fatal to the realtime channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use frames::NotificationPayload;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::{self, TokenError, TokenStore};
use crate::config::RealtimeConfig;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP client build failed: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("request to {path} failed: {source}")]
    Request {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} returned status {status}")]
    Status { status: u16, path: String },

    #[error("response from {path} is not valid JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no usable access token")]
    Unauthenticated,

    #[error(transparent)]
    Token(#[from] TokenError),
}

impl ApiError {
    /// Whether a later poll may succeed without user action.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Request { .. } | Self::Status { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// BACKSTOP
// =============================================================================

/// Dashboard badge counts from `/action-items`, keyed by category.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionItemSummary {
    pub counts: BTreeMap<String, u64>,
}

impl ActionItemSummary {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

/// REST collaborators polled alongside the push channel.
#[async_trait]
pub trait Backstop: Send + Sync {
    async fn notifications(&self, limit: usize) -> Result<Vec<NotificationPayload>, ApiError>;
    async fn notification_unread_count(&self) -> Result<u64, ApiError>;
    async fn mark_notification_read(&self, id: &str) -> Result<(), ApiError>;
    async fn mark_all_notifications_read(&self) -> Result<(), ApiError>;
    async fn message_unread_count(&self) -> Result<u64, ApiError>;
    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<(), ApiError>;
    async fn action_items(&self) -> Result<ActionItemSummary, ApiError>;
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenStore>,
}

impl RestClient {
    /// # Errors
    ///
    /// Returns [`ApiError::ClientBuild`] if the HTTP client cannot be built.
    pub fn new(config: &RealtimeConfig, tokens: Arc<dyn TokenStore>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(ApiError::ClientBuild)?;
        Ok(Self { http, base_url: config.api_base_url.trim_end_matches('/').to_owned(), tokens })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ApiError> {
        self.execute(path, self.http.get(self.url(path)).query(query)).await
    }

    async fn post(&self, path: &str) -> Result<Value, ApiError> {
        self.execute(path, self.http.post(self.url(path))).await
    }

    async fn execute(&self, path: &str, request: reqwest::RequestBuilder) -> Result<Value, ApiError> {
        let token = auth::resolve_token(self.tokens.as_ref()).await.ok_or(ApiError::Unauthenticated)?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|source| ApiError::Request { path: path.to_owned(), source })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            warn!(path, "backstop rejected token; clearing token store");
            self.tokens.clear().await?;
        }
        if !status.is_success() {
            return Err(ApiError::Status { status: status.as_u16(), path: path.to_owned() });
        }

        let text = response
            .text()
            .await
            .map_err(|source| ApiError::Request { path: path.to_owned(), source })?;
        parse_body(path, &text)
    }
}

#[async_trait]
impl Backstop for RestClient {
    async fn notifications(&self, limit: usize) -> Result<Vec<NotificationPayload>, ApiError> {
        let query = [("limit", limit.to_string()), ("include_read", "true".to_owned())];
        let body = self.get("/notifications", &query).await?;
        Ok(parse_notifications(body))
    }

    async fn notification_unread_count(&self) -> Result<u64, ApiError> {
        let body = self.get("/notifications/unread-count", &[]).await?;
        Ok(parse_count(body))
    }

    async fn mark_notification_read(&self, id: &str) -> Result<(), ApiError> {
        self.post(&format!("/notifications/{id}/read")).await.map(drop)
    }

    async fn mark_all_notifications_read(&self) -> Result<(), ApiError> {
        self.post("/notifications/mark-all-read").await.map(drop)
    }

    async fn message_unread_count(&self) -> Result<u64, ApiError> {
        let body = self.get("/messaging/unread-count", &[]).await?;
        Ok(parse_count(body))
    }

    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<(), ApiError> {
        self.post(&format!("/messaging/conversations/{conversation_id}/read")).await.map(drop)
    }

    async fn action_items(&self) -> Result<ActionItemSummary, ApiError> {
        let body = self.get("/action-items", &[]).await?;
        Ok(parse_action_items(body))
    }
}

// =============================================================================
// PARSING
// =============================================================================

fn parse_body(path: &str, text: &str) -> Result<Value, ApiError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|source| ApiError::Parse { path: path.to_owned(), source })
}

/// Responses come either bare or wrapped as `{"data": ...}`.
pub(crate) fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("data") => map.remove("data").unwrap_or(Value::Null),
        other => other,
    }
}

/// Accepts a bare number, `{"count": n}` or `{"unread_count": n}`.
pub(crate) fn parse_count(body: Value) -> u64 {
    let body = unwrap_data(body);
    body.as_u64()
        .or_else(|| body.get("count").and_then(Value::as_u64))
        .or_else(|| body.get("unread_count").and_then(Value::as_u64))
        .unwrap_or(0)
}

/// List items that do not look like notifications are skipped.
pub(crate) fn parse_notifications(body: Value) -> Vec<NotificationPayload> {
    let Value::Array(items) = unwrap_data(body) else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(n) => Some(n),
            Err(e) => {
                debug!(error = %e, "skipping malformed notification");
                None
            }
        })
        .collect()
}

/// Non-numeric fields are ignored.
pub(crate) fn parse_action_items(body: Value) -> ActionItemSummary {
    let Value::Object(map) = unwrap_data(body) else {
        return ActionItemSummary::default();
    };
    let counts = map.into_iter().filter_map(|(key, value)| value.as_u64().map(|n| (key, n))).collect();
    ActionItemSummary { counts }
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
