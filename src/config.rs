//! Realtime client configuration parsed from environment variables.
//!
//! Every knob has a `DEFAULT_*` constant so `RealtimeConfig::default()` and
//! an empty environment produce the same client.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8080/api/v1";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
pub const DEFAULT_OPEN_FAILURE_DELAY_MS: u64 = 5_000;
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_TYPING_EXPIRY_MS: u64 = 3_000;
pub const DEFAULT_NOTIFICATION_LIMIT: usize = 50;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_BACKSTOP_POLL_MS: u64 = 60_000;

/// File name of the token store under the user's home directory.
const DEFAULT_TOKEN_FILE: &str = ".malaka/credentials.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// HTTP(S) API base. The socket URL is derived from it.
    pub api_base_url: String,
    /// Wait after an established connection closes.
    pub reconnect_delay: Duration,
    /// Wait after an open attempt fails.
    pub open_failure_delay: Duration,
    pub keepalive_interval: Duration,
    pub typing_expiry: Duration,
    /// Capacity of the in-memory notification list.
    pub notification_limit: usize,
    pub http_timeout: Duration,
    /// Period of the REST backstop poll.
    pub backstop_poll_interval: Duration,
    pub token_file: PathBuf,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_owned(),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            open_failure_delay: Duration::from_millis(DEFAULT_OPEN_FAILURE_DELAY_MS),
            keepalive_interval: Duration::from_millis(DEFAULT_KEEPALIVE_INTERVAL_MS),
            typing_expiry: Duration::from_millis(DEFAULT_TYPING_EXPIRY_MS),
            notification_limit: DEFAULT_NOTIFICATION_LIMIT,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            backstop_poll_interval: Duration::from_millis(DEFAULT_BACKSTOP_POLL_MS),
            token_file: default_token_file(std::env::var("HOME").ok().as_deref()),
        }
    }
}

impl RealtimeConfig {
    /// Build config from environment variables.
    ///
    /// Optional:
    /// - `MALAKA_API_URL`: default `http://localhost:8080/api/v1`
    /// - `MALAKA_RECONNECT_DELAY_MS`: default 3000
    /// - `MALAKA_OPEN_FAILURE_DELAY_MS`: default 5000
    /// - `MALAKA_KEEPALIVE_INTERVAL_MS`: default 30000
    /// - `MALAKA_TYPING_EXPIRY_MS`: default 3000
    /// - `MALAKA_NOTIFICATION_LIMIT`: default 50
    /// - `MALAKA_HTTP_TIMEOUT_SECS`: default 15
    /// - `MALAKA_BACKSTOP_POLL_MS`: default 60000, minimum 1000
    /// - `MALAKA_TOKEN_FILE`: default `$HOME/.malaka/credentials.json`
    #[must_use]
    pub fn from_env() -> Self {
        let api_base_url = std::env::var("MALAKA_API_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        let token_file = std::env::var("MALAKA_TOKEN_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map_or_else(|| default_token_file(std::env::var("HOME").ok().as_deref()), PathBuf::from);

        Self {
            api_base_url,
            reconnect_delay: Duration::from_millis(env_parse("MALAKA_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY_MS)),
            open_failure_delay: Duration::from_millis(env_parse(
                "MALAKA_OPEN_FAILURE_DELAY_MS",
                DEFAULT_OPEN_FAILURE_DELAY_MS,
            )),
            keepalive_interval: Duration::from_millis(env_parse(
                "MALAKA_KEEPALIVE_INTERVAL_MS",
                DEFAULT_KEEPALIVE_INTERVAL_MS,
            )),
            typing_expiry: Duration::from_millis(env_parse("MALAKA_TYPING_EXPIRY_MS", DEFAULT_TYPING_EXPIRY_MS)),
            notification_limit: env_parse("MALAKA_NOTIFICATION_LIMIT", DEFAULT_NOTIFICATION_LIMIT).max(1),
            http_timeout: Duration::from_secs(env_parse("MALAKA_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)),
            backstop_poll_interval: Duration::from_millis(
                env_parse("MALAKA_BACKSTOP_POLL_MS", DEFAULT_BACKSTOP_POLL_MS).max(1_000),
            ),
            token_file,
        }
    }

    #[must_use]
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into().trim_end_matches('/').to_owned();
        self
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn default_token_file(home: Option<&str>) -> PathBuf {
    match home {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(DEFAULT_TOKEN_FILE),
        _ => PathBuf::from(DEFAULT_TOKEN_FILE),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
