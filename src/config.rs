//! SDK configuration parsed from environment variables or built in code.

use std::time::Duration;

use crate::backoff::{self, BackoffConfig};
use crate::error::SdkError;

pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HTTP_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HTTP_POOL_IDLE_SECS: u64 = 90;
pub const DEFAULT_CALL_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
    pub pool_idle: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(DEFAULT_HTTP_CONNECT_TIMEOUT_SECS),
            request: Duration::from_secs(DEFAULT_HTTP_REQUEST_TIMEOUT_SECS),
            pool_idle: Duration::from_secs(DEFAULT_HTTP_POOL_IDLE_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdkConfig {
    /// Streaming endpoint (`ws://` or `wss://`).
    pub stream_url: Option<String>,
    /// Base URL for HTTP calls (`http://` or `https://`), no trailing slash.
    pub http_base_url: Option<String>,
    /// Bearer token attached to HTTP calls and the streaming handshake.
    pub auth_token: Option<String>,
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub max_call_retries: u32,
    pub http: HttpTimeouts,
    pub backoff: BackoffConfig,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            stream_url: None,
            http_base_url: None,
            auth_token: None,
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            max_call_retries: DEFAULT_CALL_RETRIES,
            http: HttpTimeouts::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl SdkConfig {
    /// Build typed SDK config from environment variables.
    ///
    /// Optional:
    /// - `PROJECTS_SDK_STREAM_URL`, `PROJECTS_SDK_HTTP_URL`, `PROJECTS_SDK_TOKEN`
    /// - `PROJECTS_SDK_HANDSHAKE_TIMEOUT_MS`: default 10000
    /// - `PROJECTS_SDK_CALL_TIMEOUT_MS`: default 30000
    /// - `PROJECTS_SDK_CALL_RETRIES`: default 2
    /// - `PROJECTS_SDK_HTTP_CONNECT_TIMEOUT_SECS`: default 10
    /// - `PROJECTS_SDK_HTTP_REQUEST_TIMEOUT_SECS`: default 30
    /// - `PROJECTS_SDK_HTTP_POOL_IDLE_SECS`: default 90
    /// - `PROJECTS_SDK_RECONNECT_INITIAL_MS`: default 1000
    /// - `PROJECTS_SDK_RECONNECT_MAX_MS`: default 10000
    /// - `PROJECTS_SDK_RECONNECT_MULTIPLIER`: default 2.0
    /// - `PROJECTS_SDK_RECONNECT_JITTER`: default 0.2
    /// - `PROJECTS_SDK_RECONNECT_ATTEMPTS`: default 8
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Config`] when a variable is set but unparseable or
    /// the resulting config fails [`SdkConfig::validate`].
    pub fn from_env() -> Result<Self, SdkError> {
        let config = Self {
            stream_url: env_string("PROJECTS_SDK_STREAM_URL"),
            http_base_url: env_string("PROJECTS_SDK_HTTP_URL").map(|url| url.trim_end_matches('/').to_owned()),
            auth_token: env_string("PROJECTS_SDK_TOKEN"),
            handshake_timeout: Duration::from_millis(env_parse(
                "PROJECTS_SDK_HANDSHAKE_TIMEOUT_MS",
                DEFAULT_HANDSHAKE_TIMEOUT_MS,
            )?),
            call_timeout: Duration::from_millis(env_parse("PROJECTS_SDK_CALL_TIMEOUT_MS", DEFAULT_CALL_TIMEOUT_MS)?),
            max_call_retries: env_parse("PROJECTS_SDK_CALL_RETRIES", DEFAULT_CALL_RETRIES)?,
            http: HttpTimeouts {
                connect: Duration::from_secs(env_parse(
                    "PROJECTS_SDK_HTTP_CONNECT_TIMEOUT_SECS",
                    DEFAULT_HTTP_CONNECT_TIMEOUT_SECS,
                )?),
                request: Duration::from_secs(env_parse(
                    "PROJECTS_SDK_HTTP_REQUEST_TIMEOUT_SECS",
                    DEFAULT_HTTP_REQUEST_TIMEOUT_SECS,
                )?),
                pool_idle: Duration::from_secs(env_parse("PROJECTS_SDK_HTTP_POOL_IDLE_SECS", DEFAULT_HTTP_POOL_IDLE_SECS)?),
            },
            backoff: BackoffConfig {
                initial: Duration::from_millis(env_parse("PROJECTS_SDK_RECONNECT_INITIAL_MS", backoff::DEFAULT_INITIAL_MS)?),
                max: Duration::from_millis(env_parse("PROJECTS_SDK_RECONNECT_MAX_MS", backoff::DEFAULT_MAX_MS)?),
                multiplier: env_parse("PROJECTS_SDK_RECONNECT_MULTIPLIER", backoff::DEFAULT_MULTIPLIER)?,
                jitter: env_parse("PROJECTS_SDK_RECONNECT_JITTER", backoff::DEFAULT_JITTER)?,
                max_attempts: env_parse("PROJECTS_SDK_RECONNECT_ATTEMPTS", backoff::DEFAULT_MAX_ATTEMPTS)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_http_base_url(mut self, url: impl Into<String>) -> Self {
        self.http_base_url = Some(url.into().trim_end_matches('/').to_owned());
        self
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_call_retries(mut self, retries: u32) -> Self {
        self.max_call_retries = retries;
        self
    }

    /// Check URL schemes and backoff bounds.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), SdkError> {
        if let Some(url) = &self.stream_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(SdkError::Config(format!("stream url must be ws:// or wss://, got '{url}'")));
            }
        }
        if let Some(url) = &self.http_base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(SdkError::Config(format!("http url must be http:// or https://, got '{url}'")));
            }
        }
        if !self.backoff.multiplier.is_finite() || self.backoff.multiplier < 1.0 {
            return Err(SdkError::Config(format!(
                "reconnect multiplier must be finite and >= 1.0, got {}",
                self.backoff.multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.backoff.jitter) {
            return Err(SdkError::Config(format!("reconnect jitter must be in [0, 1), got {}", self.backoff.jitter)));
        }
        if self.backoff.initial > self.backoff.max {
            return Err(SdkError::Config("reconnect initial delay exceeds max delay".into()));
        }
        if self.call_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(SdkError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, SdkError>
where
    T: std::str::FromStr,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| SdkError::Config(format!("{key}: cannot parse '{raw}'"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
