//! HTTP request/response transport.
//!
//! Thin wrapper over a pooled `reqwest::Client`. Retries are left to the
//! caller; this layer only maps outcomes onto the SDK error taxonomy.
//! `decode_body` is pure for testability.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use tracing::debug;

use crate::config::HttpTimeouts;
use crate::error::SdkError;
use crate::routing::{FilePart, HttpBody, HttpCall, Response};
use crate::session::{GaugeGuard, ResourceGauge};

/// Executes HTTP calls. Implemented by [`HttpTransport`]; tests supply fakes.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, call: HttpCall) -> Result<Response, SdkError>;
}

pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    _slot: GaugeGuard,
}

impl HttpTransport {
    /// Build a pooled client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Config`] if the token is not a valid header value or
    /// the client cannot be built.
    pub fn new(
        base_url: &str,
        auth_token: Option<&str>,
        timeouts: HttpTimeouts,
        gauge: &ResourceGauge,
    ) -> Result<Self, SdkError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SdkError::Config(format!("invalid auth token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.request)
            .pool_idle_timeout(timeouts.pool_idle)
            .build()
            .map_err(|e| SdkError::Config(format!("http client build failed: {e}")))?;

        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_owned(), _slot: gauge.acquire() })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl HttpBackend for HttpTransport {
    async fn execute(&self, call: HttpCall) -> Result<Response, SdkError> {
        let url = join_url(&self.base_url, &call.path);
        debug!(method = %call.method, url = %url, "http: request");

        let mut request = self.http.request(call.method, &url);
        if !call.query.is_empty() {
            request = request.query(&call.query);
        }
        request = match call.body {
            HttpBody::Empty => request,
            HttpBody::Json(value) => request.json(&value),
            HttpBody::Multipart { fields, files } => request.multipart(build_form(fields, files)?),
        };

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.map_err(|e| SdkError::Transport(e.to_string()))?;
        debug!(url = %url, status = status.as_u16(), "http: response");

        if !status.is_success() {
            return Err(SdkError::Http { status: status.as_u16(), body: text });
        }
        decode_body(&text)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn build_form(fields: Vec<(String, String)>, files: Vec<FilePart>) -> Result<Form, SdkError> {
    let mut form = Form::new();
    for (key, value) in fields {
        form = form.text(key, value);
    }
    for file in files {
        let part = Part::bytes(file.bytes)
            .file_name(file.file_name)
            .mime_str(&file.mime)
            .map_err(|e| SdkError::Protocol(format!("invalid mime type '{}': {e}", file.mime)))?;
        form = form.part(file.field, part);
    }
    Ok(form)
}

/// Map a success body onto a [`Response`].
pub(crate) fn decode_body(text: &str) -> Result<Response, SdkError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Response::Empty);
    }
    match serde_json::from_str(trimmed)? {
        serde_json::Value::Array(items) => Ok(Response::Many(items)),
        value => Ok(Response::Single(value)),
    }
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
