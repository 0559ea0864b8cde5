//! Routing policy: decides which transport serves a request.
//!
//! DESIGN
//! ======
//! Callers issue a [`Request`] naming a route. The [`RoutingPolicy`] looks up
//! the route's [`RouteRule`] and resolves it into a [`Plan`]: a tagged
//! [`Call`] (streaming or HTTP) plus an optional HTTP fallback. Routing never
//! inspects payload types at runtime; the rule table is the only input.
//!
//! RESOLUTION
//! ==========
//! - Stream declared, channel up → `Call::Stream`, fallback = declared HTTP.
//! - Stream declared, channel down, HTTP declared → `Call::Http`.
//! - Stream declared, channel down, no HTTP → `SdkError::NotConnected`.
//! - HTTP only → `Call::Http`, regardless of channel state.
//! - Unknown route → streaming with the policy's default interaction.

use std::collections::HashMap;

use reqwest::Method;
use serde_json::{Map, Value};

use crate::error::SdkError;
pub use frames::Interaction;

// =============================================================================
// REQUEST
// =============================================================================

/// One file attached to a multipart HTTP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// A caller-level request: route name, JSON payload, optional attachments.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub route: String,
    pub data: Value,
    pub files: Vec<FilePart>,
}

impl Request {
    pub fn new(route: impl Into<String>, data: Value) -> Self {
        Self { route: route.into(), data, files: Vec::new() }
    }

    #[must_use]
    pub fn with_file(mut self, part: FilePart) -> Self {
        self.files.push(part);
        self
    }
}

// =============================================================================
// CALLS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Streaming,
    Http,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamCall {
    pub route: String,
    pub interaction: Interaction,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HttpBody {
    Empty,
    Json(Value),
    Multipart { fields: Vec<(String, String)>, files: Vec<FilePart> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpCall {
    pub method: Method,
    /// Path relative to the HTTP base URL, placeholders already filled.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: HttpBody,
}

/// Transport-tagged call ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Stream(StreamCall),
    Http(HttpCall),
}

impl Call {
    #[must_use]
    pub fn transport(&self) -> TransportKind {
        match self {
            Self::Stream(_) => TransportKind::Streaming,
            Self::Http(_) => TransportKind::Http,
        }
    }
}

/// Result of a call, whichever transport served it.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Single(Value),
    Many(Vec<Value>),
    Empty,
}

impl Response {
    /// Collapse into one JSON value (`Many` → array, `Empty` → null).
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Single(value) => value,
            Self::Many(values) => Value::Array(values),
            Self::Empty => Value::Null,
        }
    }

    /// Deserialize the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Protocol`] when the payload does not match `T`.
    pub fn decode<T: serde::de::DeserializeOwned>(self) -> Result<T, SdkError> {
        serde_json::from_value(self.into_value()).map_err(SdkError::from)
    }
}

/// Resolved dispatch plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub call: Call,
    /// HTTP call to try when the streaming call fails at the transport level.
    pub fallback: Option<HttpCall>,
}

// =============================================================================
// POLICY
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRoute {
    pub method: Method,
    /// Path template; `{field}` placeholders are filled from the request data.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteRule {
    pub stream: Option<Interaction>,
    pub http: Option<HttpRoute>,
}

impl RouteRule {
    #[must_use]
    pub fn stream(interaction: Interaction) -> Self {
        Self { stream: Some(interaction), http: None }
    }

    pub fn http(method: Method, path: impl Into<String>) -> Self {
        Self { stream: None, http: Some(HttpRoute { method, path: path.into() }) }
    }

    #[must_use]
    pub fn with_http_fallback(mut self, method: Method, path: impl Into<String>) -> Self {
        self.http = Some(HttpRoute { method, path: path.into() });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPolicy {
    rules: HashMap<String, RouteRule>,
    default_interaction: Interaction,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self { rules: HashMap::new(), default_interaction: Interaction::RequestResponse }
    }

    #[must_use]
    pub fn route(mut self, name: impl Into<String>, rule: RouteRule) -> Self {
        self.rules.insert(name.into(), rule);
        self
    }

    #[must_use]
    pub fn with_default_interaction(mut self, interaction: Interaction) -> Self {
        self.default_interaction = interaction;
        self
    }

    #[must_use]
    pub fn rule(&self, route: &str) -> Option<&RouteRule> {
        self.rules.get(route)
    }

    /// Resolve a request into a dispatch plan.
    ///
    /// # Errors
    ///
    /// - [`SdkError::NotConnected`] for streaming-only routes while the channel is down.
    /// - [`SdkError::Protocol`] when a path placeholder is missing from the data,
    ///   or when attachments are sent on a streaming-only route.
    pub fn resolve(&self, request: &Request, streaming_available: bool) -> Result<Plan, SdkError> {
        let default_rule;
        let rule = if let Some(rule) = self.rules.get(&request.route) {
            rule
        } else {
            default_rule = RouteRule::stream(self.default_interaction);
            &default_rule
        };

        let http = rule.http.as_ref().map(|route| build_http_call(route, request)).transpose()?;

        match (rule.stream, http) {
            (Some(_), Some(http)) if !request.files.is_empty() => Ok(Plan { call: Call::Http(http), fallback: None }),
            (Some(interaction), http) if streaming_available => {
                if !request.files.is_empty() {
                    return Err(SdkError::Protocol(format!(
                        "route {} carries attachments but has no HTTP mapping",
                        request.route
                    )));
                }
                let call = StreamCall { route: request.route.clone(), interaction, data: request.data.clone() };
                Ok(Plan { call: Call::Stream(call), fallback: http })
            }
            (Some(_), Some(http)) | (None, Some(http)) => Ok(Plan { call: Call::Http(http), fallback: None }),
            (Some(_), None) => Err(SdkError::NotConnected),
            (None, None) => Err(SdkError::Protocol(format!("route {} has no transport", request.route))),
        }
    }
}

// =============================================================================
// HTTP CALL CONSTRUCTION
// =============================================================================

fn build_http_call(route: &HttpRoute, request: &Request) -> Result<HttpCall, SdkError> {
    let (path, consumed) = fill_path(&route.path, &request.data)?;

    let remaining: Map<String, Value> = match &request.data {
        Value::Object(map) => map.iter().filter(|(k, _)| !consumed.contains(k)).map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => Map::new(),
    };

    if !request.files.is_empty() {
        let fields = remaining.iter().map(|(k, v)| (k.clone(), scalar_to_string(v))).collect();
        return Ok(HttpCall {
            method: route.method.clone(),
            path,
            query: Vec::new(),
            body: HttpBody::Multipart { fields, files: request.files.clone() },
        });
    }

    if route.method == Method::GET || route.method == Method::DELETE {
        let query = remaining
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), scalar_to_string(v)))
            .collect();
        return Ok(HttpCall { method: route.method.clone(), path, query, body: HttpBody::Empty });
    }

    let body = if request.data.is_null() { HttpBody::Empty } else { HttpBody::Json(request.data.clone()) };
    Ok(HttpCall { method: route.method.clone(), path, query: Vec::new(), body })
}

/// Replace `{field}` placeholders with values from `data`.
fn fill_path(template: &str, data: &Value) -> Result<(String, Vec<String>), SdkError> {
    let mut out = String::with_capacity(template.len());
    let mut consumed = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            return Err(SdkError::Protocol(format!("unterminated placeholder in path '{template}'")));
        };
        let key = &after[..end];
        let value = data
            .get(key)
            .filter(|v| !v.is_null())
            .ok_or_else(|| SdkError::Protocol(format!("missing path field `{key}`")))?;
        out.push_str(&scalar_to_string(value));
        consumed.push(key.to_owned());
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok((out, consumed))
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[path = "routing_test.rs"]
mod tests;
