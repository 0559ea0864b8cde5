//! Dual-transport client SDK.
//!
//! A [`SessionManager`] owns one multiplexed streaming channel (WebSocket
//! carrying protobuf [`frames`]) and one pooled HTTP client. Callers issue
//! [`Request`]s by route name; the [`RoutingPolicy`] decides which transport
//! serves each one. Typed chat and measurement operations live in [`api`].

pub mod api;
pub mod backoff;
pub mod config;
pub mod error;
pub mod http;
pub mod manager;
pub mod routing;
pub mod session;
pub mod stream;

#[cfg(test)]
mod test_support;

pub use config::SdkConfig;
pub use error::{ErrorCode, SdkError};
pub use manager::SessionManager;
pub use routing::{Call, FilePart, Interaction, Request, Response, RouteRule, RoutingPolicy};
pub use session::{Session, SessionState};
pub use stream::Subscription;
