//! Typed business APIs over the session manager.

mod chat;
mod measurement;
pub mod models;

use reqwest::Method;

pub use chat::{
    ChatApi, MessageStream, ROUTE_CHAT_MESSAGES, ROUTE_GET_OR_CREATE, ROUTE_HAS_CHATS, ROUTE_STREAM_MESSAGES,
    ROUTE_UNREAD_COUNT, ROUTE_USER_CHATS,
};
pub use measurement::{MeasurementApi, ROUTE_MEASURE};

use crate::routing::{Interaction, RouteRule, RoutingPolicy};

/// Routing for every operation in this module.
#[must_use]
pub fn default_policy() -> RoutingPolicy {
    RoutingPolicy::new()
        .route(ROUTE_USER_CHATS, RouteRule::stream(Interaction::RequestStream))
        .route(ROUTE_CHAT_MESSAGES, RouteRule::stream(Interaction::RequestStream))
        .route(ROUTE_GET_OR_CREATE, RouteRule::stream(Interaction::RequestResponse))
        .route(ROUTE_STREAM_MESSAGES, RouteRule::stream(Interaction::RequestStream))
        .route(ROUTE_UNREAD_COUNT, RouteRule::stream(Interaction::RequestResponse))
        .route(ROUTE_HAS_CHATS, RouteRule::stream(Interaction::RequestResponse))
        .route(ROUTE_MEASURE, RouteRule::http(Method::POST, ROUTE_MEASURE))
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
