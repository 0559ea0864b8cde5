//! Chat operations served over the streaming channel.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::models::{
    Chat, ChatMessagesRequest, ChatRequest, Message, UnreadCountRequest, UnreadCountResponse, UserChatsRequest,
};
use crate::error::SdkError;
use crate::manager::SessionManager;
use crate::routing::Request;
use crate::stream::Subscription;

pub const ROUTE_USER_CHATS: &str = "chats.getAll";
pub const ROUTE_CHAT_MESSAGES: &str = "chats.getMessages";
pub const ROUTE_GET_OR_CREATE: &str = "chats.getOrCreate";
pub const ROUTE_STREAM_MESSAGES: &str = "chats.streamMessages";
pub const ROUTE_UNREAD_COUNT: &str = "chats.getUnreadCount";
pub const ROUTE_HAS_CHATS: &str = "chats.hasChats";

#[derive(Debug, Clone)]
pub struct ChatApi {
    manager: SessionManager,
}

impl ChatApi {
    #[must_use]
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    /// One page of the user's chats.
    ///
    /// # Errors
    ///
    /// Any [`SdkError`] from the session manager, or `Protocol` when an item
    /// is not a chat.
    pub async fn user_chats(&self, user_id: &str, page: u32, size: u32) -> Result<Vec<Chat>, SdkError> {
        let body = UserChatsRequest { user_id: user_id.to_owned(), page, size };
        self.request(ROUTE_USER_CHATS, &body).await
    }

    /// One page of a chat's messages.
    ///
    /// # Errors
    ///
    /// As [`ChatApi::user_chats`].
    pub async fn chat_messages(&self, chat_id: &str, page: u32, size: u32) -> Result<Vec<Message>, SdkError> {
        let body = ChatMessagesRequest { chat_id: chat_id.to_owned(), page, size };
        self.request(ROUTE_CHAT_MESSAGES, &body).await
    }

    /// # Errors
    ///
    /// As [`ChatApi::user_chats`].
    pub async fn get_or_create_chat(&self, user1_id: &str, user2_id: &str) -> Result<Chat, SdkError> {
        let body = ChatRequest { user1_id: user1_id.to_owned(), user2_id: user2_id.to_owned() };
        self.request(ROUTE_GET_OR_CREATE, &body).await
    }

    /// # Errors
    ///
    /// As [`ChatApi::user_chats`].
    pub async fn unread_count(&self, chat_id: &str, user_id: &str) -> Result<u32, SdkError> {
        let body = UnreadCountRequest { chat_id: chat_id.to_owned(), user_id: user_id.to_owned() };
        let response: UnreadCountResponse = self.request(ROUTE_UNREAD_COUNT, &body).await?;
        Ok(response.count)
    }

    /// # Errors
    ///
    /// As [`ChatApi::user_chats`].
    pub async fn has_chats(&self, user_id: &str) -> Result<bool, SdkError> {
        self.request(ROUTE_HAS_CHATS, &user_id).await
    }

    /// Live messages for `chat_id` until cancelled or the backend completes.
    ///
    /// # Errors
    ///
    /// As [`SessionManager::subscribe`].
    pub async fn stream_messages(&self, chat_id: &str) -> Result<MessageStream, SdkError> {
        self.stream_messages_with_cancel(chat_id, CancellationToken::new()).await
    }

    /// # Errors
    ///
    /// As [`SessionManager::subscribe`].
    pub async fn stream_messages_with_cancel(
        &self,
        chat_id: &str,
        cancel: CancellationToken,
    ) -> Result<MessageStream, SdkError> {
        let request = Request::new(ROUTE_STREAM_MESSAGES, Value::String(chat_id.to_owned()));
        let inner = self.manager.subscribe_with_cancel(request, cancel).await?;
        Ok(MessageStream { inner })
    }

    async fn request<B, T>(&self, route: &str, body: &B) -> Result<T, SdkError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = Request::new(route, serde_json::to_value(body)?);
        self.manager.call(request).await?.decode()
    }
}

/// Typed view over a `chats.streamMessages` subscription.
#[derive(Debug)]
pub struct MessageStream {
    inner: Subscription,
}

impl MessageStream {
    pub async fn next(&mut self) -> Option<Result<Message, SdkError>> {
        let item = self.inner.next().await?;
        Some(item.and_then(|value| serde_json::from_value(value).map_err(SdkError::from)))
    }

    /// Stop the stream and notify the backend.
    pub fn cancel(&mut self) {
        self.inner.cancel();
    }
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
