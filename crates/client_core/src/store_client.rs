//! Request/response access to the durable store.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    conversation::{GroupSettings, ListFilter},
    domain::{ConversationId, Message, MessageId, UserId},
    error::ApiError,
    protocol::{
        AddParticipantRequest, ConversationRecord, CreateGroupRequest, ListMessagesQuery,
        OpenDirectRequest, OverlayPatch,
    },
};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn list_conversations(&self, filter: &ListFilter) -> Result<Vec<ConversationRecord>>;

    /// Newest `limit` messages older than `before`, oldest first.
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&MessageId>,
    ) -> Result<Vec<Message>>;

    async fn open_direct(&self, user_id: &UserId) -> Result<ConversationRecord>;

    async fn create_group(
        &self,
        name: &str,
        members: &[UserId],
        settings: GroupSettings,
    ) -> Result<ConversationRecord>;

    async fn add_participant(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<ConversationRecord>;

    async fn remove_participant(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<()>;

    async fn set_admin(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<ConversationRecord>;

    async fn revoke_admin(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<ConversationRecord>;

    async fn update_overlay(
        &self,
        conversation_id: &ConversationId,
        patch: &OverlayPatch,
    ) -> Result<ConversationRecord>;
}

/// REST client speaking the server's `/conversations` routes.
#[derive(Clone)]
pub struct HttpConversationStore {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpConversationStore {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("{what}: request failed"))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ApiError>(&body) {
            Ok(api_error) => Err(anyhow::Error::new(api_error).context(format!("{what}: {status}"))),
            Err(_) => Err(anyhow!("{what}: {status}: {body}")),
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        self.send(request, what)
            .await?
            .json()
            .await
            .with_context(|| format!("{what}: invalid response body"))
    }
}

#[async_trait]
impl ConversationStore for HttpConversationStore {
    async fn list_conversations(&self, filter: &ListFilter) -> Result<Vec<ConversationRecord>> {
        let request = self.http.get(self.url("/conversations")).query(filter);
        self.fetch(request, "list conversations").await
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&MessageId>,
    ) -> Result<Vec<Message>> {
        let request = self
            .http
            .get(self.url(&format!("/conversations/{conversation_id}/messages")))
            .query(&ListMessagesQuery {
                limit,
                before: before.cloned(),
            });
        self.fetch(request, "list messages").await
    }

    async fn open_direct(&self, user_id: &UserId) -> Result<ConversationRecord> {
        let request = self
            .http
            .post(self.url("/conversations/direct"))
            .json(&OpenDirectRequest {
                user_id: user_id.clone(),
            });
        self.fetch(request, "open direct conversation").await
    }

    async fn create_group(
        &self,
        name: &str,
        members: &[UserId],
        settings: GroupSettings,
    ) -> Result<ConversationRecord> {
        let request = self
            .http
            .post(self.url("/conversations/group"))
            .json(&CreateGroupRequest {
                name: name.to_string(),
                members: members.to_vec(),
                settings,
            });
        self.fetch(request, "create group").await
    }

    async fn add_participant(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<ConversationRecord> {
        let request = self
            .http
            .post(self.url(&format!("/conversations/{conversation_id}/participants")))
            .json(&AddParticipantRequest {
                user_id: user_id.clone(),
            });
        self.fetch(request, "add participant").await
    }

    async fn remove_participant(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<()> {
        let request = self.http.delete(self.url(&format!(
            "/conversations/{conversation_id}/participants/{user_id}"
        )));
        self.send(request, "remove participant").await?;
        Ok(())
    }

    async fn set_admin(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<ConversationRecord> {
        let request = self.http.post(self.url(&format!(
            "/conversations/{conversation_id}/admins/{user_id}"
        )));
        self.fetch(request, "grant admin").await
    }

    async fn revoke_admin(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<ConversationRecord> {
        let request = self.http.delete(self.url(&format!(
            "/conversations/{conversation_id}/admins/{user_id}"
        )));
        self.fetch(request, "revoke admin").await
    }

    async fn update_overlay(
        &self,
        conversation_id: &ConversationId,
        patch: &OverlayPatch,
    ) -> Result<ConversationRecord> {
        let request = self
            .http
            .patch(self.url(&format!("/conversations/{conversation_id}/overlay")))
            .json(patch);
        self.fetch(request, "update overlay").await
    }
}

/// The store's error body, if the failure carried one.
pub fn api_error(err: &anyhow::Error) -> Option<&ApiError> {
    err.downcast_ref::<ApiError>()
}

#[cfg(test)]
#[path = "tests/store_client_tests.rs"]
mod tests;
