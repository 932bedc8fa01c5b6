use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    conversation::{Conversation, GroupSettings},
    domain::{ConversationId, Message, MessageId, Nonce, UserId, UserProfile},
    error::ApiError,
};

/// Frames sent by a client over the persistent channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientFrame {
    Authenticate {
        credential: String,
    },
    JoinChat {
        conversation_id: ConversationId,
    },
    LeaveChat {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        nonce: Nonce,
    },
    MarkMessageRead {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    TypingStart {
        conversation_id: ConversationId,
    },
    TypingStop {
        conversation_id: ConversationId,
    },
    Ping,
}

impl ClientFrame {
    pub fn name(&self) -> &'static str {
        match self {
            ClientFrame::Authenticate { .. } => "authenticate",
            ClientFrame::JoinChat { .. } => "join_chat",
            ClientFrame::LeaveChat { .. } => "leave_chat",
            ClientFrame::SendMessage { .. } => "send_message",
            ClientFrame::MarkMessageRead { .. } => "mark_message_read",
            ClientFrame::TypingStart { .. } => "typing_start",
            ClientFrame::TypingStop { .. } => "typing_stop",
            ClientFrame::Ping => "ping",
        }
    }
}

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerFrame {
    Authenticated {
        user: UserProfile,
    },
    AuthenticationError {
        message: String,
    },
    NewMessage {
        conversation_id: ConversationId,
        message: Message,
    },
    MessageRead {
        message_id: MessageId,
        user_id: UserId,
        conversation_id: ConversationId,
        read_at: DateTime<Utc>,
    },
    UserTyping {
        user_id: UserId,
        username: String,
        conversation_id: ConversationId,
    },
    UserStoppedTyping {
        user_id: UserId,
        username: String,
        conversation_id: ConversationId,
    },
    UserOnline {
        user_id: UserId,
        username: String,
    },
    UserOffline {
        user_id: UserId,
        username: String,
    },
    Pong,
    Error(ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerFrameKind {
    Authenticated,
    AuthenticationError,
    NewMessage,
    MessageRead,
    UserTyping,
    UserStoppedTyping,
    UserOnline,
    UserOffline,
    Pong,
    Error,
}

impl ServerFrame {
    pub fn kind(&self) -> ServerFrameKind {
        match self {
            ServerFrame::Authenticated { .. } => ServerFrameKind::Authenticated,
            ServerFrame::AuthenticationError { .. } => ServerFrameKind::AuthenticationError,
            ServerFrame::NewMessage { .. } => ServerFrameKind::NewMessage,
            ServerFrame::MessageRead { .. } => ServerFrameKind::MessageRead,
            ServerFrame::UserTyping { .. } => ServerFrameKind::UserTyping,
            ServerFrame::UserStoppedTyping { .. } => ServerFrameKind::UserStoppedTyping,
            ServerFrame::UserOnline { .. } => ServerFrameKind::UserOnline,
            ServerFrame::UserOffline { .. } => ServerFrameKind::UserOffline,
            ServerFrame::Pong => ServerFrameKind::Pong,
            ServerFrame::Error(_) => ServerFrameKind::Error,
        }
    }

    /// The room a frame is scoped to, if any.
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            ServerFrame::NewMessage {
                conversation_id, ..
            }
            | ServerFrame::MessageRead {
                conversation_id, ..
            }
            | ServerFrame::UserTyping {
                conversation_id, ..
            }
            | ServerFrame::UserStoppedTyping {
                conversation_id, ..
            } => Some(conversation_id),
            _ => None,
        }
    }
}

/// REST shape of a conversation as seen by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub conversation: Conversation,
    pub participants: Vec<UserProfile>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}

pub const DEFAULT_PAGE_LIMIT: u32 = 50;

fn default_page_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMessagesQuery {
    #[serde(default = "default_page_limit")]
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDirectRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    pub members: Vec<UserId>,
    #[serde(default)]
    pub settings: GroupSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddParticipantRequest {
    pub user_id: UserId,
}

/// Partial update of the caller's own overlay state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}
