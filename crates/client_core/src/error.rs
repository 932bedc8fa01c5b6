use shared::{
    domain::{ConversationId, TempId},
    error::MembershipError,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Terminal. The session stays disconnected until a new credential is supplied.
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),
    #[error("transport dropped: {0}")]
    TransportDropped(String),
    #[error("message {temp_id} could not be handed to the transport")]
    SendFailed { temp_id: TempId },
    #[error("unknown conversation {0}")]
    InvalidConversationReference(ConversationId),
    #[error(transparent)]
    Membership(#[from] MembershipError),
    #[error("unknown message {0}")]
    UnknownMessage(String),
    #[error("message content is empty")]
    EmptyMessage,
    #[error("store request failed: {0}")]
    Store(String),
    #[error("chat session has shut down")]
    SessionClosed,
}

impl ChatError {
    pub fn store(err: &anyhow::Error) -> Self {
        ChatError::Store(format!("{err:#}"))
    }
}
