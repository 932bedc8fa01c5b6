use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Conflict,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Rejections raised at the conversation model boundary. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("user {0} is already a member")]
    AlreadyMember(UserId),
    #[error("user {0} is not a member")]
    NotMember(UserId),
    #[error("group is full (max {max} participants)")]
    GroupFull { max: u32 },
    #[error("operation requires a group conversation")]
    NotGroupChat,
    #[error("user {0} is not allowed to perform this operation")]
    PermissionDenied(UserId),
    #[error("a group needs at least two participants")]
    GroupTooSmall,
    #[error("cannot revoke the last admin of a group")]
    LastAdmin,
    #[error("invalid participants: {0}")]
    InvalidParticipants(String),
    #[error("conversation is inactive")]
    Inactive,
}

impl From<MembershipError> for ApiError {
    fn from(value: MembershipError) -> Self {
        let code = match &value {
            MembershipError::PermissionDenied(_) => ErrorCode::Forbidden,
            MembershipError::AlreadyMember(_) => ErrorCode::Conflict,
            MembershipError::Inactive => ErrorCode::Conflict,
            _ => ErrorCode::Validation,
        };
        ApiError::new(code, value.to_string())
    }
}
