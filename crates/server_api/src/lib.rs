use chrono::{DateTime, Utc};
use shared::{
    conversation::{Conversation, ListFilter},
    domain::{ConversationId, Message, MessageId, Nonce, UserId, UserProfile},
    error::{ApiError, ErrorCode, MembershipError},
    protocol::{ConversationRecord, CreateGroupRequest, OverlayPatch, ServerFrame},
};
use storage::Storage;
use tracing::{debug, warn};

pub mod auth;

use auth::AuthConfig;

pub const MAX_CONTENT_CHARS: usize = 4000;
pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub auth: AuthConfig,
}

/// Outcome of a `send_message` frame. `fresh` is false for a replayed nonce.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    pub fresh: bool,
}

impl SendOutcome {
    pub fn frame(&self) -> ServerFrame {
        ServerFrame::NewMessage {
            conversation_id: self.message.conversation_id.clone(),
            message: self.message.clone(),
        }
    }
}

pub async fn register_user(ctx: &ApiContext, profile: &UserProfile) -> Result<(), ApiError> {
    ctx.storage.upsert_user(profile).await.map_err(internal)
}

pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: &UserId,
    filter: &ListFilter,
) -> Result<Vec<ConversationRecord>, ApiError> {
    let conversations = ctx
        .storage
        .list_conversations_for_user(user_id, filter, Utc::now())
        .await
        .map_err(internal)?;
    let mut records = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        records.push(record_for(ctx, conversation, user_id).await?);
    }
    Ok(records)
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: &UserId,
    conversation_id: &ConversationId,
    limit: u32,
    before: Option<&MessageId>,
) -> Result<Vec<Message>, ApiError> {
    ensure_participant(ctx, conversation_id, user_id).await?;
    ctx.storage
        .list_messages(conversation_id, limit.clamp(1, MAX_PAGE_SIZE), before)
        .await
        .map_err(internal)
}

pub async fn open_direct(
    ctx: &ApiContext,
    user_id: &UserId,
    other: &UserId,
) -> Result<ConversationRecord, ApiError> {
    if user_id == other {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "cannot open a direct conversation with yourself",
        ));
    }
    if ctx
        .storage
        .user_profile(other)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(ApiError::new(ErrorCode::NotFound, "user not found"));
    }
    let (conversation, created) = ctx
        .storage
        .find_or_create_direct(user_id, other, Utc::now())
        .await
        .map_err(storage_error)?;
    debug!(conversation_id = %conversation.id, created, "direct conversation resolved");
    record_for(ctx, conversation, user_id).await
}

pub async fn create_group(
    ctx: &ApiContext,
    user_id: &UserId,
    request: CreateGroupRequest,
) -> Result<ConversationRecord, ApiError> {
    let conversation = ctx
        .storage
        .create_group(
            user_id,
            request.members,
            &request.name,
            request.settings,
            Utc::now(),
        )
        .await
        .map_err(storage_error)?;
    record_for(ctx, conversation, user_id).await
}

pub async fn add_participant(
    ctx: &ApiContext,
    actor: &UserId,
    conversation_id: &ConversationId,
    user_id: &UserId,
) -> Result<ConversationRecord, ApiError> {
    let now = Utc::now();
    let conversation = mutate_conversation(ctx, conversation_id, actor, |c| {
        c.add_participant(user_id, actor, now)
    })
    .await?;
    record_for(ctx, conversation, actor).await
}

pub async fn remove_participant(
    ctx: &ApiContext,
    actor: &UserId,
    conversation_id: &ConversationId,
    user_id: &UserId,
) -> Result<(), ApiError> {
    let now = Utc::now();
    mutate_conversation(ctx, conversation_id, actor, |c| {
        c.remove_participant(user_id, actor, now)
    })
    .await?;
    Ok(())
}

pub async fn set_admin(
    ctx: &ApiContext,
    actor: &UserId,
    conversation_id: &ConversationId,
    user_id: &UserId,
) -> Result<ConversationRecord, ApiError> {
    let conversation = mutate_conversation(ctx, conversation_id, actor, |c| {
        c.set_admin(user_id, actor).map(|_| ())
    })
    .await?;
    record_for(ctx, conversation, actor).await
}

pub async fn revoke_admin(
    ctx: &ApiContext,
    actor: &UserId,
    conversation_id: &ConversationId,
    user_id: &UserId,
) -> Result<ConversationRecord, ApiError> {
    let conversation = mutate_conversation(ctx, conversation_id, actor, |c| {
        c.revoke_admin(user_id, actor).map(|_| ())
    })
    .await?;
    record_for(ctx, conversation, actor).await
}

pub async fn update_overlay(
    ctx: &ApiContext,
    user_id: &UserId,
    conversation_id: &ConversationId,
    patch: OverlayPatch,
) -> Result<ConversationRecord, ApiError> {
    let conversation = mutate_conversation(ctx, conversation_id, user_id, |c| {
        apply_overlay_patch(c, user_id, &patch)
    })
    .await?;
    record_for(ctx, conversation, user_id).await
}

fn apply_overlay_patch(
    conversation: &mut Conversation,
    user_id: &UserId,
    patch: &OverlayPatch,
) -> Result<(), MembershipError> {
    match patch.archived {
        Some(true) => conversation.archive(user_id)?,
        Some(false) => conversation.unarchive(user_id)?,
        None => {}
    }
    match patch.muted {
        Some(true) => conversation.mute(user_id, patch.muted_until)?,
        Some(false) => conversation.unmute(user_id)?,
        None => {}
    }
    match patch.pinned {
        Some(true) => conversation.pin(user_id)?,
        Some(false) => conversation.unpin(user_id)?,
        None => {}
    }
    if let Some(nickname) = &patch.nickname {
        conversation.set_nickname(user_id, Some(nickname.clone()))?;
    }
    Ok(())
}

/// Store-side append. Authorization uses the same predicate as the client.
pub async fn send_message(
    ctx: &ApiContext,
    user_id: &UserId,
    conversation_id: &ConversationId,
    content: &str,
    nonce: &Nonce,
) -> Result<SendOutcome, ApiError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "message is empty"));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("message exceeds {MAX_CONTENT_CHARS} characters"),
        ));
    }
    let conversation = ensure_participant(ctx, conversation_id, user_id).await?;
    if !conversation.can_post_messages(user_id) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only admins can post in this conversation",
        ));
    }

    let outcome = ctx
        .storage
        .append_message(conversation_id, user_id, content, Some(nonce), Utc::now())
        .await
        .map_err(internal)?;
    if !outcome.inserted {
        debug!(%conversation_id, %nonce, "replayed nonce; returning stored message");
    }
    Ok(SendOutcome {
        message: outcome.message,
        fresh: outcome.inserted,
    })
}

/// Returns the `message_read` frame to fan out, or `None` if the reader was
/// already recorded.
pub async fn mark_read(
    ctx: &ApiContext,
    user_id: &UserId,
    conversation_id: &ConversationId,
    message_id: &MessageId,
    read_at: DateTime<Utc>,
) -> Result<Option<ServerFrame>, ApiError> {
    ensure_participant(ctx, conversation_id, user_id).await?;
    let message = ctx
        .storage
        .load_message(message_id)
        .await
        .map_err(internal)?
        .filter(|m| &m.conversation_id == conversation_id)
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    if &message.sender_id == user_id {
        return Ok(None);
    }

    let newly_read = ctx
        .storage
        .mark_message_read(message_id, user_id, read_at)
        .await
        .map_err(internal)?;
    Ok(match newly_read {
        Some(true) => Some(ServerFrame::MessageRead {
            message_id: message_id.clone(),
            user_id: user_id.clone(),
            conversation_id: conversation_id.clone(),
            read_at,
        }),
        _ => None,
    })
}

pub async fn ensure_participant(
    ctx: &ApiContext,
    conversation_id: &ConversationId,
    user_id: &UserId,
) -> Result<Conversation, ApiError> {
    let conversation = ctx
        .storage
        .load_conversation(conversation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "conversation not found"))?;
    if !conversation.is_participant(user_id) {
        return Err(ApiError::new(ErrorCode::Forbidden, "user is not a member"));
    }
    if !conversation.is_active {
        return Err(ApiError::new(ErrorCode::Conflict, "conversation is inactive"));
    }
    Ok(conversation)
}

async fn mutate_conversation<F>(
    ctx: &ApiContext,
    conversation_id: &ConversationId,
    actor: &UserId,
    apply: F,
) -> Result<Conversation, ApiError>
where
    F: FnOnce(&mut Conversation) -> Result<(), MembershipError>,
{
    ensure_participant(ctx, conversation_id, actor).await?;
    let updated = ctx
        .storage
        .update_conversation(conversation_id, |conversation| {
            // Membership can change between the check above and the write lock.
            if !conversation.is_participant(actor) {
                return Err(MembershipError::PermissionDenied(actor.clone()));
            }
            if !conversation.is_active {
                return Err(MembershipError::Inactive);
            }
            apply(conversation)
        })
        .await
        .map_err(|err| {
            warn!(%conversation_id, %actor, error = %err, "conversation mutation rejected");
            storage_error(err)
        })?;
    updated.ok_or_else(|| ApiError::new(ErrorCode::NotFound, "conversation not found"))
}

async fn record_for(
    ctx: &ApiContext,
    conversation: Conversation,
    viewer: &UserId,
) -> Result<ConversationRecord, ApiError> {
    let participants = ctx
        .storage
        .profiles_for(&conversation.participants)
        .await
        .map_err(internal)?;
    let unread_count = ctx
        .storage
        .unread_count(&conversation.id, viewer)
        .await
        .map_err(internal)?;
    let last_message = ctx
        .storage
        .last_message(&conversation.id)
        .await
        .map_err(internal)?;
    Ok(ConversationRecord {
        conversation,
        participants,
        unread_count,
        last_message,
    })
}

fn storage_error(err: anyhow::Error) -> ApiError {
    match err.downcast_ref::<MembershipError>() {
        Some(violation) => ApiError::from(violation.clone()),
        None => internal(err),
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
