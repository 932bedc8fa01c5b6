use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use server_api::auth::{bearer_token, verify_token};
use shared::{
    conversation::ListFilter,
    domain::{ConversationId, Message, UserId, UserProfile},
    error::{ApiError, ErrorCode},
    protocol::{
        AddParticipantRequest, ConversationRecord, CreateGroupRequest, ListMessagesQuery,
        OpenDirectRequest, OverlayPatch,
    },
};
use tracing::debug;

use crate::app_state::AppState;

pub(crate) type HttpError = (StatusCode, Json<ApiError>);

pub(crate) fn status_for(code: &ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn http_error(err: ApiError) -> HttpError {
    (status_for(&err.code), Json(err))
}

/// Resolves the bearer credential and records the caller's profile.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<UserProfile, HttpError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| {
            http_error(ApiError::new(
                ErrorCode::Unauthorized,
                "missing bearer credential",
            ))
        })?;
    let profile = verify_token(&state.api.auth, token).map_err(http_error)?;
    server_api::register_user(&state.api, &profile)
        .await
        .map_err(http_error)?;
    Ok(profile)
}

pub(crate) async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        http_error(ApiError::new(ErrorCode::Internal, e.to_string()))
    })?;
    Ok("ok")
}

pub(crate) async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(filter): Query<ListFilter>,
) -> Result<Json<Vec<ConversationRecord>>, HttpError> {
    let user = authorize(&state, &headers).await?;
    let records = server_api::list_conversations(&state.api, &user.id, &filter)
        .await
        .map_err(http_error)?;
    debug!(user_id = %user.id, count = records.len(), "listed conversations");
    Ok(Json(records))
}

pub(crate) async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<Vec<Message>>, HttpError> {
    let user = authorize(&state, &headers).await?;
    let messages = server_api::list_messages(
        &state.api,
        &user.id,
        &ConversationId::new(conversation_id),
        q.limit,
        q.before.as_ref(),
    )
    .await
    .map_err(http_error)?;
    Ok(Json(messages))
}

pub(crate) async fn open_direct(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<OpenDirectRequest>,
) -> Result<Json<ConversationRecord>, HttpError> {
    let user = authorize(&state, &headers).await?;
    let record = server_api::open_direct(&state.api, &user.id, &req.user_id)
        .await
        .map_err(http_error)?;
    Ok(Json(record))
}

pub(crate) async fn create_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<ConversationRecord>), HttpError> {
    let user = authorize(&state, &headers).await?;
    let record = server_api::create_group(&state.api, &user.id, req)
        .await
        .map_err(http_error)?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub(crate) async fn add_participant(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(req): Json<AddParticipantRequest>,
) -> Result<Json<ConversationRecord>, HttpError> {
    let user = authorize(&state, &headers).await?;
    let record = server_api::add_participant(
        &state.api,
        &user.id,
        &ConversationId::new(conversation_id),
        &req.user_id,
    )
    .await
    .map_err(http_error)?;
    Ok(Json(record))
}

pub(crate) async fn remove_participant(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((conversation_id, user_id)): Path<(String, String)>,
) -> Result<StatusCode, HttpError> {
    let user = authorize(&state, &headers).await?;
    let conversation_id = ConversationId::new(conversation_id);
    let user_id = UserId::new(user_id);
    server_api::remove_participant(&state.api, &user.id, &conversation_id, &user_id)
        .await
        .map_err(http_error)?;
    state.hub.evict(conversation_id, user_id);
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn grant_admin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((conversation_id, user_id)): Path<(String, String)>,
) -> Result<Json<ConversationRecord>, HttpError> {
    let user = authorize(&state, &headers).await?;
    let record = server_api::set_admin(
        &state.api,
        &user.id,
        &ConversationId::new(conversation_id),
        &UserId::new(user_id),
    )
    .await
    .map_err(http_error)?;
    Ok(Json(record))
}

pub(crate) async fn revoke_admin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((conversation_id, user_id)): Path<(String, String)>,
) -> Result<Json<ConversationRecord>, HttpError> {
    let user = authorize(&state, &headers).await?;
    let record = server_api::revoke_admin(
        &state.api,
        &user.id,
        &ConversationId::new(conversation_id),
        &UserId::new(user_id),
    )
    .await
    .map_err(http_error)?;
    Ok(Json(record))
}

pub(crate) async fn update_overlay(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(patch): Json<OverlayPatch>,
) -> Result<Json<ConversationRecord>, HttpError> {
    let user = authorize(&state, &headers).await?;
    let record = server_api::update_overlay(
        &state.api,
        &user.id,
        &ConversationId::new(conversation_id),
        patch,
    )
    .await
    .map_err(http_error)?;
    Ok(Json(record))
}
