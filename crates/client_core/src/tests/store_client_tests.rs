use super::*;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use shared::error::ErrorCode;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Seen {
    requests: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

fn auth_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn messages(
    State(seen): State<Seen>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Query(q): Query<ListMessagesQuery>,
) -> Json<Vec<Message>> {
    seen.requests.lock().expect("lock").push((
        format!("{conversation_id}?limit={}&before={:?}", q.limit, q.before),
        auth_header(&headers),
    ));
    let at = Utc
        .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .expect("time");
    Json(vec![Message {
        id: MessageId::new("m1"),
        conversation_id: ConversationId::new(conversation_id),
        sender_id: UserId::new("bob"),
        content: "hello".into(),
        timestamp: at,
        read_by: Vec::new(),
        nonce: None,
    }])
}

async fn refuse_direct(Json(_req): Json<OpenDirectRequest>) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError::new(ErrorCode::NotFound, "no such user")),
    )
}

async fn spawn_store() -> (String, Seen) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let seen = Seen::default();
    let app = Router::new()
        .route("/conversations/:conversation_id/messages", get(messages))
        .route("/conversations/direct", post(refuse_direct))
        .with_state(seen.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/"), seen)
}

#[tokio::test]
async fn list_messages_sends_bearer_and_paging() {
    let (base_url, seen) = spawn_store().await;
    let store = HttpConversationStore::new(base_url, "tok-1");

    let page = store
        .list_messages(&ConversationId::new("c1"), 20, Some(&MessageId::new("m9")))
        .await
        .expect("list messages");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].content, "hello");

    let requests = seen.requests.lock().expect("lock").clone();
    assert_eq!(
        requests,
        vec![(
            "c1?limit=20&before=Some(MessageId(\"m9\"))".to_string(),
            Some("Bearer tok-1".to_string())
        )]
    );
}

#[tokio::test]
async fn error_bodies_decode_to_api_errors() {
    let (base_url, _seen) = spawn_store().await;
    let store = HttpConversationStore::new(base_url, "tok-1");

    let err = store
        .open_direct(&UserId::new("ghost"))
        .await
        .expect_err("store refuses");
    let api = api_error(&err).expect("api error body");
    assert_eq!(api.code, ErrorCode::NotFound);
    assert_eq!(api.message, "no such user");
}

#[tokio::test]
async fn unreachable_store_is_an_error() {
    let store = HttpConversationStore::new("http://127.0.0.1:9", "tok");
    let err = store
        .list_conversations(&ListFilter::default())
        .await
        .expect_err("nothing listens on the discard port");
    assert!(api_error(&err).is_none());
}
