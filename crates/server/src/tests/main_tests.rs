use super::*;
use std::time::Duration;

use axum::{
    body::{self, Body},
    http::{header, Request, StatusCode},
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use server_api::auth::issue_token;
use shared::{
    domain::{ConversationId, Nonce, UserId, UserProfile},
    protocol::{ClientFrame, ConversationRecord, ServerFrame},
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tower::ServiceExt;

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn test_state() -> Arc<AppState> {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    for name in ["alice", "bob", "carol"] {
        storage
            .upsert_user(&profile(name))
            .await
            .expect("user");
    }
    Arc::new(AppState {
        api: ApiContext {
            storage,
            auth: AuthConfig {
                secret: "test-secret".into(),
                ttl_seconds: 600,
            },
        },
        hub: Hub::new(64),
        limits: SocketLimits {
            auth_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(30),
        },
    })
}

fn profile(name: &str) -> UserProfile {
    UserProfile {
        id: UserId::new(name),
        display_name: name.to_uppercase(),
    }
}

fn token_for(state: &AppState, name: &str) -> String {
    issue_token(&state.api.auth, &profile(name), Utc::now()).expect("token")
}

async fn open_direct_via_http(app: &Router, token: &str, peer: &str) -> ConversationRecord {
    let request = Request::post("/conversations/direct")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "userId": peer }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

async fn spawn_server(state: Arc<AppState>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("ws://{addr}/ws")
}

async fn send(socket: &mut Socket, frame: &ClientFrame) {
    let text = serde_json::to_string(frame).expect("encode");
    socket.send(WsMessage::Text(text)).await.expect("send");
}

async fn next_frame(socket: &mut Socket) -> ServerFrame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("ws message");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(&text).expect("decode");
        }
    }
}

/// Skips presence frames, which arrive in connection order.
async fn next_non_presence(socket: &mut Socket) -> ServerFrame {
    loop {
        let frame = next_frame(socket).await;
        if !matches!(
            frame,
            ServerFrame::UserOnline { .. } | ServerFrame::UserOffline { .. }
        ) {
            return frame;
        }
    }
}

async fn connect_as(url: &str, state: &AppState, name: &str) -> Socket {
    let (mut socket, _) = connect_async(url).await.expect("connect");
    send(
        &mut socket,
        &ClientFrame::Authenticate {
            credential: token_for(state, name),
        },
    )
    .await;
    match next_frame(&mut socket).await {
        ServerFrame::Authenticated { user } => assert_eq!(user.id, UserId::new(name)),
        other => panic!("expected authenticated, got {other:?}"),
    }
    socket
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let app = build_router(test_state().await);
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn conversation_routes_require_bearer_credential() {
    let app = build_router(test_state().await);
    let request = Request::get("/conversations")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::get("/conversations")
        .header(header::AUTHORIZATION, "Bearer not-a-jwt")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn direct_conversation_is_listed_for_both_participants() {
    let state = test_state().await;
    let app = build_router(state.clone());
    let alice = token_for(&state, "alice");
    let bob = token_for(&state, "bob");

    let created = open_direct_via_http(&app, &alice, "bob").await;
    let reopened = open_direct_via_http(&app, &bob, "alice").await;
    assert_eq!(created.conversation.id, reopened.conversation.id);

    let request = Request::get("/conversations")
        .header(header::AUTHORIZATION, format!("Bearer {bob}"))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let listed: Vec<ConversationRecord> = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(listed.len(), 1);

    let carol = token_for(&state, "carol");
    let request = Request::get(format!(
        "/conversations/{}/messages?limit=10",
        created.conversation.id
    ))
    .header(header::AUTHORIZATION, format!("Bearer {carol}"))
    .body(Body::empty())
    .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn group_admin_routes_map_membership_errors() {
    let state = test_state().await;
    let app = build_router(state.clone());
    let alice = token_for(&state, "alice");
    let bob = token_for(&state, "bob");

    let request = Request::post("/conversations/group")
        .header(header::AUTHORIZATION, format!("Bearer {alice}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "name": "crew", "members": ["bob"] }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let group: ConversationRecord = serde_json::from_slice(&bytes).expect("json");
    let id = group.conversation.id;

    let request = Request::post(format!("/conversations/{id}/participants"))
        .header(header::AUTHORIZATION, format!("Bearer {bob}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "userId": "carol" }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let request = Request::delete(format!("/conversations/{id}/participants/bob"))
        .header(header::AUTHORIZATION, format!("Bearer {alice}"))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = Request::patch(format!("/conversations/{id}/overlay"))
        .header(header::AUTHORIZATION, format!("Bearer {bob}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::json!({ "pinned": true }).to_string()))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn socket_rejects_bad_credential() {
    let state = test_state().await;
    let url = spawn_server(state).await;
    let (mut socket, _) = connect_async(url.as_str()).await.expect("connect");
    send(
        &mut socket,
        &ClientFrame::Authenticate {
            credential: "garbage".into(),
        },
    )
    .await;
    assert!(matches!(
        next_frame(&mut socket).await,
        ServerFrame::AuthenticationError { .. }
    ));
}

#[tokio::test]
async fn socket_requires_authenticate_first() {
    let state = test_state().await;
    let url = spawn_server(state).await;
    let (mut socket, _) = connect_async(url.as_str()).await.expect("connect");
    send(&mut socket, &ClientFrame::Ping).await;
    match next_frame(&mut socket).await {
        ServerFrame::AuthenticationError { message } => assert!(message.contains("ping")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn messages_fan_out_to_joined_room_and_replays_stay_private() {
    let state = test_state().await;
    let app = build_router(state.clone());
    let record = open_direct_via_http(&app, &token_for(&state, "alice"), "bob").await;
    let conversation_id = record.conversation.id;
    let url = spawn_server(state.clone()).await;

    let mut alice = connect_as(&url, &state, "alice").await;
    let mut bob = connect_as(&url, &state, "bob").await;
    for socket in [&mut alice, &mut bob] {
        send(
            socket,
            &ClientFrame::JoinChat {
                conversation_id: conversation_id.clone(),
            },
        )
        .await;
        send(socket, &ClientFrame::Ping).await;
        assert_eq!(next_non_presence(socket).await, ServerFrame::Pong);
    }

    let nonce = Nonce::new("nonce-1");
    let frame = ClientFrame::SendMessage {
        conversation_id: conversation_id.clone(),
        content: "hi".into(),
        nonce: nonce.clone(),
    };
    send(&mut alice, &frame).await;

    let ServerFrame::NewMessage { message, .. } = next_non_presence(&mut bob).await else {
        panic!("bob expected new_message");
    };
    assert_eq!(message.content, "hi");
    assert_eq!(message.nonce, Some(nonce.clone()));
    let ServerFrame::NewMessage { message: echoed, .. } = next_non_presence(&mut alice).await
    else {
        panic!("alice expected her echo");
    };
    assert_eq!(echoed.id, message.id);

    // Replay answers the sender only.
    send(&mut alice, &frame).await;
    let ServerFrame::NewMessage { message: replay, .. } = next_non_presence(&mut alice).await
    else {
        panic!("alice expected replay");
    };
    assert_eq!(replay.id, message.id);
    send(&mut bob, &ClientFrame::Ping).await;
    assert_eq!(next_non_presence(&mut bob).await, ServerFrame::Pong);

    send(
        &mut bob,
        &ClientFrame::MarkMessageRead {
            message_id: message.id.clone(),
            conversation_id: conversation_id.clone(),
        },
    )
    .await;
    match next_non_presence(&mut alice).await {
        ServerFrame::MessageRead {
            message_id,
            user_id,
            ..
        } => {
            assert_eq!(message_id, message.id);
            assert_eq!(user_id, UserId::new("bob"));
        }
        other => panic!("expected message_read, got {other:?}"),
    }
}

#[tokio::test]
async fn typing_and_presence_reach_peers() {
    let state = test_state().await;
    let app = build_router(state.clone());
    let record = open_direct_via_http(&app, &token_for(&state, "alice"), "bob").await;
    let conversation_id: ConversationId = record.conversation.id;
    let url = spawn_server(state.clone()).await;

    let mut alice = connect_as(&url, &state, "alice").await;
    let mut bob = connect_as(&url, &state, "bob").await;

    match next_frame(&mut alice).await {
        ServerFrame::UserOnline { user_id, username } => {
            assert_eq!(user_id, UserId::new("bob"));
            assert_eq!(username, "BOB");
        }
        other => panic!("expected user_online, got {other:?}"),
    }
    match next_frame(&mut bob).await {
        ServerFrame::UserOnline { user_id, .. } => assert_eq!(user_id, UserId::new("alice")),
        other => panic!("expected presence snapshot, got {other:?}"),
    }

    for socket in [&mut alice, &mut bob] {
        send(
            socket,
            &ClientFrame::JoinChat {
                conversation_id: conversation_id.clone(),
            },
        )
        .await;
        send(socket, &ClientFrame::Ping).await;
        assert_eq!(next_frame(socket).await, ServerFrame::Pong);
    }

    send(
        &mut bob,
        &ClientFrame::TypingStart {
            conversation_id: conversation_id.clone(),
        },
    )
    .await;
    assert!(matches!(
        next_frame(&mut alice).await,
        ServerFrame::UserTyping { .. }
    ));

    bob.close(None).await.expect("close");
    assert!(matches!(
        next_frame(&mut alice).await,
        ServerFrame::UserStoppedTyping { .. }
    ));
    match next_frame(&mut alice).await {
        ServerFrame::UserOffline { user_id, .. } => assert_eq!(user_id, UserId::new("bob")),
        other => panic!("expected user_offline, got {other:?}"),
    }
}

#[tokio::test]
async fn removed_member_stops_receiving_room_traffic() {
    let state = test_state().await;
    let app = build_router(state.clone());
    let alice_token = token_for(&state, "alice");

    let request = Request::post("/conversations/group")
        .header(header::AUTHORIZATION, format!("Bearer {alice_token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "name": "crew", "members": ["bob", "carol"] }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let group: ConversationRecord = serde_json::from_slice(&bytes).expect("json");
    let conversation_id = group.conversation.id;
    let url = spawn_server(state.clone()).await;

    let mut alice = connect_as(&url, &state, "alice").await;
    let mut carol = connect_as(&url, &state, "carol").await;
    for socket in [&mut alice, &mut carol] {
        send(
            socket,
            &ClientFrame::JoinChat {
                conversation_id: conversation_id.clone(),
            },
        )
        .await;
        send(socket, &ClientFrame::Ping).await;
        assert_eq!(next_non_presence(socket).await, ServerFrame::Pong);
    }

    let request = Request::delete(format!("/conversations/{conversation_id}/participants/carol"))
        .header(header::AUTHORIZATION, format!("Bearer {alice_token}"))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    send(
        &mut alice,
        &ClientFrame::SendMessage {
            conversation_id: conversation_id.clone(),
            content: "secret".into(),
            nonce: Nonce::generate(),
        },
    )
    .await;
    let ServerFrame::NewMessage { message, .. } = next_non_presence(&mut alice).await else {
        panic!("alice expected her echo");
    };
    assert_eq!(message.content, "secret");
    tokio::time::sleep(Duration::from_millis(100)).await;

    send(&mut carol, &ClientFrame::Ping).await;
    assert_eq!(next_non_presence(&mut carol).await, ServerFrame::Pong);

    send(
        &mut carol,
        &ClientFrame::JoinChat {
            conversation_id: conversation_id.clone(),
        },
    )
    .await;
    match next_non_presence(&mut carol).await {
        ServerFrame::Error(err) => assert_eq!(err.code, shared::error::ErrorCode::Forbidden),
        other => panic!("expected error, got {other:?}"),
    }
}
