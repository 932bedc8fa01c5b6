use std::{collections::HashSet, sync::Arc};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures::{stream::SplitStream, SinkExt, StreamExt};
use server_api::auth::verify_token;
use shared::{
    domain::{ConversationId, UserProfile},
    error::{ApiError, ErrorCode},
    protocol::{ClientFrame, ServerFrame},
};
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    app_state::AppState,
    hub::{Audience, ConnectionId, Fanout, HubEvent},
};

const OUTBOUND_BUFFER: usize = 64;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

/// Per-socket state after authentication.
struct Connection {
    id: ConnectionId,
    user: UserProfile,
    joined: HashSet<ConversationId>,
    typing: HashSet<ConversationId>,
    outbound: mpsc::Sender<ServerFrame>,
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let user = match authenticate(&state, &mut receiver).await {
        Ok(user) => user,
        Err(message) => {
            debug!(%message, "socket failed authentication");
            let _ = outbound
                .send(ServerFrame::AuthenticationError { message })
                .await;
            drop(outbound);
            let _ = send_task.await;
            return;
        }
    };

    if let Err(err) = server_api::register_user(&state.api, &user).await {
        warn!(user_id = %user.id, error = %err.message, "failed to record user profile");
    }

    let mut registration = state.hub.register(&user);
    let mut conn = Connection {
        id: registration.connection,
        user,
        joined: HashSet::new(),
        typing: HashSet::new(),
        outbound,
    };
    info!(user_id = %conn.user.id, connection = conn.id, "socket authenticated");

    conn.push(ServerFrame::Authenticated {
        user: conn.user.clone(),
    })
    .await;
    for peer in state.hub.online_users() {
        if peer.id != conn.user.id {
            conn.push(ServerFrame::UserOnline {
                user_id: peer.id,
                username: peer.display_name,
            })
            .await;
        }
    }
    if registration.first_connection {
        state.hub.publish(
            Audience::Everyone {
                except: Some(conn.id),
            },
            ServerFrame::UserOnline {
                user_id: conn.user.id.clone(),
                username: conn.user.display_name.clone(),
            },
        );
    }

    let idle = tokio::time::sleep(state.limits.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let Some(Ok(msg)) = incoming else { break };
                idle.as_mut().reset(Instant::now() + state.limits.idle_timeout);
                match msg {
                    WsMessage::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => conn.handle(&state, frame).await,
                        Err(error) => {
                            debug!(connection = conn.id, %error, "unparseable client frame");
                            conn.push(ServerFrame::Error(ApiError::new(
                                ErrorCode::Validation,
                                "malformed frame",
                            )))
                            .await;
                        }
                    },
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            event = registration.events.recv() => match event {
                Ok(HubEvent::Fanout(Fanout { audience, frame })) => {
                    if audience.includes(conn.id, |c| conn.joined.contains(c)) {
                        conn.push(frame).await;
                    }
                }
                Ok(HubEvent::Evicted { conversation_id, user_id }) => {
                    if user_id == conn.user.id {
                        conn.leave(&state, &conversation_id);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(connection = conn.id, skipped, "fan-out receiver lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut idle => {
                info!(user_id = %conn.user.id, connection = conn.id, "closing idle socket");
                break;
            }
        }
    }

    conn.disconnect(&state);
    drop(conn);
    let _ = send_task.await;
}

/// Waits for the first frame, which must be `authenticate`.
async fn authenticate(
    state: &AppState,
    receiver: &mut SplitStream<WebSocket>,
) -> Result<UserProfile, String> {
    let first = timeout(state.limits.auth_timeout, async {
        loop {
            match receiver.next().await {
                Some(Ok(WsMessage::Text(text))) => return Some(text),
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .map_err(|_| "authentication timed out".to_string())?
    .ok_or_else(|| "socket closed before authentication".to_string())?;

    match serde_json::from_str::<ClientFrame>(&first) {
        Ok(ClientFrame::Authenticate { credential }) => {
            verify_token(&state.api.auth, &credential).map_err(|e| e.message)
        }
        Ok(other) => Err(format!("expected authenticate, got {}", other.name())),
        Err(_) => Err("malformed frame".into()),
    }
}

impl Connection {
    async fn push(&self, frame: ServerFrame) {
        if self.outbound.send(frame).await.is_err() {
            debug!(connection = self.id, "outbound queue closed");
        }
    }

    async fn handle(&mut self, state: &AppState, frame: ClientFrame) {
        match frame {
            ClientFrame::Authenticate { .. } => {
                self.push(ServerFrame::Error(ApiError::new(
                    ErrorCode::Conflict,
                    "already authenticated",
                )))
                .await;
            }
            ClientFrame::JoinChat { conversation_id } => {
                match server_api::ensure_participant(&state.api, &conversation_id, &self.user.id)
                    .await
                {
                    Ok(_) => {
                        debug!(connection = self.id, %conversation_id, "joined room");
                        self.joined.insert(conversation_id);
                    }
                    Err(err) => self.push(ServerFrame::Error(err)).await,
                }
            }
            ClientFrame::LeaveChat { conversation_id } => self.leave(state, &conversation_id),
            ClientFrame::SendMessage {
                conversation_id,
                content,
                nonce,
            } => {
                match server_api::send_message(
                    &state.api,
                    &self.user.id,
                    &conversation_id,
                    &content,
                    &nonce,
                )
                .await
                {
                    Ok(outcome) => {
                        self.stop_typing(state, &conversation_id);
                        // A replayed nonce is answered to the sender only.
                        if outcome.fresh {
                            state
                                .hub
                                .publish(Audience::room(conversation_id.clone()), outcome.frame());
                        }
                        if !outcome.fresh || !self.joined.contains(&conversation_id) {
                            self.push(outcome.frame()).await;
                        }
                    }
                    Err(err) => self.push(ServerFrame::Error(err)).await,
                }
            }
            ClientFrame::MarkMessageRead {
                message_id,
                conversation_id,
            } => {
                match server_api::mark_read(
                    &state.api,
                    &self.user.id,
                    &conversation_id,
                    &message_id,
                    Utc::now(),
                )
                .await
                {
                    Ok(Some(frame)) => state.hub.publish(Audience::room(conversation_id), frame),
                    Ok(None) => {}
                    Err(err) => self.push(ServerFrame::Error(err)).await,
                }
            }
            ClientFrame::TypingStart { conversation_id } => {
                if !self.joined.contains(&conversation_id) {
                    return;
                }
                self.typing.insert(conversation_id.clone());
                state.hub.publish(
                    Audience::Room {
                        conversation_id: conversation_id.clone(),
                        except: Some(self.id),
                    },
                    ServerFrame::UserTyping {
                        user_id: self.user.id.clone(),
                        username: self.user.display_name.clone(),
                        conversation_id,
                    },
                );
            }
            ClientFrame::TypingStop { conversation_id } => {
                self.stop_typing(state, &conversation_id);
            }
            ClientFrame::Ping => self.push(ServerFrame::Pong).await,
        }
    }

    fn leave(&mut self, state: &AppState, conversation_id: &ConversationId) {
        self.stop_typing(state, conversation_id);
        if self.joined.remove(conversation_id) {
            debug!(connection = self.id, %conversation_id, "left room");
        }
    }

    fn stop_typing(&mut self, state: &AppState, conversation_id: &ConversationId) {
        if !self.typing.remove(conversation_id) {
            return;
        }
        state.hub.publish(
            Audience::Room {
                conversation_id: conversation_id.clone(),
                except: Some(self.id),
            },
            ServerFrame::UserStoppedTyping {
                user_id: self.user.id.clone(),
                username: self.user.display_name.clone(),
                conversation_id: conversation_id.clone(),
            },
        );
    }

    fn disconnect(&mut self, state: &AppState) {
        let typing: Vec<_> = self.typing.iter().cloned().collect();
        for conversation_id in typing {
            self.stop_typing(state, &conversation_id);
        }
        if state.hub.unregister(&self.user.id) {
            state.hub.publish(
                Audience::Everyone {
                    except: Some(self.id),
                },
                ServerFrame::UserOffline {
                    user_id: self.user.id.clone(),
                    username: self.user.display_name.clone(),
                },
            );
        }
        info!(user_id = %self.user.id, connection = self.id, "socket closed");
    }
}
