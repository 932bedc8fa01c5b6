use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use shared::{
    domain::{ConversationId, UserId, UserProfile},
    protocol::ServerFrame,
};
use tokio::sync::broadcast;
use tracing::debug;

pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Connections that joined the room.
    Room {
        conversation_id: ConversationId,
        except: Option<ConnectionId>,
    },
    Everyone {
        except: Option<ConnectionId>,
    },
}

impl Audience {
    pub fn room(conversation_id: ConversationId) -> Self {
        Audience::Room {
            conversation_id,
            except: None,
        }
    }

    pub fn includes(
        &self,
        connection: ConnectionId,
        joined: impl Fn(&ConversationId) -> bool,
    ) -> bool {
        match self {
            Audience::Room {
                conversation_id,
                except,
            } => *except != Some(connection) && joined(conversation_id),
            Audience::Everyone { except } => *except != Some(connection),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fanout {
    pub audience: Audience,
    pub frame: ServerFrame,
}

#[derive(Debug, Clone)]
pub enum HubEvent {
    Fanout(Fanout),
    /// The user left the conversation; their sockets drop the room.
    Evicted {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

#[derive(Debug)]
struct OnlineEntry {
    username: String,
    connections: usize,
}

/// Room fan-out plus the connection-counted presence registry.
pub struct Hub {
    events: broadcast::Sender<HubEvent>,
    next_connection: AtomicU64,
    online: Mutex<HashMap<UserId, OnlineEntry>>,
}

pub struct Registration {
    pub connection: ConnectionId,
    pub events: broadcast::Receiver<HubEvent>,
    pub first_connection: bool,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            events,
            next_connection: AtomicU64::new(1),
            online: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, profile: &UserProfile) -> Registration {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let events = self.events.subscribe();
        let mut online = self.online.lock().unwrap_or_else(|p| p.into_inner());
        let entry = online
            .entry(profile.id.clone())
            .or_insert_with(|| OnlineEntry {
                username: profile.display_name.clone(),
                connections: 0,
            });
        entry.connections += 1;
        entry.username = profile.display_name.clone();
        debug!(user_id = %profile.id, connection, count = entry.connections, "connection registered");
        Registration {
            connection,
            events,
            first_connection: entry.connections == 1,
        }
    }

    /// Returns true when this was the user's last live connection.
    pub fn unregister(&self, user_id: &UserId) -> bool {
        let mut online = self.online.lock().unwrap_or_else(|p| p.into_inner());
        let Some(entry) = online.get_mut(user_id) else {
            return false;
        };
        entry.connections = entry.connections.saturating_sub(1);
        if entry.connections == 0 {
            online.remove(user_id);
            return true;
        }
        false
    }

    pub fn online_users(&self) -> Vec<UserProfile> {
        let online = self.online.lock().unwrap_or_else(|p| p.into_inner());
        let mut users: Vec<_> = online
            .iter()
            .map(|(id, entry)| UserProfile {
                id: id.clone(),
                display_name: entry.username.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    pub fn publish(&self, audience: Audience, frame: ServerFrame) {
        // No receivers is fine.
        let _ = self.events.send(HubEvent::Fanout(Fanout { audience, frame }));
    }

    /// Published before any later fan-out, so a removed member sees nothing
    /// sent after the removal.
    pub fn evict(&self, conversation_id: ConversationId, user_id: UserId) {
        debug!(%conversation_id, %user_id, "evicting from room");
        let _ = self.events.send(HubEvent::Evicted {
            conversation_id,
            user_id,
        });
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
