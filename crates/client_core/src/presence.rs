//! Online users and typing indicators, keyed by user id.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use shared::{
    domain::{ConversationId, UserId, UserProfile},
    protocol::ClientFrame,
};
use tokio::time::Instant;
use tracing::trace;

pub struct PresenceTracker {
    debounce: Duration,
    grace: Duration,
    /// User id to the last username the server reported.
    online: HashMap<UserId, String>,
    /// Remote typers with the instant their indicator lapses.
    typing: HashMap<ConversationId, HashMap<UserId, Instant>>,
    /// Local typing windows: when `typing_stop` is due.
    local: HashMap<ConversationId, Instant>,
}

impl PresenceTracker {
    pub fn new(debounce: Duration, grace: Duration) -> Self {
        Self {
            debounce,
            grace,
            online: HashMap::new(),
            typing: HashMap::new(),
            local: HashMap::new(),
        }
    }

    pub fn user_online(&mut self, user_id: UserId, username: String) -> bool {
        self.online.insert(user_id, username).is_none()
    }

    /// Removes the user and any typing indicator they held. Returns the
    /// conversations whose typing set changed.
    pub fn user_offline(&mut self, user_id: &UserId) -> Vec<ConversationId> {
        self.online.remove(user_id);
        let mut cleared = Vec::new();
        self.typing.retain(|conversation_id, typers| {
            if typers.remove(user_id).is_some() {
                cleared.push(conversation_id.clone());
            }
            !typers.is_empty()
        });
        cleared
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online.contains_key(user_id)
    }

    /// Sorted by user id, carrying the last reported username.
    pub fn online_users(&self) -> Vec<UserProfile> {
        let mut users: Vec<_> = self
            .online
            .iter()
            .map(|(id, username)| UserProfile {
                id: id.clone(),
                display_name: username.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        users
    }

    /// Inbound `user_typing`. The caller reports whether the user takes part
    /// in the conversation; outsiders are ignored. Returns true when the
    /// visible set changed.
    pub fn remote_typing(
        &mut self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        username: &str,
        is_participant: bool,
        now: Instant,
    ) -> bool {
        if !is_participant {
            trace!(%conversation_id, %user_id, "typing from non-participant ignored");
            return false;
        }
        self.online
            .entry(user_id.clone())
            .or_insert_with(|| username.to_string());
        let expires = now + self.debounce + self.grace;
        self.typing
            .entry(conversation_id.clone())
            .or_default()
            .insert(user_id.clone(), expires)
            .is_none()
    }

    pub fn remote_stopped(&mut self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        let Some(typers) = self.typing.get_mut(conversation_id) else {
            return false;
        };
        let removed = typers.remove(user_id).is_some();
        if typers.is_empty() {
            self.typing.remove(conversation_id);
        }
        removed
    }

    /// Drops lapsed indicators. Returns the conversations that changed.
    pub fn expire_remote(&mut self, now: Instant) -> Vec<ConversationId> {
        let mut changed = Vec::new();
        self.typing.retain(|conversation_id, typers| {
            let before = typers.len();
            typers.retain(|_, expires| *expires > now);
            if typers.len() != before {
                changed.push(conversation_id.clone());
            }
            !typers.is_empty()
        });
        changed
    }

    /// Sorted by user id; empty when nobody is typing.
    pub fn typing_users(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        let mut users: Vec<_> = self
            .typing
            .get(conversation_id)
            .map(|typers| typers.keys().cloned().collect())
            .unwrap_or_default();
        users.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        users
    }

    pub fn typing_conversations(&self) -> HashSet<ConversationId> {
        self.typing.keys().cloned().collect()
    }

    /// Local keystroke. Emits `typing_start` only when no window is open and
    /// pushes the automatic stop out by the debounce interval.
    pub fn local_keystroke(
        &mut self,
        conversation_id: &ConversationId,
        now: Instant,
    ) -> Option<ClientFrame> {
        let due = now + self.debounce;
        match self.local.insert(conversation_id.clone(), due) {
            Some(_) => None,
            None => Some(ClientFrame::TypingStart {
                conversation_id: conversation_id.clone(),
            }),
        }
    }

    /// The user sent a message: close the window right away.
    pub fn local_sent(&mut self, conversation_id: &ConversationId) -> Option<ClientFrame> {
        self.local
            .remove(conversation_id)
            .map(|_| ClientFrame::TypingStop {
                conversation_id: conversation_id.clone(),
            })
    }

    /// `typing_stop` frames for windows that went silent.
    pub fn poll_local_expiry(&mut self, now: Instant) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        self.local.retain(|conversation_id, due| {
            if *due <= now {
                frames.push(ClientFrame::TypingStop {
                    conversation_id: conversation_id.clone(),
                });
                false
            } else {
                true
            }
        });
        frames
    }

    /// Connection lost: the server will re-announce presence on reconnect.
    pub fn clear(&mut self) {
        self.online.clear();
        self.typing.clear();
        self.local.clear();
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
