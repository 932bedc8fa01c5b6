//! Ordered conversation list with unread counters and display names.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    conversation::{list_for_user, Conversation, ConversationKind, ListFilter},
    domain::{ConversationId, Message, UserId, UserProfile},
    protocol::ConversationRecord,
};
use tracing::debug;

use crate::error::ChatError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub participants: Vec<UserProfile>,
    pub display_name: String,
    pub last_message: Option<Message>,
    pub unread: u32,
}

impl ConversationSummary {
    pub fn id(&self) -> &ConversationId {
        &self.conversation.id
    }

    pub fn preview(&self) -> Option<&str> {
        self.last_message.as_ref().map(|m| m.content.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListUpdate {
    /// The conversation is not in the list; the caller should reload it.
    Unknown,
    Updated { incremented: bool },
}

pub struct ConversationList {
    local_user: UserId,
    /// Kept sorted by last activity, newest first.
    entries: Vec<ConversationSummary>,
    open: Option<ConversationId>,
}

impl ConversationList {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            entries: Vec::new(),
            open: None,
        }
    }

    /// Replaces the list with a fresh store listing. Counters seed from the
    /// store, except the open conversation which stays at zero.
    pub fn replace_all(&mut self, records: Vec<ConversationRecord>) {
        self.entries = records
            .into_iter()
            .map(|record| self.summarize(record))
            .collect();
        self.sort();
    }

    pub fn upsert(&mut self, record: ConversationRecord) {
        let summary = self.summarize(record);
        match self.position(summary.id()) {
            Some(index) => self.entries[index] = summary,
            None => self.entries.push(summary),
        }
        self.sort();
    }

    pub fn remove(&mut self, conversation_id: &ConversationId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id() != conversation_id);
        if self.open.as_ref() == Some(conversation_id) {
            self.open = None;
        }
        self.entries.len() != before
    }

    /// Inbound confirmed message: refreshes the preview, bumps the counter
    /// when the message is from someone else and the conversation is not
    /// open, and reorders.
    pub fn apply_message(&mut self, message: &Message) -> ListUpdate {
        let Some(index) = self.position(&message.conversation_id) else {
            debug!(conversation_id = %message.conversation_id, "message for unknown conversation");
            return ListUpdate::Unknown;
        };
        let is_open = self.open.as_ref() == Some(&message.conversation_id);
        let entry = &mut self.entries[index];
        let newer = entry
            .last_message
            .as_ref()
            .map_or(true, |last| last.timestamp <= message.timestamp);
        if newer {
            entry.last_message = Some(message.clone());
            entry.conversation.last_message_id = Some(message.id.clone());
        }
        if message.timestamp > entry.conversation.last_activity {
            entry.conversation.last_activity = message.timestamp;
        }
        let incremented = !is_open && message.sender_id != self.local_user;
        if incremented {
            entry.unread += 1;
        }
        self.sort();
        ListUpdate::Updated { incremented }
    }

    /// Marks the conversation open and zeroes its counter.
    pub fn open(&mut self, conversation_id: &ConversationId) -> Result<(), ChatError> {
        let index = self
            .position(conversation_id)
            .ok_or_else(|| ChatError::InvalidConversationReference(conversation_id.clone()))?;
        self.entries[index].unread = 0;
        self.open = Some(conversation_id.clone());
        Ok(())
    }

    pub fn close(&mut self) -> Option<ConversationId> {
        self.open.take()
    }

    pub fn open_conversation(&self) -> Option<&ConversationId> {
        self.open.as_ref()
    }

    pub fn unread(&self, conversation_id: &ConversationId) -> u32 {
        self.get(conversation_id).map_or(0, |e| e.unread)
    }

    pub fn total_unread(&self) -> u32 {
        self.entries.iter().map(|e| e.unread).sum()
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.position(conversation_id).is_some()
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<&ConversationSummary> {
        self.entries.iter().find(|e| e.id() == conversation_id)
    }

    pub fn is_participant(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        self.get(conversation_id)
            .is_some_and(|e| e.conversation.is_participant(user_id))
    }

    pub fn ids(&self) -> impl Iterator<Item = &ConversationId> {
        self.entries.iter().map(ConversationSummary::id)
    }

    pub fn summaries(&self) -> &[ConversationSummary] {
        &self.entries
    }

    /// Case-insensitive substring match on display name or preview text.
    pub fn search(&self, query: &str) -> Vec<&ConversationSummary> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.entries.iter().collect();
        }
        self.entries
            .iter()
            .filter(|e| {
                e.display_name.to_lowercase().contains(&needle)
                    || e.preview()
                        .is_some_and(|text| text.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Overlay filter from the local user's point of view.
    pub fn filter(&self, filter: &ListFilter, now: DateTime<Utc>) -> Vec<&ConversationSummary> {
        list_for_user(
            self.entries.iter().map(|e| &e.conversation),
            &self.local_user,
            filter,
            now,
        )
        .into_iter()
        .filter_map(|conversation| self.get(&conversation.id))
        .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.open = None;
    }

    fn summarize(&self, record: ConversationRecord) -> ConversationSummary {
        let ConversationRecord {
            conversation,
            participants,
            unread_count,
            last_message,
        } = record;
        let unread = if self.open.as_ref() == Some(&conversation.id) {
            0
        } else {
            unread_count
        };
        ConversationSummary {
            display_name: display_name(&conversation, &participants, &self.local_user),
            conversation,
            participants,
            last_message,
            unread,
        }
    }

    fn position(&self, conversation_id: &ConversationId) -> Option<usize> {
        self.entries.iter().position(|e| e.id() == conversation_id)
    }

    fn sort(&mut self) {
        self.entries.sort_by(|a, b| {
            b.conversation
                .last_activity
                .cmp(&a.conversation.last_activity)
                .then_with(|| a.id().cmp(b.id()))
        });
    }
}

/// Group name for groups. For direct chats the local user's nickname for
/// the conversation wins, then the peer's display name, then the peer id.
pub fn display_name(
    conversation: &Conversation,
    participants: &[UserProfile],
    local_user: &UserId,
) -> String {
    if let Some(group) = &conversation.group {
        return group.name.clone();
    }
    if let Some(nickname) = conversation
        .overlay(local_user)
        .and_then(|state| state.nickname.as_deref())
        .filter(|n| !n.trim().is_empty())
    {
        return nickname.to_string();
    }
    match conversation.kind {
        ConversationKind::Direct => {
            let Some(peer) = conversation.peer_of(local_user) else {
                return conversation.id.to_string();
            };
            participants
                .iter()
                .find(|p| &p.id == peer)
                .map(|p| p.display_name.clone())
                .unwrap_or_else(|| peer.to_string())
        }
        ConversationKind::Group => conversation.id.to_string(),
    }
}

#[cfg(test)]
#[path = "tests/conversation_list_tests.rs"]
mod tests;
