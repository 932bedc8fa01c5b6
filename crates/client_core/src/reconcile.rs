//! Per-conversation message sequences merging optimistic sends with
//! server-confirmed messages.
//!
//! A confirmed message is matched against local entries in this order:
//! exact nonce echo, then the same sender and content inside the match
//! window (earliest inserted wins), then duplicate suppression by id or by
//! sender and content inside the duplicate window. Anything left is appended.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{ConversationId, Message, MessageId, Nonce, TempId, UserId},
    protocol::ClientFrame,
};
use tracing::debug;

use crate::error::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Pending,
    Failed,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadEntry {
    /// Set for entries that started as optimistic sends.
    pub temp_id: Option<TempId>,
    pub nonce: Option<Nonce>,
    pub message: Message,
    pub delivery: Delivery,
    /// When the entry was last handed to the transport.
    pub sent_at: DateTime<Utc>,
    pub resent: bool,
    seq: u64,
}

impl ThreadEntry {
    pub fn is_unconfirmed(&self) -> bool {
        self.delivery != Delivery::Confirmed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A local entry was confirmed in place.
    Replaced { index: usize, temp_id: Option<TempId> },
    Appended { index: usize },
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSend {
    pub temp_id: TempId,
    pub frame: ClientFrame,
}

pub struct Reconciler {
    local_user: UserId,
    match_window: Duration,
    duplicate_window: Duration,
    threads: HashMap<ConversationId, Vec<ThreadEntry>>,
    drafts: HashMap<ConversationId, String>,
    next_seq: u64,
}

impl Reconciler {
    pub fn new(
        local_user: UserId,
        match_window: std::time::Duration,
        duplicate_window: std::time::Duration,
    ) -> Self {
        Self {
            local_user,
            match_window: to_chrono(match_window),
            duplicate_window: to_chrono(duplicate_window),
            threads: HashMap::new(),
            drafts: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn thread(&self, conversation_id: &ConversationId) -> &[ThreadEntry] {
        self.threads
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.threads
            .values()
            .flatten()
            .filter(|e| e.delivery == Delivery::Pending)
            .count()
    }

    /// Inserts an unconfirmed entry at the tail and returns the wire frame.
    pub fn stage_send(
        &mut self,
        conversation_id: &ConversationId,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<StagedSend, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let temp_id = TempId::generate();
        let nonce = Nonce::generate();
        let seq = self.bump_seq();
        let entry = ThreadEntry {
            temp_id: Some(temp_id.clone()),
            nonce: Some(nonce.clone()),
            message: Message {
                id: MessageId::new(format!("local-{temp_id}")),
                conversation_id: conversation_id.clone(),
                sender_id: self.local_user.clone(),
                content: content.to_string(),
                timestamp: now,
                read_by: Vec::new(),
                nonce: Some(nonce.clone()),
            },
            delivery: Delivery::Pending,
            sent_at: now,
            resent: false,
            seq,
        };
        self.threads
            .entry(conversation_id.clone())
            .or_default()
            .push(entry);
        Ok(StagedSend {
            temp_id,
            frame: ClientFrame::SendMessage {
                conversation_id: conversation_id.clone(),
                content: content.to_string(),
                nonce,
            },
        })
    }

    /// The transport refused the frame. The entry stays visible as failed and
    /// its content is restored as a draft.
    pub fn mark_send_failed(
        &mut self,
        conversation_id: &ConversationId,
        temp_id: &TempId,
    ) -> bool {
        let Some(entry) = self.find_local_mut(conversation_id, temp_id) else {
            return false;
        };
        if entry.delivery == Delivery::Confirmed {
            return false;
        }
        entry.delivery = Delivery::Failed;
        let content = entry.message.content.clone();
        self.drafts.insert(conversation_id.clone(), content);
        true
    }

    pub fn take_restored_draft(&mut self, conversation_id: &ConversationId) -> Option<String> {
        self.drafts.remove(conversation_id)
    }

    pub fn apply_confirmed(&mut self, message: Message) -> ApplyOutcome {
        let conversation_id = message.conversation_id.clone();
        let match_window = self.match_window;
        let duplicate_window = self.duplicate_window;
        let thread = self.threads.entry(conversation_id.clone()).or_default();

        if thread
            .iter()
            .any(|e| e.delivery == Delivery::Confirmed && e.message.id == message.id)
        {
            return ApplyOutcome::Duplicate;
        }

        let by_nonce = message.nonce.as_ref().and_then(|nonce| {
            thread
                .iter()
                .position(|e| e.is_unconfirmed() && e.nonce.as_ref() == Some(nonce))
        });
        let by_window = || {
            thread
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    e.is_unconfirmed()
                        && e.message.sender_id == message.sender_id
                        && e.message.content == message.content
                        && within(e.message.timestamp, message.timestamp, match_window)
                })
                .min_by_key(|(_, e)| e.seq)
                .map(|(index, _)| index)
        };

        if let Some(index) = by_nonce.or_else(by_window) {
            let entry = &mut thread[index];
            entry.message = message;
            entry.delivery = Delivery::Confirmed;
            let temp_id = entry.temp_id.clone();
            debug!(%conversation_id, index, "confirmed optimistic message in place");
            return ApplyOutcome::Replaced { index, temp_id };
        }

        let network_duplicate = thread.iter().any(|e| {
            e.delivery == Delivery::Confirmed
                && e.message.sender_id == message.sender_id
                && e.message.content == message.content
                && within(e.message.timestamp, message.timestamp, duplicate_window)
        });
        if network_duplicate {
            debug!(%conversation_id, message_id = %message.id, "dropping network duplicate");
            return ApplyOutcome::Duplicate;
        }

        let timestamp = message.timestamp;
        let nonce = message.nonce.clone();
        self.next_seq += 1;
        let seq = self.next_seq;
        thread.push(ThreadEntry {
            temp_id: None,
            nonce,
            message,
            delivery: Delivery::Confirmed,
            sent_at: timestamp,
            resent: false,
            seq,
        });
        ApplyOutcome::Appended {
            index: thread.len() - 1,
        }
    }

    /// Forced reload: the page becomes the confirmed history. Confirmed
    /// entries newer than the page arrived live after the fetch and are kept,
    /// as are unconfirmed local entries the page does not account for.
    pub fn load_history(&mut self, conversation_id: &ConversationId, page: Vec<Message>) {
        let previous = self.threads.remove(conversation_id).unwrap_or_default();
        let mut thread: Vec<ThreadEntry> = Vec::with_capacity(page.len() + previous.len());
        for message in page {
            if thread.iter().any(|e| e.message.id == message.id) {
                continue;
            }
            self.next_seq += 1;
            thread.push(ThreadEntry {
                temp_id: None,
                nonce: message.nonce.clone(),
                sent_at: message.timestamp,
                message,
                delivery: Delivery::Confirmed,
                resent: false,
                seq: self.next_seq,
            });
        }

        let newest = thread.last().map(|e| e.message.timestamp);
        let (confirmed, unconfirmed): (Vec<_>, Vec<_>) = previous
            .into_iter()
            .partition(|e| e.delivery == Delivery::Confirmed);
        for entry in confirmed {
            let live = newest.map_or(true, |newest| entry.message.timestamp > newest);
            if live && !thread.iter().any(|e| e.message.id == entry.message.id) {
                thread.push(entry);
            }
        }

        for local in unconfirmed {
            let confirmed = thread.iter_mut().find(|e| {
                e.temp_id.is_none()
                    && ((local.nonce.is_some() && e.nonce == local.nonce)
                        || (e.message.sender_id == local.message.sender_id
                            && e.message.content == local.message.content
                            && within(
                                e.message.timestamp,
                                local.message.timestamp,
                                self.match_window,
                            )))
            });
            match confirmed {
                Some(entry) => entry.temp_id = local.temp_id,
                None => thread.push(local),
            }
        }
        self.threads.insert(conversation_id.clone(), thread);
    }

    /// Older page prepended ahead of what is loaded; known ids are skipped.
    pub fn prepend_history(
        &mut self,
        conversation_id: &ConversationId,
        page: Vec<Message>,
    ) -> usize {
        let thread = self.threads.entry(conversation_id.clone()).or_default();
        let mut older = Vec::new();
        for message in page {
            if thread.iter().any(|e| e.message.id == message.id)
                || older.iter().any(|e: &ThreadEntry| e.message.id == message.id)
            {
                continue;
            }
            self.next_seq += 1;
            older.push(ThreadEntry {
                temp_id: None,
                nonce: message.nonce.clone(),
                sent_at: message.timestamp,
                message,
                delivery: Delivery::Confirmed,
                resent: false,
                seq: self.next_seq,
            });
        }
        let added = older.len();
        older.append(thread);
        *thread = older;
        added
    }

    pub fn oldest_confirmed(&self, conversation_id: &ConversationId) -> Option<&MessageId> {
        self.thread(conversation_id)
            .iter()
            .find(|e| e.delivery == Delivery::Confirmed)
            .map(|e| &e.message.id)
    }

    /// Local read marker. Returns false when `reader` was already recorded.
    pub fn mark_read(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        reader: &UserId,
        at: DateTime<Utc>,
    ) -> Result<bool, ChatError> {
        let entry = self
            .threads
            .get_mut(conversation_id)
            .and_then(|thread| {
                thread
                    .iter_mut()
                    .find(|e| e.delivery == Delivery::Confirmed && &e.message.id == message_id)
            })
            .ok_or_else(|| ChatError::UnknownMessage(message_id.to_string()))?;
        Ok(entry.message.record_read(reader, at))
    }

    /// Inbound receipt. Unknown messages are ignored.
    pub fn apply_read_receipt(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        reader: &UserId,
        at: DateTime<Utc>,
    ) -> bool {
        self.mark_read(conversation_id, message_id, reader, at)
            .unwrap_or(false)
    }

    /// Confirmed messages from others that the local user has not read.
    pub fn unread_from_others(&self, conversation_id: &ConversationId) -> Vec<MessageId> {
        self.thread(conversation_id)
            .iter()
            .filter(|e| {
                e.delivery == Delivery::Confirmed
                    && e.message.sender_id != self.local_user
                    && !e.message.is_read_by(&self.local_user)
            })
            .map(|e| e.message.id.clone())
            .collect()
    }

    /// Re-arms a failed entry with its original nonce.
    pub fn retry_failed(
        &mut self,
        conversation_id: &ConversationId,
        temp_id: &TempId,
        now: DateTime<Utc>,
    ) -> Result<ClientFrame, ChatError> {
        let entry = self
            .find_local_mut(conversation_id, temp_id)
            .filter(|e| e.delivery == Delivery::Failed)
            .ok_or_else(|| ChatError::UnknownMessage(temp_id.to_string()))?;
        entry.delivery = Delivery::Pending;
        entry.resent = false;
        entry.sent_at = now;
        let frame = resend_frame(entry);
        let content = entry.message.content.clone();
        if self.drafts.get(conversation_id) == Some(&content) {
            self.drafts.remove(conversation_id);
        }
        Ok(frame)
    }

    /// Unconfirmed entries last sent at least `grace` ago and not yet resent
    /// are re-armed once. Returns the frames to send.
    pub fn collect_resend(
        &mut self,
        now: DateTime<Utc>,
        grace: std::time::Duration,
    ) -> Vec<ClientFrame> {
        let grace = to_chrono(grace);
        let mut frames = Vec::new();
        for (conversation_id, thread) in self.threads.iter_mut() {
            for entry in thread.iter_mut() {
                if entry.temp_id.is_none()
                    || !entry.is_unconfirmed()
                    || entry.resent
                    || now - entry.sent_at < grace
                {
                    continue;
                }
                if entry.delivery == Delivery::Failed
                    && self.drafts.get(conversation_id) == Some(&entry.message.content)
                {
                    self.drafts.remove(conversation_id);
                }
                entry.delivery = Delivery::Pending;
                entry.resent = true;
                entry.sent_at = now;
                frames.push(resend_frame(entry));
            }
        }
        frames
    }

    /// Resent entries still unconfirmed after `timeout` become failed.
    pub fn sweep_unconfirmed(
        &mut self,
        now: DateTime<Utc>,
        timeout: std::time::Duration,
    ) -> Vec<(ConversationId, TempId)> {
        let timeout = to_chrono(timeout);
        let mut failed = Vec::new();
        for (conversation_id, thread) in self.threads.iter_mut() {
            for entry in thread.iter_mut() {
                if entry.delivery != Delivery::Pending
                    || !entry.resent
                    || now - entry.sent_at < timeout
                {
                    continue;
                }
                entry.delivery = Delivery::Failed;
                if let Some(temp_id) = &entry.temp_id {
                    failed.push((conversation_id.clone(), temp_id.clone()));
                }
            }
        }
        failed
    }

    fn find_local_mut(
        &mut self,
        conversation_id: &ConversationId,
        temp_id: &TempId,
    ) -> Option<&mut ThreadEntry> {
        self.threads
            .get_mut(conversation_id)?
            .iter_mut()
            .find(|e| e.temp_id.as_ref() == Some(temp_id))
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

fn resend_frame(entry: &ThreadEntry) -> ClientFrame {
    ClientFrame::SendMessage {
        conversation_id: entry.message.conversation_id.clone(),
        content: entry.message.content.clone(),
        nonce: entry.nonce.clone().unwrap_or_else(Nonce::generate),
    }
}

fn within(a: DateTime<Utc>, b: DateTime<Utc>, window: Duration) -> bool {
    (a - b).abs() <= window
}

fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or(Duration::MAX)
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
