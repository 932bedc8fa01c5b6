//! Connection lifecycle as an explicit state machine.
//!
//! The manager performs no I/O of its own. The session opens transports when
//! told to and feeds the outcome back in; outbound frames go through the
//! sender half of the current transport link.

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use shared::{
    domain::ConversationId,
    protocol::{ClientFrame, ServerFrame, ServerFrameKind},
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    RetryAfter { attempt: u32, delay: Duration },
    /// Retries are spent. Only an explicit reconnect resets the counter.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    PingSent,
    Expired,
}

/// Handlers run on the session's event path and must not block.
pub type EventHandler = Box<dyn FnMut(&ServerFrame) + Send + 'static>;

pub struct ConnectionManager {
    status: ConnectionStatus,
    policy: ReconnectPolicy,
    credential: Option<String>,
    rooms: BTreeSet<ConversationId>,
    attempts: u32,
    generation: u64,
    link: Option<mpsc::Sender<ClientFrame>>,
    handlers: HashMap<ServerFrameKind, Vec<EventHandler>>,
    last_inbound: Option<Instant>,
    last_ping: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            policy,
            credential: None,
            rooms: BTreeSet::new(),
            attempts: 0,
            generation: 0,
            link: None,
            handlers: HashMap::new(),
            last_inbound: None,
            last_ping: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_ready(&self) -> bool {
        self.status == ConnectionStatus::Ready
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rooms(&self) -> impl Iterator<Item = &ConversationId> {
        self.rooms.iter()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Session start. Returns the generation of the transport to open.
    pub fn start(&mut self, credential: impl Into<String>) -> Option<u64> {
        self.credential = Some(credential.into());
        match self.status {
            ConnectionStatus::Disconnected | ConnectionStatus::Degraded => {
                self.attempts = 0;
                Some(self.begin_connect())
            }
            _ => None,
        }
    }

    /// Explicit reconnect request. Resets the retry counter and abandons any
    /// transport in progress.
    pub fn request_reconnect(&mut self) -> Option<u64> {
        self.credential.as_ref()?;
        self.attempts = 0;
        self.link = None;
        Some(self.begin_connect())
    }

    /// Backoff timer fired for the transport generation that dropped.
    pub fn retry_due(&mut self, generation: u64) -> Option<u64> {
        if self.status != ConnectionStatus::Degraded
            || generation != self.generation
            || self.attempts > self.policy.max_attempts
        {
            return None;
        }
        Some(self.begin_connect())
    }

    fn begin_connect(&mut self) -> u64 {
        self.generation += 1;
        self.status = ConnectionStatus::Connecting;
        self.last_inbound = None;
        self.last_ping = None;
        debug!(generation = self.generation, attempt = self.attempts, "connecting");
        self.generation
    }

    /// Transport is up: move to authenticating and send the credential.
    /// Returns false when the link belongs to a stale attempt.
    pub fn transport_established(
        &mut self,
        generation: u64,
        link: mpsc::Sender<ClientFrame>,
        now: Instant,
    ) -> bool {
        if generation != self.generation || self.status != ConnectionStatus::Connecting {
            return false;
        }
        let Some(credential) = self.credential.clone() else {
            return false;
        };
        self.link = Some(link);
        self.status = ConnectionStatus::Authenticating;
        self.last_inbound = Some(now);
        self.emit(ClientFrame::Authenticate { credential })
    }

    /// Credential accepted. Re-joins every known room and returns them.
    pub fn authenticated(&mut self, now: Instant) -> Vec<ConversationId> {
        if self.status != ConnectionStatus::Authenticating {
            return Vec::new();
        }
        self.status = ConnectionStatus::Ready;
        self.attempts = 0;
        self.last_inbound = Some(now);
        self.last_ping = Some(now);
        let rooms: Vec<_> = self.rooms.iter().cloned().collect();
        for conversation_id in &rooms {
            self.emit(ClientFrame::JoinChat {
                conversation_id: conversation_id.clone(),
            });
        }
        info!(rooms = rooms.len(), "connection ready");
        rooms
    }

    /// Unrecoverable rejection. Terminal until the caller starts again.
    pub fn authentication_rejected(&mut self) {
        warn!("credential rejected; staying disconnected");
        self.credential = None;
        self.link = None;
        self.status = ConnectionStatus::Disconnected;
    }

    /// Transport closed or failed to open. Stale generations are ignored.
    pub fn transport_dropped(&mut self, generation: u64) -> Option<ReconnectDecision> {
        let live = matches!(
            self.status,
            ConnectionStatus::Connecting | ConnectionStatus::Authenticating | ConnectionStatus::Ready
        );
        if generation != self.generation || !live {
            return None;
        }
        self.link = None;
        self.status = ConnectionStatus::Degraded;
        self.attempts += 1;
        if self.attempts > self.policy.max_attempts {
            warn!(attempts = self.attempts - 1, "reconnect attempts exhausted");
            return Some(ReconnectDecision::Exhausted);
        }
        let delay = self.policy.delay_for(self.attempts);
        info!(attempt = self.attempts, ?delay, "transport dropped; scheduling reconnect");
        Some(ReconnectDecision::RetryAfter {
            attempt: self.attempts,
            delay,
        })
    }

    pub fn logout(&mut self) {
        self.credential = None;
        self.link = None;
        self.rooms.clear();
        self.attempts = 0;
        self.generation += 1;
        self.status = ConnectionStatus::Disconnected;
    }

    /// Idempotent. Emits `join_chat` only for a new room while ready.
    pub fn subscribe(&mut self, conversation_id: ConversationId) -> bool {
        if !self.rooms.insert(conversation_id.clone()) {
            return false;
        }
        if self.is_ready() {
            self.emit(ClientFrame::JoinChat { conversation_id });
        }
        true
    }

    pub fn unsubscribe(&mut self, conversation_id: &ConversationId) -> bool {
        if !self.rooms.remove(conversation_id) {
            return false;
        }
        if self.is_ready() {
            self.emit(ClientFrame::LeaveChat {
                conversation_id: conversation_id.clone(),
            });
        }
        true
    }

    /// False when not ready or the transport queue refused the frame; the
    /// caller keeps the payload.
    pub fn send(&mut self, frame: ClientFrame) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.emit(frame)
    }

    fn emit(&mut self, frame: ClientFrame) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        match link.try_send(frame) {
            Ok(()) => true,
            Err(err) => {
                debug!(frame = err.into_inner().name(), "transport refused frame");
                false
            }
        }
    }

    pub fn on_event(&mut self, kind: ServerFrameKind, handler: EventHandler) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub fn dispatch(&mut self, frame: &ServerFrame) {
        if let Some(handlers) = self.handlers.get_mut(&frame.kind()) {
            for handler in handlers.iter_mut() {
                handler(frame);
            }
        }
    }

    pub fn note_inbound(&mut self, now: Instant) {
        self.last_inbound = Some(now);
    }

    /// Sends `ping` every `interval` while ready and reports expiry when
    /// nothing arrived within `timeout`.
    pub fn heartbeat(
        &mut self,
        now: Instant,
        interval: Duration,
        timeout: Duration,
    ) -> HeartbeatAction {
        if !matches!(
            self.status,
            ConnectionStatus::Ready | ConnectionStatus::Authenticating
        ) {
            return HeartbeatAction::Idle;
        }
        if let Some(last) = self.last_inbound {
            if now.saturating_duration_since(last) >= timeout {
                return HeartbeatAction::Expired;
            }
        }
        if self.status != ConnectionStatus::Ready {
            return HeartbeatAction::Idle;
        }
        let due = self
            .last_ping
            .map_or(true, |last| now.saturating_duration_since(last) >= interval);
        if due && self.emit(ClientFrame::Ping) {
            self.last_ping = Some(now);
            return HeartbeatAction::PingSent;
        }
        HeartbeatAction::Idle
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
