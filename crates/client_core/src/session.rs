//! The session actor.
//!
//! One task owns the connection manager, the reconciler, the presence
//! tracker and the conversation list. UI intents, transport signals, store
//! replies and timer fires all arrive on a single queue and are handled one
//! at a time; handlers never await. Network work is spawned and reports back
//! through the same queue.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    conversation::{Conversation, GroupSettings, ListFilter},
    domain::{ConversationId, Message, MessageId, TempId, UserId, UserProfile},
    error::MembershipError,
    protocol::{ClientFrame, ConversationRecord, OverlayPatch, ServerFrame, ServerFrameKind},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::SyncSettings,
    connection::{
        ConnectionManager, ConnectionStatus, EventHandler, HeartbeatAction, ReconnectDecision,
    },
    conversation_list::{ConversationList, ConversationSummary, ListUpdate},
    error::ChatError,
    presence::PresenceTracker,
    reconcile::{ApplyOutcome, Reconciler, ThreadEntry},
    store_client::ConversationStore,
    transport::{Transport, TransportLink, TransportSignal},
};

const INBOX_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 1024;

/// Supplied by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub user: UserProfile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StatusChanged(ConnectionStatus),
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Automatic retries are spent; only an explicit reconnect tries again.
    ReconnectExhausted,
    AuthenticationFailed(String),
    ConversationsUpdated,
    ThreadUpdated(ConversationId),
    MessageFailed {
        conversation_id: ConversationId,
        temp_id: TempId,
        restored_draft: Option<String>,
    },
    TypingChanged(ConversationId),
    PresenceChanged(UserId),
    /// Presence was dropped with the connection and will be re-announced.
    PresenceReset,
    Error(ChatError),
}

type Reply<T> = oneshot::Sender<Result<T, ChatError>>;

enum MembershipOp {
    Add(UserId),
    Remove(UserId),
    Grant(UserId),
    Revoke(UserId),
}

impl MembershipOp {
    fn apply(
        &self,
        conversation: &mut Conversation,
        actor: &UserId,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), MembershipError> {
        match self {
            MembershipOp::Add(user) => conversation.add_participant(user, actor, now),
            MembershipOp::Remove(user) => conversation.remove_participant(user, actor, now),
            MembershipOp::Grant(user) => conversation.set_admin(user, actor).map(|_| ()),
            MembershipOp::Revoke(user) => conversation.revoke_admin(user, actor).map(|_| ()),
        }
    }
}

enum Command {
    Connect,
    Reconnect,
    Disconnect,
    Shutdown,
    RefreshConversations,
    Open(ConversationId, Reply<()>),
    Close,
    LoadOlder(ConversationId),
    Send {
        conversation_id: ConversationId,
        content: String,
        reply: Reply<TempId>,
    },
    Retry {
        conversation_id: ConversationId,
        temp_id: TempId,
        reply: Reply<()>,
    },
    MarkRead {
        conversation_id: ConversationId,
        message_id: MessageId,
        reply: Reply<()>,
    },
    Keystroke(ConversationId),
    Subscribe(ConversationId),
    Unsubscribe(ConversationId),
    OpenDirect {
        user_id: UserId,
        reply: Reply<ConversationId>,
    },
    CreateGroup {
        name: String,
        members: Vec<UserId>,
        settings: GroupSettings,
        reply: Reply<ConversationId>,
    },
    Membership {
        conversation_id: ConversationId,
        op: MembershipOp,
        reply: Reply<()>,
    },
    UpdateOverlay {
        conversation_id: ConversationId,
        patch: OverlayPatch,
        reply: Reply<()>,
    },
    Query(Query),
}

enum Query {
    Thread(ConversationId, oneshot::Sender<Vec<ThreadEntry>>),
    Conversations(oneshot::Sender<Vec<ConversationSummary>>),
    Search(String, oneshot::Sender<Vec<ConversationSummary>>),
    Filter(ListFilter, oneshot::Sender<Vec<ConversationSummary>>),
    Status(oneshot::Sender<ConnectionStatus>),
    Typing(ConversationId, oneshot::Sender<Vec<UserId>>),
    Online(oneshot::Sender<Vec<UserProfile>>),
    TotalUnread(oneshot::Sender<u32>),
}

enum StoreUpdate {
    Conversations(Vec<ConversationRecord>),
    History {
        conversation_id: ConversationId,
        page: Vec<Message>,
        older: bool,
    },
    Record(ConversationRecord),
    Removed {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

enum StoreReply {
    None,
    ListReload,
    Done(Reply<()>),
    Opened(Reply<ConversationId>),
}

enum Input {
    Command(Command),
    Connected {
        generation: u64,
        link: Result<TransportLink, String>,
    },
    Transport {
        generation: u64,
        signal: TransportSignal,
    },
    RetryDue(u64),
    Store {
        result: anyhow::Result<StoreUpdate>,
        reply: StoreReply,
    },
    Tick,
}

/// Session configuration. `spawn` starts the actor and hands back the only
/// way to reach it.
pub struct ChatSession {
    credentials: Credentials,
    settings: SyncSettings,
    transport: Arc<dyn Transport>,
    store: Arc<dyn ConversationStore>,
    handlers: Vec<(ServerFrameKind, EventHandler)>,
}

impl ChatSession {
    pub fn new(
        credentials: Credentials,
        settings: SyncSettings,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            credentials,
            settings,
            transport,
            store,
            handlers: Vec::new(),
        }
    }

    /// Raw frame observer, run on the session task before the frame is applied.
    pub fn on_event(mut self, kind: ServerFrameKind, handler: EventHandler) -> Self {
        self.handlers.push((kind, handler));
        self
    }

    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> ChatHandle {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut connection = ConnectionManager::new(self.settings.reconnect);
        for (kind, handler) in self.handlers {
            connection.on_event(kind, handler);
        }
        let me = self.credentials.user;
        let actor = Actor {
            reconciler: Reconciler::new(
                me.id.clone(),
                self.settings.match_window,
                self.settings.duplicate_window,
            ),
            presence: PresenceTracker::new(
                self.settings.typing_debounce,
                self.settings.typing_grace,
            ),
            list: ConversationList::new(me.id.clone()),
            me,
            token: self.credentials.token,
            settings: self.settings,
            transport: self.transport,
            store: self.store,
            connection,
            queued_receipts: HashMap::new(),
            list_loading: false,
            reported_status: ConnectionStatus::Disconnected,
            events: events.clone(),
            inbox: inbox_tx.downgrade(),
        };
        tokio::spawn(actor.run(inbox_rx));

        ChatHandle {
            inbox: inbox_tx,
            events,
        }
    }
}

/// Cloneable front door to a running session. Intents are queued; nothing
/// here touches session state directly.
#[derive(Clone)]
pub struct ChatHandle {
    inbox: mpsc::Sender<Input>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatHandle {
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn notify(&self, command: Command) -> Result<(), ChatError> {
        self.inbox
            .send(Input::Command(command))
            .await
            .map_err(|_| ChatError::SessionClosed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.notify(make(tx)).await?;
        rx.await.map_err(|_| ChatError::SessionClosed)?
    }

    async fn query<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Query,
    ) -> Result<T, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.notify(Command::Query(make(tx))).await?;
        rx.await.map_err(|_| ChatError::SessionClosed)
    }

    /// Opens the persistent channel and loads the conversation list.
    pub async fn connect(&self) -> Result<(), ChatError> {
        self.notify(Command::Connect).await
    }

    /// Explicit reconnect; resets the retry budget.
    pub async fn reconnect(&self) -> Result<(), ChatError> {
        self.notify(Command::Reconnect).await
    }

    pub async fn disconnect(&self) -> Result<(), ChatError> {
        self.notify(Command::Disconnect).await
    }

    pub async fn shutdown(&self) -> Result<(), ChatError> {
        self.notify(Command::Shutdown).await
    }

    pub async fn refresh_conversations(&self) -> Result<(), ChatError> {
        self.notify(Command::RefreshConversations).await
    }

    /// Zeroes the unread counter and force-reloads the history.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<(), ChatError> {
        self.request(|reply| Command::Open(conversation_id, reply))
            .await
    }

    pub async fn close_conversation(&self) -> Result<(), ChatError> {
        self.notify(Command::Close).await
    }

    pub async fn load_older(&self, conversation_id: ConversationId) -> Result<(), ChatError> {
        self.notify(Command::LoadOlder(conversation_id)).await
    }

    /// Returns the temporary id of the optimistic entry.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: impl Into<String>,
    ) -> Result<TempId, ChatError> {
        let content = content.into();
        self.request(|reply| Command::Send {
            conversation_id,
            content,
            reply,
        })
        .await
    }

    pub async fn retry_message(
        &self,
        conversation_id: ConversationId,
        temp_id: TempId,
    ) -> Result<(), ChatError> {
        self.request(|reply| Command::Retry {
            conversation_id,
            temp_id,
            reply,
        })
        .await
    }

    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<(), ChatError> {
        self.request(|reply| Command::MarkRead {
            conversation_id,
            message_id,
            reply,
        })
        .await
    }

    pub async fn keystroke(&self, conversation_id: ConversationId) -> Result<(), ChatError> {
        self.notify(Command::Keystroke(conversation_id)).await
    }

    pub async fn subscribe(&self, conversation_id: ConversationId) -> Result<(), ChatError> {
        self.notify(Command::Subscribe(conversation_id)).await
    }

    pub async fn unsubscribe(&self, conversation_id: ConversationId) -> Result<(), ChatError> {
        self.notify(Command::Unsubscribe(conversation_id)).await
    }

    pub async fn open_direct(&self, user_id: UserId) -> Result<ConversationId, ChatError> {
        self.request(|reply| Command::OpenDirect { user_id, reply })
            .await
    }

    pub async fn create_group(
        &self,
        name: impl Into<String>,
        members: Vec<UserId>,
        settings: GroupSettings,
    ) -> Result<ConversationId, ChatError> {
        let name = name.into();
        self.request(|reply| Command::CreateGroup {
            name,
            members,
            settings,
            reply,
        })
        .await
    }

    pub async fn add_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), ChatError> {
        self.membership(conversation_id, MembershipOp::Add(user_id))
            .await
    }

    pub async fn remove_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), ChatError> {
        self.membership(conversation_id, MembershipOp::Remove(user_id))
            .await
    }

    pub async fn set_admin(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), ChatError> {
        self.membership(conversation_id, MembershipOp::Grant(user_id))
            .await
    }

    pub async fn revoke_admin(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), ChatError> {
        self.membership(conversation_id, MembershipOp::Revoke(user_id))
            .await
    }

    async fn membership(
        &self,
        conversation_id: ConversationId,
        op: MembershipOp,
    ) -> Result<(), ChatError> {
        self.request(|reply| Command::Membership {
            conversation_id,
            op,
            reply,
        })
        .await
    }

    pub async fn update_overlay(
        &self,
        conversation_id: ConversationId,
        patch: OverlayPatch,
    ) -> Result<(), ChatError> {
        self.request(|reply| Command::UpdateOverlay {
            conversation_id,
            patch,
            reply,
        })
        .await
    }

    pub async fn thread(&self, conversation_id: ConversationId) -> Result<Vec<ThreadEntry>, ChatError> {
        self.query(|tx| Query::Thread(conversation_id, tx)).await
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        self.query(Query::Conversations).await
    }

    pub async fn search(&self, query: impl Into<String>) -> Result<Vec<ConversationSummary>, ChatError> {
        let query = query.into();
        self.query(|tx| Query::Search(query, tx)).await
    }

    pub async fn filter(&self, filter: ListFilter) -> Result<Vec<ConversationSummary>, ChatError> {
        self.query(|tx| Query::Filter(filter, tx)).await
    }

    pub async fn status(&self) -> Result<ConnectionStatus, ChatError> {
        self.query(Query::Status).await
    }

    pub async fn typing_users(&self, conversation_id: ConversationId) -> Result<Vec<UserId>, ChatError> {
        self.query(|tx| Query::Typing(conversation_id, tx)).await
    }

    pub async fn online_users(&self) -> Result<Vec<UserProfile>, ChatError> {
        self.query(Query::Online).await
    }

    pub async fn total_unread(&self) -> Result<u32, ChatError> {
        self.query(Query::TotalUnread).await
    }
}

struct Actor {
    me: UserProfile,
    token: String,
    settings: SyncSettings,
    transport: Arc<dyn Transport>,
    store: Arc<dyn ConversationStore>,
    connection: ConnectionManager,
    reconciler: Reconciler,
    presence: PresenceTracker,
    list: ConversationList,
    /// Read receipts recorded while the channel was down.
    queued_receipts: HashMap<ConversationId, Vec<MessageId>>,
    list_loading: bool,
    reported_status: ConnectionStatus,
    events: broadcast::Sender<ClientEvent>,
    inbox: mpsc::WeakSender<Input>,
}

impl Actor {
    async fn run(mut self, mut inbox: mpsc::Receiver<Input>) {
        self.spawn_ticker();
        while let Some(input) = inbox.recv().await {
            let keep_running = self.handle(input);
            self.publish_status();
            if !keep_running {
                break;
            }
        }
        debug!(user_id = %self.me.id, "chat session stopped");
    }

    fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Command(command) => return self.on_command(command),
            Input::Connected { generation, link } => self.on_connected(generation, link),
            Input::Transport { generation, signal } => self.on_transport(generation, signal),
            Input::RetryDue(generation) => {
                if let Some(next) = self.connection.retry_due(generation) {
                    self.open_transport(next);
                }
            }
            Input::Store { result, reply } => self.on_store(result, reply),
            Input::Tick => self.on_tick(),
        }
        true
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn publish_status(&mut self) {
        let status = self.connection.status();
        if status != self.reported_status {
            info!(?status, "connection status changed");
            self.reported_status = status;
            self.emit(ClientEvent::StatusChanged(status));
        }
    }

    /// Runs `work` off the session task and queues its result.
    fn spawn_io<F>(&self, work: F)
    where
        F: Future<Output = Input> + Send + 'static,
    {
        let Some(inbox) = self.inbox.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let input = work.await;
            let _ = inbox.send(input).await;
        });
    }

    fn spawn_ticker(&self) {
        let inbox = self.inbox.clone();
        let period = self.settings.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(tx) = inbox.upgrade() else {
                    break;
                };
                if tx.send(Input::Tick).await.is_err() {
                    break;
                }
            }
        });
    }

    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect => {
                if let Some(generation) = self.connection.start(self.token.clone()) {
                    self.open_transport(generation);
                }
                self.reload_conversations();
            }
            Command::Reconnect => match self.connection.request_reconnect() {
                Some(generation) => {
                    self.presence.clear();
                    self.open_transport(generation);
                }
                None => warn!("reconnect requested without a usable credential"),
            },
            Command::Disconnect => {
                self.connection.logout();
                self.presence.clear();
                self.queued_receipts.clear();
                self.list.clear();
                self.emit(ClientEvent::ConversationsUpdated);
            }
            Command::Shutdown => {
                self.connection.logout();
                return false;
            }
            Command::RefreshConversations => self.reload_conversations(),
            Command::Open(conversation_id, reply) => {
                let _ = reply.send(self.open_conversation(&conversation_id));
            }
            Command::Close => {
                self.list.close();
            }
            Command::LoadOlder(conversation_id) => {
                let older = self.reconciler.oldest_confirmed(&conversation_id).is_some();
                self.load_history(conversation_id, older);
            }
            Command::Send {
                conversation_id,
                content,
                reply,
            } => {
                let _ = reply.send(self.send_message(&conversation_id, &content));
            }
            Command::Retry {
                conversation_id,
                temp_id,
                reply,
            } => {
                let _ = reply.send(self.retry_message(&conversation_id, &temp_id));
            }
            Command::MarkRead {
                conversation_id,
                message_id,
                reply,
            } => {
                let _ = reply.send(self.mark_read(&conversation_id, &message_id));
            }
            Command::Keystroke(conversation_id) => {
                if self.list.contains(&conversation_id) {
                    if let Some(frame) = self
                        .presence
                        .local_keystroke(&conversation_id, Instant::now())
                    {
                        self.connection.send(frame);
                    }
                }
            }
            Command::Subscribe(conversation_id) => {
                self.connection.subscribe(conversation_id);
            }
            Command::Unsubscribe(conversation_id) => {
                self.queued_receipts.remove(&conversation_id);
                self.connection.unsubscribe(&conversation_id);
            }
            Command::OpenDirect { user_id, reply } => self.open_direct(user_id, reply),
            Command::CreateGroup {
                name,
                members,
                settings,
                reply,
            } => self.create_group(name, members, settings, reply),
            Command::Membership {
                conversation_id,
                op,
                reply,
            } => self.change_membership(conversation_id, op, reply),
            Command::UpdateOverlay {
                conversation_id,
                patch,
                reply,
            } => self.update_overlay(conversation_id, patch, reply),
            Command::Query(query) => self.answer(query),
        }
        true
    }

    fn answer(&self, query: Query) {
        match query {
            Query::Thread(conversation_id, tx) => {
                let _ = tx.send(self.reconciler.thread(&conversation_id).to_vec());
            }
            Query::Conversations(tx) => {
                let _ = tx.send(self.list.summaries().to_vec());
            }
            Query::Search(text, tx) => {
                let _ = tx.send(self.list.search(&text).into_iter().cloned().collect());
            }
            Query::Filter(filter, tx) => {
                let _ = tx.send(
                    self.list
                        .filter(&filter, Utc::now())
                        .into_iter()
                        .cloned()
                        .collect(),
                );
            }
            Query::Status(tx) => {
                let _ = tx.send(self.connection.status());
            }
            Query::Typing(conversation_id, tx) => {
                let _ = tx.send(self.presence.typing_users(&conversation_id));
            }
            Query::Online(tx) => {
                let _ = tx.send(self.presence.online_users());
            }
            Query::TotalUnread(tx) => {
                let _ = tx.send(self.list.total_unread());
            }
        }
    }

    fn open_transport(&self, generation: u64) {
        let transport = Arc::clone(&self.transport);
        self.spawn_io(async move {
            let link = transport.connect().await.map_err(|err| format!("{err:#}"));
            Input::Connected { generation, link }
        });
    }

    fn on_connected(&mut self, generation: u64, link: Result<TransportLink, String>) {
        match link {
            Ok(TransportLink { outbound, inbound }) => {
                if self
                    .connection
                    .transport_established(generation, outbound, Instant::now())
                {
                    self.spawn_pump(generation, inbound);
                } else {
                    debug!(generation, "discarding transport for a superseded attempt");
                }
            }
            Err(reason) => {
                warn!(generation, %reason, "transport failed to open");
                self.on_dropped(generation, Some(reason));
            }
        }
    }

    /// Forwards inbound signals tagged with the link's generation. Ends with
    /// exactly one `Closed`.
    fn spawn_pump(&self, generation: u64, mut inbound: mpsc::Receiver<TransportSignal>) {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let mut closed = false;
            while let Some(signal) = inbound.recv().await {
                closed = matches!(signal, TransportSignal::Closed(_));
                let Some(tx) = inbox.upgrade() else {
                    return;
                };
                if tx.send(Input::Transport { generation, signal }).await.is_err() || closed {
                    break;
                }
            }
            if !closed {
                if let Some(tx) = inbox.upgrade() {
                    let signal = TransportSignal::Closed(None);
                    let _ = tx.send(Input::Transport { generation, signal }).await;
                }
            }
        });
    }

    fn on_transport(&mut self, generation: u64, signal: TransportSignal) {
        match signal {
            TransportSignal::Closed(reason) => self.on_dropped(generation, reason),
            TransportSignal::Frame(frame) => {
                if generation != self.connection.generation() {
                    return;
                }
                self.connection.note_inbound(Instant::now());
                self.connection.dispatch(&frame);
                self.on_frame(frame);
            }
        }
    }

    fn on_dropped(&mut self, generation: u64, reason: Option<String>) {
        let Some(decision) = self.connection.transport_dropped(generation) else {
            return;
        };
        self.presence.clear();
        self.emit(ClientEvent::PresenceReset);
        match decision {
            ReconnectDecision::RetryAfter { attempt, delay } => {
                self.emit(ClientEvent::ReconnectScheduled { attempt, delay });
                self.schedule_retry(generation, delay);
            }
            ReconnectDecision::Exhausted => {
                self.emit(ClientEvent::ReconnectExhausted);
                let reason = reason.unwrap_or_else(|| "connection lost".to_string());
                self.emit(ClientEvent::Error(ChatError::TransportDropped(reason)));
            }
        }
    }

    fn schedule_retry(&self, generation: u64, delay: Duration) {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(Input::RetryDue(generation)).await;
            }
        });
    }

    fn on_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Authenticated { user } => {
                if user.id != self.me.id {
                    warn!(expected = %self.me.id, actual = %user.id, "server authenticated a different user");
                    if self.connection.status() == ConnectionStatus::Authenticating {
                        self.connection.authentication_rejected();
                        self.emit(ClientEvent::AuthenticationFailed(format!(
                            "credential belongs to {}, not {}",
                            user.id, self.me.id
                        )));
                    }
                    return;
                }
                let rooms = self.connection.authenticated(Instant::now());
                info!(user_id = %self.me.id, rooms = rooms.len(), "session authenticated");
                self.flush_receipts();
                let now = Utc::now();
                for frame in self
                    .reconciler
                    .collect_resend(now, self.settings.resend_grace)
                {
                    self.connection.send(frame);
                }
                self.reload_conversations();
                if let Some(open) = self.list.open_conversation().cloned() {
                    self.load_history(open, false);
                }
            }
            ServerFrame::AuthenticationError { message } => {
                if self.connection.status() != ConnectionStatus::Authenticating {
                    warn!(%message, "authentication error outside the handshake");
                    return;
                }
                self.connection.authentication_rejected();
                self.emit(ClientEvent::AuthenticationFailed(message));
            }
            ServerFrame::NewMessage {
                conversation_id,
                message,
            } => {
                if message.conversation_id != conversation_id {
                    warn!(%conversation_id, message_id = %message.id, "message routed to the wrong room");
                    return;
                }
                // Unknown rooms are not shown until the list says we belong there.
                if !self.list.contains(&conversation_id) {
                    debug!(%conversation_id, message_id = %message.id, "message for unknown conversation");
                    self.reload_conversations();
                    return;
                }
                if self.reconciler.apply_confirmed(message.clone()) == ApplyOutcome::Duplicate {
                    return;
                }
                if let ListUpdate::Updated { .. } = self.list.apply_message(&message) {
                    self.emit(ClientEvent::ConversationsUpdated);
                }
                self.emit(ClientEvent::ThreadUpdated(conversation_id.clone()));
                if message.sender_id != self.me.id {
                    self.mark_open_thread_read(&conversation_id);
                }
            }
            ServerFrame::MessageRead {
                message_id,
                user_id,
                conversation_id,
                read_at,
            } => {
                if self
                    .reconciler
                    .apply_read_receipt(&conversation_id, &message_id, &user_id, read_at)
                {
                    self.emit(ClientEvent::ThreadUpdated(conversation_id));
                }
            }
            ServerFrame::UserTyping {
                user_id,
                username,
                conversation_id,
            } => {
                if user_id == self.me.id {
                    return;
                }
                let was_online = self.presence.is_online(&user_id);
                let is_participant = self.list.is_participant(&conversation_id, &user_id);
                if self.presence.remote_typing(
                    &conversation_id,
                    &user_id,
                    &username,
                    is_participant,
                    Instant::now(),
                ) {
                    self.emit(ClientEvent::TypingChanged(conversation_id));
                }
                if !was_online && self.presence.is_online(&user_id) {
                    self.emit(ClientEvent::PresenceChanged(user_id));
                }
            }
            ServerFrame::UserStoppedTyping {
                user_id,
                conversation_id,
                ..
            } => {
                if self.presence.remote_stopped(&conversation_id, &user_id) {
                    self.emit(ClientEvent::TypingChanged(conversation_id));
                }
            }
            ServerFrame::UserOnline { user_id, username } => {
                if self.presence.user_online(user_id.clone(), username) {
                    self.emit(ClientEvent::PresenceChanged(user_id));
                }
            }
            ServerFrame::UserOffline { user_id, .. } => {
                let cleared = self.presence.user_offline(&user_id);
                self.emit(ClientEvent::PresenceChanged(user_id));
                for conversation_id in cleared {
                    self.emit(ClientEvent::TypingChanged(conversation_id));
                }
            }
            ServerFrame::Pong => {}
            ServerFrame::Error(error) => {
                warn!(code = ?error.code, message = %error.message, "server rejected a frame");
                self.emit(ClientEvent::Error(ChatError::Store(error.to_string())));
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let action = self.connection.heartbeat(
            now,
            self.settings.heartbeat_interval,
            self.settings.heartbeat_timeout,
        );
        if action == HeartbeatAction::Expired {
            warn!("no inbound traffic within the heartbeat timeout");
            let generation = self.connection.generation();
            self.on_dropped(generation, Some("heartbeat timeout".to_string()));
        }

        for conversation_id in self.presence.expire_remote(now) {
            self.emit(ClientEvent::TypingChanged(conversation_id));
        }
        for frame in self.presence.poll_local_expiry(now) {
            self.connection.send(frame);
        }

        if !self.connection.is_ready() {
            return;
        }
        let wall = Utc::now();
        for (conversation_id, temp_id) in self
            .reconciler
            .sweep_unconfirmed(wall, self.settings.confirm_timeout)
        {
            warn!(%conversation_id, %temp_id, "message was never confirmed");
            self.emit(ClientEvent::ThreadUpdated(conversation_id.clone()));
            self.emit(ClientEvent::MessageFailed {
                conversation_id,
                temp_id,
                restored_draft: None,
            });
        }
        for frame in self
            .reconciler
            .collect_resend(wall, self.settings.confirm_timeout)
        {
            self.connection.send(frame);
        }
    }

    fn reload_conversations(&mut self) {
        if self.list_loading {
            return;
        }
        self.list_loading = true;
        let store = Arc::clone(&self.store);
        self.spawn_io(async move {
            let result = store
                .list_conversations(&ListFilter::default())
                .await
                .map(StoreUpdate::Conversations);
            Input::Store {
                result,
                reply: StoreReply::ListReload,
            }
        });
    }

    fn load_history(&self, conversation_id: ConversationId, older: bool) {
        let before = if older {
            self.reconciler.oldest_confirmed(&conversation_id).cloned()
        } else {
            None
        };
        let limit = self.settings.history_page_size;
        let store = Arc::clone(&self.store);
        self.spawn_io(async move {
            let fetched = store
                .list_messages(&conversation_id, limit, before.as_ref())
                .await;
            let result = fetched.map(|page| StoreUpdate::History {
                conversation_id,
                page,
                older,
            });
            Input::Store {
                result,
                reply: StoreReply::None,
            }
        });
    }

    fn on_store(&mut self, result: anyhow::Result<StoreUpdate>, reply: StoreReply) {
        if matches!(reply, StoreReply::ListReload) {
            self.list_loading = false;
        }
        match result {
            Ok(update) => {
                let touched = self.apply_update(update);
                match reply {
                    StoreReply::None | StoreReply::ListReload => {}
                    StoreReply::Done(tx) => {
                        let _ = tx.send(Ok(()));
                    }
                    StoreReply::Opened(tx) => {
                        let _ = tx.send(touched.ok_or_else(|| {
                            ChatError::Store("store returned no conversation".to_string())
                        }));
                    }
                }
            }
            Err(err) => {
                let error = ChatError::store(&err);
                warn!("store request failed: {err:#}");
                match reply {
                    StoreReply::None | StoreReply::ListReload => {
                        self.emit(ClientEvent::Error(error));
                    }
                    StoreReply::Done(tx) => {
                        let _ = tx.send(Err(error));
                    }
                    StoreReply::Opened(tx) => {
                        let _ = tx.send(Err(error));
                    }
                }
            }
        }
    }

    /// Returns the conversation a record update touched.
    fn apply_update(&mut self, update: StoreUpdate) -> Option<ConversationId> {
        match update {
            StoreUpdate::Conversations(records) => {
                self.list.replace_all(records);
                let listed: Vec<ConversationId> = self.list.ids().cloned().collect();
                let stale: Vec<ConversationId> = self
                    .connection
                    .rooms()
                    .filter(|room| !self.list.contains(room))
                    .cloned()
                    .collect();
                for conversation_id in stale {
                    self.connection.unsubscribe(&conversation_id);
                }
                for conversation_id in listed {
                    self.connection.subscribe(conversation_id);
                }
                self.emit(ClientEvent::ConversationsUpdated);
                None
            }
            StoreUpdate::History {
                conversation_id,
                page,
                older,
            } => {
                if older {
                    self.reconciler.prepend_history(&conversation_id, page);
                } else {
                    self.reconciler.load_history(&conversation_id, page);
                }
                self.emit(ClientEvent::ThreadUpdated(conversation_id.clone()));
                self.mark_open_thread_read(&conversation_id);
                None
            }
            StoreUpdate::Record(record) => {
                let conversation_id = record.conversation.id.clone();
                self.list.upsert(record);
                self.connection.subscribe(conversation_id.clone());
                self.emit(ClientEvent::ConversationsUpdated);
                Some(conversation_id)
            }
            StoreUpdate::Removed {
                conversation_id,
                user_id,
            } => {
                if user_id == self.me.id {
                    self.list.remove(&conversation_id);
                    self.queued_receipts.remove(&conversation_id);
                    self.connection.unsubscribe(&conversation_id);
                    self.emit(ClientEvent::ConversationsUpdated);
                } else {
                    self.reload_conversations();
                }
                Some(conversation_id)
            }
        }
    }

    fn open_conversation(&mut self, conversation_id: &ConversationId) -> Result<(), ChatError> {
        self.list.open(conversation_id)?;
        self.connection.subscribe(conversation_id.clone());
        self.emit(ClientEvent::ConversationsUpdated);
        self.load_history(conversation_id.clone(), false);
        Ok(())
    }

    fn send_message(
        &mut self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<TempId, ChatError> {
        let summary = self
            .list
            .get(conversation_id)
            .ok_or_else(|| ChatError::InvalidConversationReference(conversation_id.clone()))?;
        if !summary.conversation.is_participant(&self.me.id) {
            return Err(MembershipError::NotMember(self.me.id.clone()).into());
        }
        if !summary.conversation.can_post_messages(&self.me.id) {
            return Err(MembershipError::PermissionDenied(self.me.id.clone()).into());
        }

        let staged = self
            .reconciler
            .stage_send(conversation_id, content, Utc::now())?;
        if let Some(stop) = self.presence.local_sent(conversation_id) {
            self.connection.send(stop);
        }
        let delivered = self.connection.send(staged.frame);
        self.emit(ClientEvent::ThreadUpdated(conversation_id.clone()));
        if delivered {
            debug!(%conversation_id, temp_id = %staged.temp_id, "message handed to transport");
            return Ok(staged.temp_id);
        }
        self.fail_send(conversation_id, &staged.temp_id);
        Err(ChatError::SendFailed {
            temp_id: staged.temp_id,
        })
    }

    fn retry_message(
        &mut self,
        conversation_id: &ConversationId,
        temp_id: &TempId,
    ) -> Result<(), ChatError> {
        let frame = self
            .reconciler
            .retry_failed(conversation_id, temp_id, Utc::now())?;
        let delivered = self.connection.send(frame);
        self.emit(ClientEvent::ThreadUpdated(conversation_id.clone()));
        if delivered {
            return Ok(());
        }
        self.fail_send(conversation_id, temp_id);
        Err(ChatError::SendFailed {
            temp_id: temp_id.clone(),
        })
    }

    fn fail_send(&mut self, conversation_id: &ConversationId, temp_id: &TempId) {
        if self.reconciler.mark_send_failed(conversation_id, temp_id) {
            let restored_draft = self.reconciler.take_restored_draft(conversation_id);
            self.emit(ClientEvent::MessageFailed {
                conversation_id: conversation_id.clone(),
                temp_id: temp_id.clone(),
                restored_draft,
            });
        }
    }

    fn mark_read(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), ChatError> {
        if !self.list.contains(conversation_id) {
            return Err(ChatError::InvalidConversationReference(
                conversation_id.clone(),
            ));
        }
        let recorded =
            self.reconciler
                .mark_read(conversation_id, message_id, &self.me.id, Utc::now())?;
        if recorded {
            self.send_receipt(conversation_id.clone(), message_id.clone());
            self.emit(ClientEvent::ThreadUpdated(conversation_id.clone()));
        }
        Ok(())
    }

    fn mark_open_thread_read(&mut self, conversation_id: &ConversationId) {
        if self.list.open_conversation() != Some(conversation_id) {
            return;
        }
        let now = Utc::now();
        let mut changed = false;
        for message_id in self.reconciler.unread_from_others(conversation_id) {
            if let Ok(true) = self
                .reconciler
                .mark_read(conversation_id, &message_id, &self.me.id, now)
            {
                self.send_receipt(conversation_id.clone(), message_id);
                changed = true;
            }
        }
        if changed {
            self.emit(ClientEvent::ThreadUpdated(conversation_id.clone()));
        }
    }

    fn send_receipt(&mut self, conversation_id: ConversationId, message_id: MessageId) {
        let frame = ClientFrame::MarkMessageRead {
            message_id: message_id.clone(),
            conversation_id: conversation_id.clone(),
        };
        if !self.connection.send(frame) {
            let queued = self.queued_receipts.entry(conversation_id).or_default();
            if !queued.contains(&message_id) {
                queued.push(message_id);
            }
        }
    }

    fn flush_receipts(&mut self) {
        let queued = std::mem::take(&mut self.queued_receipts);
        for (conversation_id, message_ids) in queued {
            for message_id in message_ids {
                self.send_receipt(conversation_id.clone(), message_id);
            }
        }
    }

    fn open_direct(&mut self, user_id: UserId, reply: Reply<ConversationId>) {
        if user_id == self.me.id {
            let _ = reply.send(Err(MembershipError::InvalidParticipants(
                "a direct conversation needs two distinct users".into(),
            )
            .into()));
            return;
        }
        let store = Arc::clone(&self.store);
        self.spawn_io(async move {
            let result = store.open_direct(&user_id).await.map(StoreUpdate::Record);
            Input::Store {
                result,
                reply: StoreReply::Opened(reply),
            }
        });
    }

    fn create_group(
        &mut self,
        name: String,
        members: Vec<UserId>,
        settings: GroupSettings,
        reply: Reply<ConversationId>,
    ) {
        if let Err(err) = Conversation::new_group(
            ConversationId::generate(),
            self.me.id.clone(),
            members.iter().cloned(),
            name.as_str(),
            settings.clone(),
            Utc::now(),
        ) {
            let _ = reply.send(Err(err.into()));
            return;
        }
        let store = Arc::clone(&self.store);
        self.spawn_io(async move {
            let result = store
                .create_group(&name, &members, settings)
                .await
                .map(StoreUpdate::Record);
            Input::Store {
                result,
                reply: StoreReply::Opened(reply),
            }
        });
    }

    /// Validated against the cached aggregate first; a rejected change never
    /// reaches the store.
    fn change_membership(
        &mut self,
        conversation_id: ConversationId,
        op: MembershipOp,
        reply: Reply<()>,
    ) {
        let Some(summary) = self.list.get(&conversation_id) else {
            let _ = reply.send(Err(ChatError::InvalidConversationReference(conversation_id)));
            return;
        };
        let mut candidate = summary.conversation.clone();
        if let Err(err) = op.apply(&mut candidate, &self.me.id, Utc::now()) {
            debug!(%conversation_id, %err, "membership change rejected locally");
            let _ = reply.send(Err(err.into()));
            return;
        }
        let store = Arc::clone(&self.store);
        self.spawn_io(async move {
            let result = match op {
                MembershipOp::Add(user_id) => store
                    .add_participant(&conversation_id, &user_id)
                    .await
                    .map(StoreUpdate::Record),
                MembershipOp::Remove(user_id) => store
                    .remove_participant(&conversation_id, &user_id)
                    .await
                    .map(|()| StoreUpdate::Removed {
                        conversation_id,
                        user_id,
                    }),
                MembershipOp::Grant(user_id) => store
                    .set_admin(&conversation_id, &user_id)
                    .await
                    .map(StoreUpdate::Record),
                MembershipOp::Revoke(user_id) => store
                    .revoke_admin(&conversation_id, &user_id)
                    .await
                    .map(StoreUpdate::Record),
            };
            Input::Store {
                result,
                reply: StoreReply::Done(reply),
            }
        });
    }

    fn update_overlay(
        &mut self,
        conversation_id: ConversationId,
        patch: OverlayPatch,
        reply: Reply<()>,
    ) {
        if !self.list.contains(&conversation_id) {
            let _ = reply.send(Err(ChatError::InvalidConversationReference(conversation_id)));
            return;
        }
        if !self.list.is_participant(&conversation_id, &self.me.id) {
            let _ = reply.send(Err(MembershipError::NotMember(self.me.id.clone()).into()));
            return;
        }
        let store = Arc::clone(&self.store);
        self.spawn_io(async move {
            let result = store
                .update_overlay(&conversation_id, &patch)
                .await
                .map(StoreUpdate::Record);
            Input::Store {
                result,
                reply: StoreReply::Done(reply),
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
