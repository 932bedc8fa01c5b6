//! Client-side synchronization for the chat service: connection lifecycle,
//! optimistic sends, presence and the conversation list, driven by a single
//! session task.

pub mod config;
pub mod connection;
pub mod conversation_list;
pub mod error;
pub mod presence;
pub mod reconcile;
pub mod session;
pub mod store_client;
pub mod transport;

pub use config::{load_sync_settings, ReconnectPolicy, SyncSettings};
pub use connection::{ConnectionStatus, EventHandler};
pub use conversation_list::{display_name, ConversationSummary};
pub use error::ChatError;
pub use reconcile::{Delivery, ThreadEntry};
pub use session::{ChatHandle, ChatSession, ClientEvent, Credentials};
pub use store_client::{api_error, ConversationStore, HttpConversationStore};
pub use transport::{ws_url_from_http, Transport, WebSocketTransport};
