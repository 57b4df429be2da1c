/// ChatSync - Real-time chat synchronization core
/// 
/// Keeps a conversation list and per-conversation message threads consistent
/// across REST history, optimistic local sends and a push channel that may
/// deliver out of order or twice.

pub mod error;
pub mod config;
pub mod session;
pub mod messenger_types;
pub mod time;
pub mod channel;
pub mod history;
pub mod conversation_store;
pub mod thread_store;
pub mod state;
pub mod typing;
pub mod receipts;
pub mod pipeline;
pub mod client;

pub use error::{SyncError, Result};
pub use config::Config;
pub use session::Session;
pub use channel::{loopback, Link, SocketSyncChannel, Subscription};
pub use history::{HistorySource, HttpHistoryClient};
pub use client::{ChatClient, HistoryLoad};
pub use pipeline::SentMessage;
pub use messenger_types::{
    Applied, ChatMessage, ClientUpdate, Conversation, ConversationFilter, ConversationSort,
    ConversationSummary, DeliveryState, MessageKey, MessageKind, MessagePayload,
};
