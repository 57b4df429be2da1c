/// Shared types for the chat layer: conversations, messages, wire payloads
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content kind of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Audio,
    Video,
}

/// Delivery lifecycle of a message. Read status is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Rendered locally, waiting for the server
    Pending,
    /// Confirmed, carries a server id
    Sent,
    /// Terminal; a retry creates a new entry
    Failed,
}

/// Denormalized preview of the newest message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub authored_by_local_user: bool,
}

/// One conversation as known to the client.
///
/// `id` is the peer's user id for 1:1 chats and the group id for groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub favorite: bool,
}

impl Conversation {
    /// Minimal record for an id we have never seen in a REST snapshot
    pub fn placeholder(id: &str, hint: &ConversationHint) -> Self {
        Self {
            id: id.to_string(),
            display_name: hint.display_name.clone().unwrap_or_else(|| id.to_string()),
            avatar: hint.avatar.clone(),
            is_group: hint.is_group,
            last_message: None,
            unread_count: 0,
            favorite: false,
        }
    }
}

/// Descriptive fields an inbound message can carry about its conversation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationHint {
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    pub is_group: bool,
}

/// Message as delivered by the server, over REST or the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender_avatar: Option<String>,
    /// Set for 1:1 messages
    #[serde(default)]
    pub recipient_id: Option<String>,
    /// Set for group messages
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    /// Correlation id of the originating send, when the server echoes it
    #[serde(default)]
    pub temp_id: Option<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub edited: bool,
}

impl MessagePayload {
    /// Conversation this message belongs to, from the local user's point of view
    pub fn conversation_for(&self, local_user_id: &str) -> String {
        if let Some(group) = &self.group_id {
            return group.clone();
        }
        if self.sender_id == local_user_id {
            self.recipient_id.clone().unwrap_or_else(|| self.sender_id.clone())
        } else {
            self.sender_id.clone()
        }
    }

    pub fn hint(&self) -> ConversationHint {
        match &self.group_id {
            Some(_) => ConversationHint {
                display_name: self.group_name.clone(),
                avatar: None,
                is_group: true,
            },
            None => ConversationHint {
                display_name: self.sender_name.clone(),
                avatar: self.sender_avatar.clone(),
                is_group: false,
            },
        }
    }
}

/// One entry of a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server id, absent until confirmed
    pub id: Option<String>,
    /// Client key of an optimistic send; kept after confirmation for rendering
    pub local_key: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub state: DeliveryState,
    pub read: bool,
    pub edited: bool,
}

impl ChatMessage {
    /// Build a confirmed entry from a server payload
    pub fn confirmed(conversation_id: &str, payload: &MessagePayload) -> Self {
        Self {
            id: Some(payload.id.clone()),
            local_key: None,
            conversation_id: conversation_id.to_string(),
            sender_id: payload.sender_id.clone(),
            content: payload.content.clone(),
            kind: payload.kind,
            created_at: payload.created_at,
            state: DeliveryState::Sent,
            read: payload.read,
            edited: payload.edited,
        }
    }

    /// Canonical lookup key: the server id once assigned, otherwise the local key
    pub fn key(&self) -> MessageKey<'_> {
        match (&self.id, &self.local_key) {
            (Some(id), _) => MessageKey::Server(id),
            (None, Some(local)) => MessageKey::Local(local),
            (None, None) => MessageKey::Local(""),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == DeliveryState::Pending
    }
}

/// Identity used to address a message in a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKey<'a> {
    Server(&'a str),
    Local(&'a str),
}

/// Locally authored message before it enters a thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
}

/// Outcome of merging a server message into a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// New entry added
    Inserted,
    /// A pending entry was patched with the server identity
    Reconciled,
    /// Already present, nothing changed
    Duplicate,
}

/// Which local-authored messages a read receipt covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadScope {
    /// Explicit server ids
    Messages(Vec<String>),
    /// Everything authored by this user in the conversation
    AuthoredBy(String),
}

/// Pagination info returned with a history page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub page: u32,
    pub total_pages: u32,
}

impl PageInfo {
    pub fn has_more(&self) -> bool {
        self.page < self.total_pages
    }
}

/// One page of history from `GET messages`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessagePayload>,
    pub pagination: PageInfo,
}

/// Tab filter of the conversation list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationFilter {
    #[default]
    All,
    Unread,
    Favorites,
    Groups,
}

/// Sort mode of the conversation list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationSort {
    #[default]
    Recent,
    Unread,
    Name,
}

/// Summary of one conversation for the list view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub is_group: bool,
    pub favorite: bool,
    pub last_message: Option<LastMessage>,
    pub unread_count: u32,
    /// Derived from the presence set
    pub online: bool,
}

/// Change notifications streamed to the UI layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientUpdate {
    /// List membership, order or badges changed
    ConversationsChanged,
    /// The thread of the focused conversation changed
    ThreadUpdated { conversation_id: String },
    TypingChanged { conversation_id: String, typing: bool },
    SendFailed { conversation_id: String, local_key: String, reason: String },
    ConnectionChanged { connected: bool },
}
