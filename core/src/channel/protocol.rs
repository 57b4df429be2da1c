/// Wire protocol between the chat client and the realtime gateway
use crate::messenger_types::{MessageKind, MessagePayload};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound for a single frame payload
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Events pushed by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum InboundEvent {
    /// A message was posted to a conversation we are in (may be our own echo)
    NewMessage { message: MessagePayload },

    /// Direct confirmation of one of our sends
    MessageSent {
        temp_id: String,
        message: MessagePayload,
    },

    UserTyping {
        user_id: String,
        /// Absent for 1:1 chats, where the conversation is the user
        #[serde(default)]
        conversation_id: Option<String>,
        is_typing: bool,
    },

    /// Coarse "read up to now" receipt
    MessagesRead {
        reader_id: String,
        #[serde(default)]
        conversation_id: Option<String>,
    },

    MessageEdited { message: MessagePayload },

    MessageDeleted {
        conversation_id: String,
        message_id: String,
    },

    UserOnline { user_id: String },

    UserOffline { user_id: String },

    /// Full presence snapshot
    OnlineUsers { user_ids: Vec<String> },
}

/// Discriminant of `InboundEvent`, used to filter subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
    MessageSent,
    UserTyping,
    MessagesRead,
    MessageEdited,
    MessageDeleted,
    Presence,
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::NewMessage { .. } => EventKind::NewMessage,
            InboundEvent::MessageSent { .. } => EventKind::MessageSent,
            InboundEvent::UserTyping { .. } => EventKind::UserTyping,
            InboundEvent::MessagesRead { .. } => EventKind::MessagesRead,
            InboundEvent::MessageEdited { .. } => EventKind::MessageEdited,
            InboundEvent::MessageDeleted { .. } => EventKind::MessageDeleted,
            InboundEvent::UserOnline { .. }
            | InboundEvent::UserOffline { .. }
            | InboundEvent::OnlineUsers { .. } => EventKind::Presence,
        }
    }

    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::NewMessage { .. } => "new-message",
            InboundEvent::MessageSent { .. } => "message-sent",
            InboundEvent::UserTyping { .. } => "user-typing",
            InboundEvent::MessagesRead { .. } => "messages-read",
            InboundEvent::MessageEdited { .. } => "message-edited",
            InboundEvent::MessageDeleted { .. } => "message-deleted",
            InboundEvent::UserOnline { .. } => "user-online",
            InboundEvent::UserOffline { .. } => "user-offline",
            InboundEvent::OnlineUsers { .. } => "online-users",
        }
    }
}

impl fmt::Display for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InboundEvent({})", self.name())
    }
}

/// Events emitted by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum OutboundEvent {
    /// First frame after connecting
    Authenticate {
        user_id: String,
        token: String,
        protocol_version: u8,
    },

    SendMessage {
        conversation_id: String,
        content: String,
        #[serde(rename = "type")]
        kind: MessageKind,
        temp_id: String,
    },

    TypingStart { conversation_id: String },

    TypingStop { conversation_id: String },

    MarkRead { conversation_id: String },

    JoinConversation { conversation_id: String },

    LeaveConversation { conversation_id: String },

    EditMessage {
        conversation_id: String,
        message_id: String,
        content: String,
    },

    DeleteMessage {
        conversation_id: String,
        message_id: String,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::Authenticate { .. } => "authenticate",
            OutboundEvent::SendMessage { .. } => "send-message",
            OutboundEvent::TypingStart { .. } => "typing-start",
            OutboundEvent::TypingStop { .. } => "typing-stop",
            OutboundEvent::MarkRead { .. } => "mark-read",
            OutboundEvent::JoinConversation { .. } => "join-conversation",
            OutboundEvent::LeaveConversation { .. } => "leave-conversation",
            OutboundEvent::EditMessage { .. } => "edit-message",
            OutboundEvent::DeleteMessage { .. } => "delete-message",
        }
    }
}

/// Client -> gateway. `seq` is set when the client waits for an ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub event: OutboundEvent,
}

/// Gateway -> client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Answer to a client frame carrying `seq`
    Ack {
        seq: u64,
        ok: bool,
        #[serde(default)]
        data: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Event { event: InboundEvent },
}

/// Acknowledgment delivered to the caller of `SocketSyncChannel::request`
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub ok: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Ack data of `send-message`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    pub temp_id: String,
    pub message: MessagePayload,
}

/// Protocol frame with length prefix
#[derive(Debug)]
pub struct Frame {
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// JSON-encode a value into a frame
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self {
            length: payload.len() as u32,
            payload,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Serialize frame to bytes (length prefix + payload)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.payload.len());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse frame from bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }

        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

        if length > MAX_FRAME_LEN || data.len() < 4 + length {
            return None;
        }

        Some(Self {
            length: length as u32,
            payload: data[4..4 + length].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_event_wire_shape() {
        let raw = r#"{
            "kind": "event",
            "event": {
                "event": "user-typing",
                "data": { "userId": "B", "isTyping": true }
            }
        }"#;
        let frame: ServerFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Event {
                event: InboundEvent::UserTyping {
                    user_id: "B".to_string(),
                    conversation_id: None,
                    is_typing: true,
                }
            }
        );
    }

    #[test]
    fn test_send_message_uses_temp_id() {
        let frame = ClientFrame {
            seq: Some(7),
            event: OutboundEvent::SendMessage {
                conversation_id: "B".to_string(),
                content: "hi".to_string(),
                kind: MessageKind::Text,
                temp_id: "tmp-1".to_string(),
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["seq"], 7);
        assert_eq!(value["event"]["event"], "send-message");
        assert_eq!(value["event"]["data"]["tempId"], "tmp-1");
        assert_eq!(value["event"]["data"]["type"], "text");
        assert_eq!(value["event"]["data"]["conversationId"], "B");
    }

    #[test]
    fn test_frame_length_prefix() {
        let frame = Frame::encode(&ClientFrame {
            seq: None,
            event: OutboundEvent::MarkRead {
                conversation_id: "B".to_string(),
            },
        })
        .unwrap();
        let bytes = frame.to_bytes();
        let parsed = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(frame.length, parsed.length);
        let decoded: ClientFrame = parsed.decode().unwrap();
        assert!(decoded.seq.is_none());

        assert!(Frame::from_bytes(&bytes[..bytes.len() - 1]).is_none());
    }
}
