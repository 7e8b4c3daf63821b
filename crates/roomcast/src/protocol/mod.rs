use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::document::{Edit, Operation};
use crate::session::{Identity, SessionId};

/// Identifier of a room
pub type RoomId = String;

/// Kind of a room, fixed by the first join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    /// Chat and notification traffic
    #[default]
    Chat,
    /// Collaborative text document with an operation log
    Document,
}

/// Type tag of a broadcast [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    Notification,
    Edit,
    Join,
    Leave,
    System,
}

/// Priority of a notification, used by session filters
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Payload of a broadcast message; its shape follows the message kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// Chat and system text
    Text(String),
    /// Notification text with a priority
    Notice { text: String, priority: Priority },
    /// A transformed edit operation
    Edit(Operation),
    /// The participant who joined or left
    Presence(Identity),
}

/// A room-scoped message as it goes out on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub room_id: RoomId,
    /// Originating session
    pub author: SessionId,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    /// Room-scoped sequence number assigned by the hub at broadcast time
    pub seq: u64,
}

impl Message {
    /// Priority used for filtering; only notifications carry their own
    pub fn priority(&self) -> Priority {
        match &self.payload {
            Payload::Notice { priority, .. } => *priority,
            _ => Priority::Normal,
        }
    }
}

/// Per-session delivery filter for chat and notification traffic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationFilter {
    /// Only these kinds are delivered; `None` allows every kind
    #[serde(default)]
    pub kinds: Option<HashSet<MessageKind>>,
    /// Messages below this priority are skipped
    #[serde(default)]
    pub min_priority: Option<Priority>,
    /// Skip messages at or below the session's read marker for the room
    #[serde(default)]
    pub unread_only: bool,
}

impl NotificationFilter {
    /// Decide whether `message` reaches a session whose read marker is `last_read`.
    ///
    /// Edit and system messages always pass.
    pub fn accepts(&self, message: &Message, last_read: Option<u64>) -> bool {
        if matches!(message.kind, MessageKind::Edit | MessageKind::System) {
            return true;
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&message.kind) {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if message.priority() < min {
                return false;
            }
        }
        if self.unread_only {
            if let Some(read) = last_read {
                if message.seq <= read {
                    return false;
                }
            }
        }
        true
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room, creating it with `kind` if it does not exist yet
    Join {
        room_id: RoomId,
        #[serde(default)]
        kind: RoomKind,
    },
    /// Leave a single room
    Leave { room_id: RoomId },
    /// Post a chat line to a room
    Chat { room_id: RoomId, text: String },
    /// Post a notification to a room
    Notify {
        room_id: RoomId,
        text: String,
        #[serde(default)]
        priority: Priority,
    },
    /// Submit an edit authored against `base_version`
    Edit {
        room_id: RoomId,
        edit: Edit,
        base_version: u64,
    },
    /// Replace this session's delivery filter
    SetFilter { filter: NotificationFilter },
    /// Mark everything up to `seq` in a room as read
    MarkRead { room_id: RoomId, seq: u64 },
    /// Close the session
    Disconnect,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after the session is registered
    Welcome {
        session_id: SessionId,
        identity: Identity,
    },
    /// A sequenced room message
    Message(Message),
    /// Full document state, sent before anything else on joining a document room
    Snapshot {
        room_id: RoomId,
        content: String,
        version: u64,
        /// Last sequence number assigned in the room
        seq: u64,
    },
    /// Recent room history replayed on joining a chat room
    History {
        room_id: RoomId,
        messages: Vec<Message>,
    },
    /// A request from this session was refused
    Rejected {
        room_id: Option<RoomId>,
        reason: RejectReason,
    },
    /// Acknowledgment of a request
    Ack { request: String },
}

/// Why a client request was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    UnknownRoom,
    NotAMember,
    WrongRoomKind { actual: RoomKind },
    RoomDegraded,
    UnknownVersion {
        base_version: u64,
        current_version: u64,
    },
    OutOfRange {
        position: usize,
        document_length: usize,
    },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::UnknownRoom => write!(f, "unknown room"),
            RejectReason::NotAMember => write!(f, "not a member of the room"),
            RejectReason::WrongRoomKind { actual } => {
                write!(f, "room is a {:?} room", actual)
            }
            RejectReason::RoomDegraded => write!(f, "room is degraded and rejects edits"),
            RejectReason::UnknownVersion {
                base_version,
                current_version,
            } => write!(
                f,
                "base version {} is ahead of document version {}",
                base_version, current_version
            ),
            RejectReason::OutOfRange {
                position,
                document_length,
            } => write!(
                f,
                "position {} out of range for document of length {}",
                position, document_length
            ),
        }
    }
}

/// Encode a message using lib0 format
pub fn encode_message<T: Serialize>(message: &T) -> crate::HubResult<Vec<u8>> {
    let json = serde_json::to_string(message)?;
    let mut encoder = Vec::new();
    lib0::encoding::Write::write_string(&mut encoder, &json);
    Ok(encoder)
}

/// Decode a message from lib0 format
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> crate::HubResult<T> {
    let mut decoder = lib0::decoding::Cursor::new(data);
    let json =
        lib0::decoding::Read::read_string(&mut decoder).map_err(|e| crate::HubError::Protocol {
            message: format!("Failed to decode lib0 string: {}", e),
        })?;

    let message = serde_json::from_str(json)?;
    Ok(message)
}
