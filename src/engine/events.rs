use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::capabilities::Role;

/// Server-assigned room identifier.
pub type RoomId = i64;

/// Server-assigned user identifier.
pub type UserId = i64;

/// Unique identifier for a message within a room's log.
///
/// Events that arrive without a server id (system notices, MT4 signals)
/// get a locally synthesized placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Server(i64),
    Local(Uuid),
}

impl MessageId {
    /// Synthesize a placeholder id for an event the server did not number.
    pub fn local() -> Self {
        Self::Local(Uuid::new_v4())
    }

    /// The server id, if this message can be addressed on the backend.
    pub fn server_id(&self) -> Option<i64> {
        match self {
            Self::Server(id) => Some(*id),
            Self::Local(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{id}"),
            Self::Local(uuid) => write!(f, "local-{uuid}"),
        }
    }
}

/// What a message carries and how it is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
    System,
    Signal,
}

impl MessageKind {
    /// Parse the backend's `message_type` string. Unknown values (including
    /// the legacy "emoji") render as plain text.
    pub fn parse(s: &str) -> Self {
        match s {
            "image" => Self::Image,
            "file" => Self::File,
            "system" => Self::System,
            "signal" => Self::Signal,
            _ => Self::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::System => "system",
            Self::Signal => "signal",
        }
    }
}

/// Where a log entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    History,
    Live,
}

/// Who wrote a message. System notices and MT4 signals have no author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: Option<UserId>,
    pub name: Option<String>,
    pub role: Option<Role>,
}

/// Reference to an uploaded attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub url: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Attachment(AttachmentRef),
}

/// One entry in a room's message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub author: Option<Author>,
    pub kind: MessageKind,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    pub origin: Origin,
}

impl Message {
    /// Textual content, if the payload is text.
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(s) => Some(s),
            Payload::Attachment(_) => None,
        }
    }

    /// Label shown next to the message.
    pub fn author_label(&self) -> &str {
        match (&self.author, self.kind) {
            (Some(Author { name: Some(name), .. }), _) => name,
            (_, MessageKind::Signal) => "MT4 signal",
            (_, MessageKind::System) => "SYSTEM",
            _ => "unknown",
        }
    }

    /// Build a log entry from a REST history record.
    pub fn from_history(record: HistoryRecord) -> Self {
        let kind = MessageKind::parse(record.message_type.as_deref().unwrap_or("text"));
        Self {
            id: MessageId::Server(record.id),
            author: Some(Author {
                id: Some(record.user_id),
                name: None,
                role: None,
            }),
            kind,
            payload: payload_for(kind, record.content, record.file_url, record.file_name),
            timestamp: parse_timestamp(record.created_at.as_deref()),
            origin: Origin::History,
        }
    }
}

/// Image/file messages carry an attachment when the server supplied a URL;
/// everything else (or an attachment message missing its URL) is text.
fn payload_for(
    kind: MessageKind,
    content: String,
    file_url: Option<String>,
    file_name: Option<String>,
) -> Payload {
    match (kind, file_url) {
        (MessageKind::Image | MessageKind::File, Some(url)) => Payload::Attachment(AttachmentRef {
            name: file_name.unwrap_or_else(|| content.clone()),
            url,
        }),
        _ => Payload::Text(content),
    }
}

/// Parse a backend timestamp. The backend emits naive ISO-8601 in UTC; an
/// explicit offset is honoured. Unparsable or missing values fall back to
/// the local arrival time.
pub fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return Utc::now();
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&Utc);
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

// ── Wire formats ──────────────────────────────────────────

/// Message record returned by `GET /api/rooms/{id}/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    #[serde(default)]
    pub room_id: Option<RoomId>,
    pub user_id: UserId,
    pub content: String,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Chat message broadcast on the live channel.
#[derive(Debug, Clone, Deserialize)]
pub struct LiveMessage {
    pub id: Option<i64>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub user_role: Option<String>,
}

/// Inbound JSON envelope, discriminated by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message(LiveMessage),
    System {
        #[serde(alias = "message", default)]
        content: String,
        #[serde(default)]
        timestamp: Option<String>,
    },
    Signal {
        #[serde(default)]
        id: Option<i64>,
        #[serde(default)]
        content: String,
        #[serde(default)]
        timestamp: Option<String>,
    },
    Delete {
        message_id: i64,
    },
    /// The server rejected something this client sent.
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

/// What the session should do with a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Insert(Message),
    Delete(MessageId),
    Rejected(String),
    Ignored,
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn into_event(self) -> InboundEvent {
        match self {
            Self::Message(live) => {
                let kind = MessageKind::parse(live.message_type.as_deref().unwrap_or("text"));
                let author = live.user_id.map(|id| Author {
                    id: Some(id),
                    name: live.user_name,
                    role: live.user_role.as_deref().map(Role::parse),
                });
                InboundEvent::Insert(Message {
                    id: live.id.map(MessageId::Server).unwrap_or_else(MessageId::local),
                    author,
                    kind,
                    payload: payload_for(kind, live.content, live.file_url, live.file_name),
                    timestamp: parse_timestamp(live.timestamp.as_deref()),
                    origin: Origin::Live,
                })
            }
            Self::System { content, timestamp } => InboundEvent::Insert(Message {
                id: MessageId::local(),
                author: None,
                kind: MessageKind::System,
                payload: Payload::Text(content),
                timestamp: parse_timestamp(timestamp.as_deref()),
                origin: Origin::Live,
            }),
            Self::Signal {
                id,
                content,
                timestamp,
            } => InboundEvent::Insert(Message {
                id: id.map(MessageId::Server).unwrap_or_else(MessageId::local),
                author: None,
                kind: MessageKind::Signal,
                payload: Payload::Text(content),
                timestamp: parse_timestamp(timestamp.as_deref()),
                origin: Origin::Live,
            }),
            Self::Delete { message_id } => InboundEvent::Delete(MessageId::Server(message_id)),
            Self::Error { message } => InboundEvent::Rejected(message),
            Self::Unknown => InboundEvent::Ignored,
        }
    }
}

/// Outbound frame published on the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl ClientFrame {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: MessageKind::Text,
            file_url: None,
            file_name: None,
        }
    }
}
