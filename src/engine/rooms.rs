use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SessionError};
use crate::web::rest_client::RoomApi;

use super::capabilities::Viewer;
use super::events::{Message, RoomId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomTier {
    Free,
    Paid,
}

impl RoomTier {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Paid => "premium",
        }
    }
}

/// Market a room covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomType {
    Notice,
    Stock,
    Futures,
    Crypto,
    Other,
}

impl RoomType {
    pub fn parse(s: &str) -> Self {
        match s {
            "notice" => Self::Notice,
            "stock" => Self::Stock,
            "futures" => Self::Futures,
            "crypto" => Self::Crypto,
            _ => Self::Other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Notice => "notice",
            Self::Stock => "stock",
            Self::Futures => "futures",
            Self::Crypto => "crypto",
            Self::Other => "chat",
        }
    }
}

/// Who may author in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorPolicy {
    /// Rooms are one-to-many broadcasts from admins and staff.
    CuratorsOnly,
}

/// Room metadata. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub room_type: RoomType,
    pub tier: RoomTier,
    pub description: Option<String>,
    pub authoring: AuthorPolicy,
}

impl Room {
    /// Label shown on alert popups.
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.tier.label())
    }
}

/// Room record returned by the free and paid catalogs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: String,
    #[serde(default)]
    pub room_type: String,
    pub is_free: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl From<RoomRecord> for Room {
    fn from(record: RoomRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            room_type: RoomType::parse(&record.room_type),
            tier: if record.is_free {
                RoomTier::Free
            } else {
                RoomTier::Paid
            },
            description: record.description,
            authoring: AuthorPolicy::CuratorsOnly,
        }
    }
}

/// Map a room id to its metadata.
///
/// The free catalog is always queried; the paid catalog only when a viewer is
/// present. A rejected paid query means the room is inaccessible to this
/// viewer and is reported as `Unauthorized`.
pub async fn resolve_room<A: RoomApi>(
    api: &A,
    room_id: RoomId,
    viewer: Option<&Viewer>,
) -> Result<Room> {
    let free = api.free_rooms().await?;
    if let Some(record) = free.into_iter().find(|r| r.id == room_id) {
        return Ok(record.into());
    }

    let Some(viewer) = viewer else {
        return Err(SessionError::NotFound(format!("room {room_id}")));
    };

    let paid = api.paid_rooms(&viewer.token).await?;
    paid.into_iter()
        .find(|r| r.id == room_id)
        .map(Room::from)
        .ok_or_else(|| SessionError::NotFound(format!("room {room_id}")))
}

/// Fetch the ordered backlog for a room, oldest first.
///
/// An unauthorized fetch degrades to an empty backlog so the view still
/// renders.
pub async fn load_history<A: RoomApi>(
    api: &A,
    room_id: RoomId,
    viewer: Option<&Viewer>,
) -> Result<Vec<Message>> {
    let token = viewer.map(|v| v.token.as_str());
    match api.room_messages(room_id, token).await {
        Ok(records) => {
            info!(room_id, count = records.len(), "history loaded");
            Ok(records.into_iter().map(Message::from_history).collect())
        }
        Err(SessionError::Unauthorized(reason)) => {
            warn!(room_id, %reason, "history not visible to this viewer");
            Ok(vec![])
        }
        Err(e) => Err(e),
    }
}
