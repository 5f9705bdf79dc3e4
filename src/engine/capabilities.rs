use std::fmt;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::events::UserId;
use super::rooms::{Room, RoomTier};

bitflags! {
    /// What a viewer may do in a room. Derived on demand, never stored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        const READ   = 1 << 0;
        const AUTHOR = 1 << 1;
        const UPLOAD = 1 << 2;
        const DELETE = 1 << 3;
    }
}

impl Capabilities {
    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_author(&self) -> bool {
        self.contains(Self::AUTHOR)
    }

    pub fn can_upload(&self) -> bool {
        self.contains(Self::UPLOAD)
    }

    pub fn can_delete(&self) -> bool {
        self.contains(Self::DELETE)
    }
}

/// Viewer roles ordered by privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Member,
    /// Delegated staff ("sub-admin").
    Staff,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Self {
        match s {
            "admin" => Self::Admin,
            "staff" => Self::Staff,
            _ => Self::Member,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Staff => "staff",
            Self::Member => "member",
        }
    }

    /// Curators broadcast to the room; everyone else only reads.
    pub fn is_curator(&self) -> bool {
        matches!(self, Self::Admin | Self::Staff)
    }
}

/// Profile returned by `GET /api/me`.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewerProfile {
    pub id: UserId,
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub is_approved: bool,
    #[serde(default)]
    pub expiry_date: Option<String>,
}

/// The authenticated person looking at a room.
#[derive(Clone, PartialEq, Eq)]
pub struct Viewer {
    pub id: UserId,
    pub name: String,
    pub role: Role,
    pub approved: bool,
    /// End of the paid entitlement. `None` means it does not expire.
    pub entitlement_expires: Option<DateTime<Utc>>,
    /// Bearer token for REST calls and the channel handshake.
    pub token: String,
}

impl fmt::Debug for Viewer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Viewer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("role", &self.role)
            .field("approved", &self.approved)
            .field("entitlement_expires", &self.entitlement_expires)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Viewer {
    pub fn from_profile(profile: ViewerProfile, token: String) -> Self {
        Self {
            id: profile.id,
            name: profile.name,
            role: Role::parse(&profile.role),
            approved: profile.is_approved,
            entitlement_expires: profile
                .expiry_date
                .as_deref()
                .map(|raw| super::events::parse_timestamp(Some(raw))),
            token,
        }
    }

    /// Approved and not past the entitlement end.
    pub fn has_active_entitlement(&self, now: DateTime<Utc>) -> bool {
        self.approved && self.entitlement_expires.is_none_or(|expires| expires > now)
    }

    /// Whole days left on the entitlement, rounded up, never negative.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        let expires = self.entitlement_expires?;
        let secs = (expires - now).num_seconds();
        if secs <= 0 {
            return Some(0);
        }
        Some((secs + 86_399) / 86_400)
    }
}

/// Compute what `viewer` may do in `room` right now.
pub fn resolve(viewer: Option<&Viewer>, room: &Room) -> Capabilities {
    resolve_at(viewer, room, Utc::now())
}

/// Capability rules, in priority order:
///   1. No viewer: read-only, and only for free rooms.
///   2. Admin or staff: everything, regardless of tier or approval.
///   3. Member: read if the room is free or the entitlement is active;
///      members never author, upload or delete.
pub fn resolve_at(viewer: Option<&Viewer>, room: &Room, now: DateTime<Utc>) -> Capabilities {
    let Some(viewer) = viewer else {
        return match room.tier {
            RoomTier::Free => Capabilities::READ,
            RoomTier::Paid => Capabilities::empty(),
        };
    };

    if viewer.role.is_curator() {
        return Capabilities::all();
    }

    match room.tier {
        RoomTier::Free => Capabilities::READ,
        RoomTier::Paid if viewer.has_active_entitlement(now) => Capabilities::READ,
        RoomTier::Paid => Capabilities::empty(),
    }
}
