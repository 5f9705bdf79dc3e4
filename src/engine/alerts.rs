//! Alert Dispatcher: turns a classified signal into sound, notification,
//! haptic and popup cues.
//!
//! Audio, vibration and notifications are reached through [`AlertDevices`],
//! which the host provides. Any device failure degrades to the popup-only
//! path; nothing here can fail a session.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::events::{Message, MessageId, Payload};
use super::preferences::Preferences;
use crate::error::Result;

pub const DEFAULT_POPUP_LIFETIME: Duration = Duration::from_secs(5);
pub const DEFAULT_EXCERPT_CHARS: usize = 100;

/// Short-pause-short buzz, in milliseconds.
pub const VIBRATION_PATTERN: &[u64] = &[200, 100, 200];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device unavailable")]
    Unavailable,
    #[error("permission denied")]
    PermissionDenied,
    /// Audio may only start after a user gesture.
    #[error("audio locked until first user gesture")]
    Locked,
    #[error("device failure: {0}")]
    Failed(String),
}

/// Platform cues. Implementations hold process-wide state (audio unlock,
/// notification permission) and are shared between sessions.
pub trait AlertDevices: Send + Sync + 'static {
    /// Called on the first user gesture.
    fn unlock_audio(&self) -> std::result::Result<(), DeviceError>;

    fn play_chime(&self) -> std::result::Result<(), DeviceError>;

    fn vibrate(&self, pattern_ms: &[u64]) -> std::result::Result<(), DeviceError>;

    /// Whether the viewer granted notification permission earlier.
    fn notification_permitted(&self) -> bool;

    fn notify(&self, title: &str, body: &str) -> std::result::Result<(), DeviceError>;
}

/// Devices for hosts without audio, vibration or notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDevices;

impl AlertDevices for NoopDevices {
    fn unlock_audio(&self) -> std::result::Result<(), DeviceError> {
        Ok(())
    }

    fn play_chime(&self) -> std::result::Result<(), DeviceError> {
        Err(DeviceError::Unavailable)
    }

    fn vibrate(&self, _pattern_ms: &[u64]) -> std::result::Result<(), DeviceError> {
        Err(DeviceError::Unavailable)
    }

    fn notification_permitted(&self) -> bool {
        false
    }

    fn notify(&self, _title: &str, _body: &str) -> std::result::Result<(), DeviceError> {
        Err(DeviceError::Unavailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PopupId(pub u64);

/// In-app transient summary of a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Popup {
    pub id: PopupId,
    pub message_id: MessageId,
    pub content: String,
    pub room_label: String,
    /// Local receipt time, not the server's send time.
    pub arrived_at: DateTime<Utc>,
    pub expires_at: Instant,
}

/// A cue that actually fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertChannel {
    Sound,
    Notification,
    Haptic,
    Popup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertOutcome {
    pub popup: Popup,
    pub fired: Vec<AlertChannel>,
}

#[derive(Debug, Clone, Copy)]
pub struct AlertSettings {
    pub popup_lifetime: Duration,
    pub excerpt_chars: usize,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            popup_lifetime: DEFAULT_POPUP_LIFETIME,
            excerpt_chars: DEFAULT_EXCERPT_CHARS,
        }
    }
}

pub struct AlertDispatcher {
    devices: Arc<dyn AlertDevices>,
    preferences: Arc<Preferences>,
    settings: AlertSettings,
    room_label: String,
    /// Every message id alerted in this session.
    alerted: HashSet<MessageId>,
    popups: VecDeque<Popup>,
    next_popup: u64,
}

impl AlertDispatcher {
    pub fn new(
        devices: Arc<dyn AlertDevices>,
        preferences: Arc<Preferences>,
        settings: AlertSettings,
        room_label: String,
    ) -> Self {
        Self {
            devices,
            preferences,
            settings,
            room_label,
            alerted: HashSet::new(),
            popups: VecDeque::new(),
            next_popup: 1,
        }
    }

    /// Alert on a classified signal. Returns `None` if this message id was
    /// already alerted.
    pub fn dispatch(&mut self, message: &Message, now: Instant) -> Option<AlertOutcome> {
        if !self.alerted.insert(message.id) {
            debug!(message_id = %message.id, "signal already alerted");
            return None;
        }

        let content = match &message.payload {
            Payload::Text(text) => text.clone(),
            Payload::Attachment(attachment) => attachment.name.clone(),
        };
        let mut fired = Vec::new();

        if self.preferences.sound_enabled() {
            match self.devices.play_chime() {
                Ok(()) => fired.push(AlertChannel::Sound),
                Err(e) => warn!(error = %e, "chime unavailable, popup only"),
            }
            if self.devices.notification_permitted() {
                let body = excerpt(&content, self.settings.excerpt_chars);
                match self.devices.notify(&self.room_label, &body) {
                    Ok(()) => fired.push(AlertChannel::Notification),
                    Err(e) => warn!(error = %e, "notification failed, popup only"),
                }
            }
        } else {
            match self.devices.vibrate(VIBRATION_PATTERN) {
                Ok(()) => fired.push(AlertChannel::Haptic),
                Err(e) => debug!(error = %e, "haptics unavailable"),
            }
        }

        let popup = Popup {
            id: PopupId(self.next_popup),
            message_id: message.id,
            content,
            room_label: self.room_label.clone(),
            arrived_at: Utc::now(),
            expires_at: now + self.settings.popup_lifetime,
        };
        self.next_popup += 1;
        self.popups.push_back(popup.clone());
        fired.push(AlertChannel::Popup);

        Some(AlertOutcome { popup, fired })
    }

    /// Popups currently on screen, oldest first.
    pub fn popups(&self) -> impl Iterator<Item = &Popup> {
        self.popups.iter()
    }

    /// Dismiss a popup early. Unknown or already-expired ids are ignored.
    pub fn dismiss(&mut self, id: PopupId) -> bool {
        let before = self.popups.len();
        self.popups.retain(|p| p.id != id);
        self.popups.len() != before
    }

    /// Remove popups whose lifetime has elapsed and return their ids.
    pub fn expire(&mut self, now: Instant) -> Vec<PopupId> {
        let mut expired = Vec::new();
        self.popups.retain(|p| {
            if p.expires_at <= now {
                expired.push(p.id);
                false
            } else {
                true
            }
        });
        expired
    }

    /// Earliest popup deadline, for the session timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.popups.iter().map(|p| p.expires_at).min()
    }

    pub fn sound_enabled(&self) -> bool {
        self.preferences.sound_enabled()
    }

    pub async fn set_sound_enabled(&self, enabled: bool) -> Result<()> {
        self.preferences.set_sound_enabled(enabled).await
    }

    pub fn unlock_audio(&self) {
        if let Err(e) = self.devices.unlock_audio() {
            warn!(error = %e, "audio unlock failed");
        }
    }
}

/// Truncate to at most `max_chars` characters, marking the cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
