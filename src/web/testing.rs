//! In-memory stand-ins for the backend, used by unit and integration tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::engine::capabilities::ViewerProfile;
use crate::engine::events::{HistoryRecord, RoomId};
use crate::engine::rooms::RoomRecord;
use crate::engine::upload::{OutgoingFile, UploadKind, UploadedFile};
use crate::error::{Result, SessionError};

use super::rest_client::RoomApi;
use super::ws_client::{ChannelCommand, ChannelEvent, ChannelHandle, Connector};

#[derive(Default)]
struct FakeState {
    free: Vec<RoomRecord>,
    paid: Vec<RoomRecord>,
    history: HashMap<RoomId, Vec<HistoryRecord>>,
    profile: Option<ViewerProfile>,
    reject_paid: bool,
    reject_history: bool,
    fail_uploads: bool,
    fail_deletes: bool,
    delay: Option<Duration>,
    deleted: Vec<i64>,
    calls: HashMap<&'static str, usize>,
}

/// Scriptable [`RoomApi`]. Every method counts its calls.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
}

fn room(id: RoomId, name: &str, is_free: bool) -> RoomRecord {
    RoomRecord {
        id,
        name: name.to_string(),
        room_type: "futures".into(),
        is_free,
        description: None,
        created_at: None,
    }
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn with(self, f: impl FnOnce(&mut FakeState)) -> Self {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
        self
    }

    pub fn with_free_room(self, id: RoomId, name: &str) -> Self {
        self.with(|s| s.free.push(room(id, name, true)))
    }

    pub fn with_paid_room(self, id: RoomId, name: &str) -> Self {
        self.with(|s| s.paid.push(room(id, name, false)))
    }

    /// Text messages numbered 1, 2, 3... in the given order.
    pub fn with_history(self, room_id: RoomId, texts: &[&str]) -> Self {
        let records = texts
            .iter()
            .enumerate()
            .map(|(i, text)| HistoryRecord {
                id: i as i64 + 1,
                room_id: Some(room_id),
                user_id: 1,
                content: text.to_string(),
                message_type: Some("text".into()),
                file_url: None,
                file_name: None,
                created_at: Some("2024-05-01T09:00:00".into()),
            })
            .collect();
        self.with(|s| {
            s.history.insert(room_id, records);
        })
    }

    pub fn with_profile(self, profile: ViewerProfile) -> Self {
        self.with(|s| s.profile = Some(profile))
    }

    /// Paid catalog answers 403.
    pub fn rejecting_paid(self) -> Self {
        self.with(|s| s.reject_paid = true)
    }

    /// History answers 401.
    pub fn rejecting_history(self) -> Self {
        self.with(|s| s.reject_history = true)
    }

    pub fn failing_uploads(self) -> Self {
        self.with(|s| s.fail_uploads = true)
    }

    pub fn failing_deletes(self) -> Self {
        self.with(|s| s.fail_deletes = true)
    }

    /// Hold history, upload and delete responses for `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.with(|s| s.delay = Some(delay))
    }

    /// Append a text message to a room's history while a session runs.
    pub fn push_history(&self, room_id: RoomId, text: &str) {
        if let Ok(mut state) = self.state.lock() {
            let records = state.history.entry(room_id).or_default();
            let id = records.last().map_or(1, |r| r.id + 1);
            records.push(HistoryRecord {
                id,
                room_id: Some(room_id),
                user_id: 1,
                content: text.to_string(),
                message_type: Some("text".into()),
                file_url: None,
                file_name: None,
                created_at: Some("2024-05-01T09:05:00".into()),
            });
        }
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.calls.get(method).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Server ids passed to `delete_message`.
    pub fn deleted(&self) -> Vec<i64> {
        self.state.lock().map(|s| s.deleted.clone()).unwrap_or_default()
    }

    fn record(&self, method: &'static str) -> Option<Duration> {
        let mut state = self.state.lock().ok()?;
        *state.calls.entry(method).or_default() += 1;
        state.delay
    }

    fn read<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SessionError::Http("fake state poisoned".into()))?;
        Ok(f(&mut state))
    }
}

async fn pause(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

impl RoomApi for FakeApi {
    async fn free_rooms(&self) -> Result<Vec<RoomRecord>> {
        self.record("free_rooms");
        self.read(|s| s.free.clone())
    }

    async fn paid_rooms(&self, _token: &str) -> Result<Vec<RoomRecord>> {
        self.record("paid_rooms");
        let (reject, rooms) = self.read(|s| (s.reject_paid, s.paid.clone()))?;
        if reject {
            return Err(SessionError::Unauthorized("paid rooms: no entitlement".into()));
        }
        Ok(rooms)
    }

    async fn room_messages(
        &self,
        room_id: RoomId,
        _token: Option<&str>,
    ) -> Result<Vec<HistoryRecord>> {
        pause(self.record("room_messages")).await;
        let (reject, records) = self.read(|s| {
            (
                s.reject_history,
                s.history.get(&room_id).cloned().unwrap_or_default(),
            )
        })?;
        if reject {
            return Err(SessionError::Unauthorized("room history: not authenticated".into()));
        }
        Ok(records)
    }

    async fn upload(
        &self,
        kind: UploadKind,
        file: &OutgoingFile,
        _token: &str,
    ) -> Result<UploadedFile> {
        pause(self.record("upload")).await;
        if self.read(|s| s.fail_uploads)? {
            return Err(SessionError::UploadFailure("upload returned 500".into()));
        }
        let dir = match kind {
            UploadKind::Image => "images",
            UploadKind::Document => "files",
        };
        Ok(UploadedFile {
            url: format!("/uploads/{dir}/{}", file.name),
            filename: file.name.clone(),
        })
    }

    async fn delete_message(&self, message_id: i64, _token: &str) -> Result<()> {
        pause(self.record("delete_message")).await;
        let failing = self.read(|s| {
            if !s.fail_deletes {
                s.deleted.push(message_id);
            }
            s.fail_deletes
        })?;
        if failing {
            return Err(SessionError::NotFound(format!("message {message_id}")));
        }
        Ok(())
    }

    async fn me(&self, _token: &str) -> Result<ViewerProfile> {
        self.record("me");
        self.read(|s| s.profile.clone())?
            .ok_or_else(|| SessionError::Unauthorized("profile: invalid token".into()))
    }
}

/// Server side of one fake channel.
pub struct FakeChannel {
    pub url: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
}

impl FakeChannel {
    /// Complete the handshake.
    pub fn accept(&self) {
        let _ = self.events.send(ChannelEvent::Opened);
    }

    /// Deliver one raw frame.
    pub fn push(&self, frame: &str) {
        let _ = self.events.send(ChannelEvent::Frame(frame.to_string()));
    }

    pub fn close(&self, code: Option<u16>) {
        let _ = self.events.send(ChannelEvent::Closed {
            code,
            reason: "closed by fake server".into(),
        });
    }

    /// Next command the client sent, waiting for it.
    pub async fn next_command(&mut self) -> Option<ChannelCommand> {
        self.commands.recv().await
    }

    /// Next command already sent, if any.
    pub fn try_command(&mut self) -> Option<ChannelCommand> {
        self.commands.try_recv().ok()
    }
}

/// [`Connector`] that hands every opened channel to a [`FakeServer`].
pub struct FakeConnector {
    opened: mpsc::UnboundedSender<FakeChannel>,
}

/// Receives the channels a [`FakeConnector`] opens, in order.
pub struct FakeServer {
    channels: mpsc::UnboundedReceiver<FakeChannel>,
}

impl FakeConnector {
    pub fn new() -> (Self, FakeServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { opened: tx }, FakeServer { channels: rx })
    }
}

impl Connector for FakeConnector {
    fn open(&self, url: &str) -> ChannelHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = self.opened.send(FakeChannel {
            url: url.to_string(),
            events: event_tx,
            commands: cmd_rx,
        });
        ChannelHandle {
            commands: cmd_tx,
            events: event_rx,
        }
    }
}

impl FakeServer {
    /// Wait for the client to open a channel.
    pub async fn next_channel(&mut self) -> Option<FakeChannel> {
        self.channels.recv().await
    }

    /// A channel the client already opened, if any.
    pub fn try_channel(&mut self) -> Option<FakeChannel> {
        self.channels.try_recv().ok()
    }
}
