//! Per-room session driver.
//!
//! One tokio task per session owns the Connection Manager, the message log
//! and the Alert Dispatcher, so handlers for a session never run in parallel.
//! REST calls run on helper tasks and report back through a completion queue;
//! a result that arrives after teardown has nowhere to go and is dropped, and
//! a result from a superseded request is discarded by generation check.

use std::future::pending;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::web::rest_client::RoomApi;
use crate::web::ws_client::{ChannelCommand, ChannelEvent, Connector, channel_url};

use super::alerts::{AlertDevices, AlertDispatcher, AlertOutcome, AlertSettings, Popup, PopupId};
use super::capabilities::{self, Capabilities, Viewer};
use super::connection::{
    ConnectionAction, ConnectionManager, ConnectionState, GiveUpReason, ReconnectPolicy, TimerId,
};
use super::events::{ClientFrame, InboundEvent, Message, MessageId, RoomId, ServerFrame, UserId};
use super::preferences::Preferences;
use super::reconciler::{InsertOutcome, MessageLog};
use super::rooms::{self, Room};
use super::signals;
use super::upload::{self, OutgoingFile, UploadKind};

/// Shared collaborators every session talks to.
pub struct Collaborators<A> {
    pub api: Arc<A>,
    pub connector: Arc<dyn Connector>,
    pub devices: Arc<dyn AlertDevices>,
    pub preferences: Arc<Preferences>,
}

impl<A> Clone for Collaborators<A> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            connector: self.connector.clone(),
            devices: self.devices.clone(),
            preferences: self.preferences.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base of the realtime endpoint, e.g. `ws://localhost:8000`.
    pub ws_url: String,
    pub reconnect: ReconnectPolicy,
    pub alerts: AlertSettings,
}

/// What the host sees change.
#[derive(Debug)]
pub enum SessionUpdate {
    Capabilities(Capabilities),
    Connection(ConnectionState),
    /// A history fetch was applied; `added` entries are new.
    HistoryLoaded { added: usize },
    Inserted(Message),
    Removed(MessageId),
    /// Transient system notice; not part of the log.
    Notice(Message),
    Alert(AlertOutcome),
    PopupClosed(PopupId),
    Error(SessionError),
}

/// Point-in-time view of a session for rendering.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub room: Room,
    pub capabilities: Capabilities,
    pub connection: ConnectionState,
    pub messages: Vec<Message>,
    pub notices: Vec<Message>,
    pub popups: Vec<Popup>,
    pub sound_enabled: bool,
    /// Read-only viewers see the investment disclaimer until they accept it.
    pub disclaimer_required: bool,
}

enum SessionCommand {
    SendText(String, oneshot::Sender<Result<()>>),
    Upload(OutgoingFile, Option<UploadKind>, oneshot::Sender<Result<()>>),
    Delete(MessageId, oneshot::Sender<Result<()>>),
    Reload,
    DismissPopup(PopupId),
    SetSound(bool, oneshot::Sender<Result<()>>),
    UnlockAudio,
    AcknowledgeDisclaimer,
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

enum Completion {
    History {
        generation: u64,
        result: Result<Vec<Message>>,
    },
    Uploaded {
        result: Result<ClientFrame>,
        reply: oneshot::Sender<Result<()>>,
    },
    Deleted {
        id: MessageId,
        result: Result<()>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cheap handle for talking to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    pub room_id: RoomId,
    pub viewer_id: Option<UserId>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    cancel: CancellationToken,
}

fn session_closed() -> SessionError {
    SessionError::Transport("session closed".into())
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> std::result::Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).map_err(|_| session_closed())?;
        rx.await.map_err(|_| session_closed())
    }

    /// Publish a text message. Curators only; needs an open channel.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|tx| SessionCommand::SendText(text, tx)).await?
    }

    /// Validate, transfer and announce an attachment. `kind` defaults to
    /// [`UploadKind::infer`].
    pub async fn upload(&self, file: OutgoingFile, kind: Option<UploadKind>) -> Result<()> {
        self.request(|tx| SessionCommand::Upload(file, kind, tx)).await?
    }

    /// Delete a message on the server and drop it from the log.
    pub async fn delete_message(&self, id: MessageId) -> Result<()> {
        self.request(|tx| SessionCommand::Delete(id, tx)).await?
    }

    /// Refetch history.
    pub fn reload(&self) {
        let _ = self.commands.send(SessionCommand::Reload);
    }

    pub fn dismiss_popup(&self, id: PopupId) {
        let _ = self.commands.send(SessionCommand::DismissPopup(id));
    }

    pub async fn set_sound_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|tx| SessionCommand::SetSound(enabled, tx)).await?
    }

    /// Report the first user gesture so audio cues may play.
    pub fn unlock_audio(&self) {
        let _ = self.commands.send(SessionCommand::UnlockAudio);
    }

    pub fn acknowledge_disclaimer(&self) {
        let _ = self.commands.send(SessionCommand::AcknowledgeDisclaimer);
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(SessionCommand::Snapshot).await
    }

    /// Begin teardown. Returns immediately.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Start a session for `viewer` in `room`.
///
/// Returns the handle, the update stream and the driver task. Dropping the
/// handle does not stop the session; call [`SessionHandle::cancel`].
pub fn spawn<A: RoomApi>(
    collab: Collaborators<A>,
    config: SessionConfig,
    room: Room,
    viewer: Option<Viewer>,
) -> (
    SessionHandle,
    mpsc::UnboundedReceiver<SessionUpdate>,
    JoinHandle<()>,
) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let handle = SessionHandle {
        room_id: room.id,
        viewer_id: viewer.as_ref().map(|v| v.id),
        commands: cmd_tx,
        cancel: cancel.clone(),
    };

    let capabilities = capabilities::resolve(viewer.as_ref(), &room);
    let dispatcher = AlertDispatcher::new(
        collab.devices.clone(),
        collab.preferences.clone(),
        config.alerts,
        room.label(),
    );

    let task = RoomSession {
        connection: ConnectionManager::new(config.reconnect),
        log: MessageLog::new(),
        dispatcher,
        capabilities,
        collab,
        ws_url: config.ws_url,
        room,
        viewer,
        channel_commands: None,
        channel_events: None,
        reconnect_at: None,
        history_generation: 0,
        published_state: ConnectionState::Idle,
        updates: update_tx,
        completions: done_tx,
    };
    let join = tokio::spawn(task.run(cmd_rx, done_rx, cancel));
    (handle, update_rx, join)
}

struct RoomSession<A> {
    room: Room,
    viewer: Option<Viewer>,
    capabilities: Capabilities,
    collab: Collaborators<A>,
    ws_url: String,

    connection: ConnectionManager,
    log: MessageLog,
    dispatcher: AlertDispatcher,

    channel_commands: Option<mpsc::UnboundedSender<ChannelCommand>>,
    channel_events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    reconnect_at: Option<(TimerId, Instant)>,
    /// Bumped per history request; older results are stale.
    history_generation: u64,
    published_state: ConnectionState,

    updates: mpsc::UnboundedSender<SessionUpdate>,
    completions: mpsc::UnboundedSender<Completion>,
}

/// What woke the loop.
enum Step {
    Shutdown,
    Command(SessionCommand),
    Channel(ChannelEvent),
    Completed(Completion),
    ReconnectDue,
    PopupDue,
}

async fn next_channel_event(events: &mut Option<mpsc::UnboundedReceiver<ChannelEvent>>) -> ChannelEvent {
    match events {
        Some(rx) => rx.recv().await.unwrap_or(ChannelEvent::Closed {
            code: None,
            reason: "channel task ended".into(),
        }),
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

impl<A: RoomApi> RoomSession<A> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        cancel: CancellationToken,
    ) {
        info!(
            room_id = self.room.id,
            viewer_id = ?self.viewer.as_ref().map(|v| v.id),
            capabilities = ?self.capabilities,
            "session started"
        );
        self.emit(SessionUpdate::Capabilities(self.capabilities));

        if self.capabilities.can_read() {
            self.request_history();
            let actions = self.connection.connect(self.viewer.as_ref());
            self.execute(actions);
        } else {
            self.emit(SessionUpdate::Error(SessionError::Unauthorized(format!(
                "no access to {}",
                self.room.label()
            ))));
        }

        loop {
            let reconnect_deadline = self.reconnect_at.map(|(_, at)| at);
            let popup_deadline = self.dispatcher.next_deadline();

            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Shutdown,
                Some(cmd) = commands.recv() => Step::Command(cmd),
                event = next_channel_event(&mut self.channel_events) => Step::Channel(event),
                Some(done) = completions.recv() => Step::Completed(done),
                _ = sleep_until_opt(reconnect_deadline) => Step::ReconnectDue,
                _ = sleep_until_opt(popup_deadline) => Step::PopupDue,
            };

            match step {
                Step::Shutdown => break,
                Step::Command(cmd) => self.on_command(cmd).await,
                Step::Channel(event) => self.on_channel_event(event),
                Step::Completed(done) => self.on_completion(done),
                Step::ReconnectDue => {
                    if let Some((timer, _)) = self.reconnect_at.take() {
                        let actions = self.connection.on_timer(timer);
                        self.execute(actions);
                    }
                }
                Step::PopupDue => {
                    for id in self.dispatcher.expire(Instant::now()) {
                        self.emit(SessionUpdate::PopupClosed(id));
                    }
                }
            }
        }

        let actions = self.connection.teardown();
        self.execute(actions);
        info!(room_id = self.room.id, "session stopped");
    }

    fn emit(&self, update: SessionUpdate) {
        // The host may have stopped listening; the session keeps running.
        let _ = self.updates.send(update);
    }

    fn channel_open(&self) -> bool {
        self.connection.state() == ConnectionState::Open && self.channel_commands.is_some()
    }

    // ── Connection actions ────────────────────────────────

    fn execute(&mut self, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::Open => self.open_channel(),
                ConnectionAction::Close { code } => {
                    if let Some(tx) = &self.channel_commands {
                        let _ = tx.send(ChannelCommand::Close { code });
                    }
                }
                ConnectionAction::ScheduleReconnect { timer, delay } => {
                    self.reconnect_at = Some((timer, Instant::now() + delay));
                }
                ConnectionAction::CancelReconnect { timer } => {
                    if matches!(self.reconnect_at, Some((pending, _)) if pending == timer) {
                        self.reconnect_at = None;
                    }
                }
                ConnectionAction::GiveUp(reason) => {
                    let error = match reason {
                        GiveUpReason::PolicyViolation => {
                            SessionError::Unauthorized("channel rejected by server".into())
                        }
                        GiveUpReason::AttemptsExhausted { attempts } => SessionError::Transport(
                            format!("gave up after {attempts} reconnect attempts"),
                        ),
                    };
                    self.emit(SessionUpdate::Error(error));
                }
            }
        }

        let state = self.connection.state();
        if state != self.published_state {
            self.published_state = state;
            self.emit(SessionUpdate::Connection(state));
        }
    }

    fn open_channel(&mut self) {
        let Some(viewer) = &self.viewer else {
            return;
        };
        let url = channel_url(&self.ws_url, self.room.id, &viewer.token);
        debug!(room_id = self.room.id, "opening channel");
        let handle = self.collab.connector.open(&url);
        self.channel_commands = Some(handle.commands);
        self.channel_events = Some(handle.events);
    }

    // ── Channel events ────────────────────────────────────

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => {
                let reconnected = self.connection.attempts() > 0;
                info!(room_id = self.room.id, reconnected, "channel open");
                let actions = self.connection.on_open();
                self.execute(actions);
                // Frames broadcast while the channel was down only reach us
                // through history.
                if reconnected {
                    self.request_history();
                }
            }
            ChannelEvent::Frame(text) => self.on_frame(&text),
            ChannelEvent::Closed { code, reason } => {
                info!(room_id = self.room.id, code = ?code, %reason, "channel closed");
                self.channel_commands = None;
                self.channel_events = None;
                let actions = self.connection.on_closed(code);
                self.execute(actions);
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(room_id = self.room.id, error = %e, "dropping malformed frame");
                return;
            }
        };

        match frame.into_event() {
            InboundEvent::Insert(message) => match self.log.insert(message.clone()) {
                InsertOutcome::Inserted => {
                    let alert = if signals::classify(&message) {
                        self.dispatcher.dispatch(&message, Instant::now())
                    } else {
                        None
                    };
                    self.emit(SessionUpdate::Inserted(message));
                    if let Some(outcome) = alert {
                        info!(room_id = self.room.id, fired = ?outcome.fired, "signal alert");
                        self.emit(SessionUpdate::Alert(outcome));
                    }
                }
                InsertOutcome::Notice => self.emit(SessionUpdate::Notice(message)),
                InsertOutcome::Duplicate => {
                    debug!(message_id = %message.id, "duplicate message ignored");
                }
            },
            InboundEvent::Delete(id) => {
                if self.log.remove(&id) {
                    self.emit(SessionUpdate::Removed(id));
                }
            }
            InboundEvent::Rejected(reason) => {
                warn!(room_id = self.room.id, %reason, "server rejected frame");
                self.emit(SessionUpdate::Error(SessionError::Unauthorized(reason)));
            }
            InboundEvent::Ignored => debug!("ignoring unknown frame type"),
        }
    }

    // ── Commands ──────────────────────────────────────────

    async fn on_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::SendText(text, reply) => {
                let _ = reply.send(self.send_text(text));
            }
            SessionCommand::Upload(file, kind, reply) => self.start_upload(file, kind, reply),
            SessionCommand::Delete(id, reply) => self.start_delete(id, reply),
            SessionCommand::Reload => self.request_history(),
            SessionCommand::DismissPopup(id) => {
                if self.dispatcher.dismiss(id) {
                    self.emit(SessionUpdate::PopupClosed(id));
                }
            }
            SessionCommand::SetSound(enabled, reply) => {
                let result = self.dispatcher.set_sound_enabled(enabled).await;
                if let Err(e) = &result {
                    warn!(error = %e, "failed to persist sound preference");
                }
                let _ = reply.send(result);
            }
            SessionCommand::UnlockAudio => self.dispatcher.unlock_audio(),
            SessionCommand::AcknowledgeDisclaimer => {
                self.collab.preferences.acknowledge_disclaimer();
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            room: self.room.clone(),
            capabilities: self.capabilities,
            connection: self.connection.state(),
            messages: self.log.messages().to_vec(),
            notices: self.log.notices().to_vec(),
            popups: self.dispatcher.popups().cloned().collect(),
            sound_enabled: self.dispatcher.sound_enabled(),
            disclaimer_required: !self.capabilities.can_author()
                && !self.collab.preferences.disclaimer_acknowledged(),
        }
    }

    fn publish(&self, frame: &ClientFrame) -> Result<()> {
        let tx = self
            .channel_commands
            .as_ref()
            .filter(|_| self.channel_open())
            .ok_or_else(|| SessionError::Transport("channel not open".into()))?;
        let json = serde_json::to_string(frame)?;
        tx.send(ChannelCommand::Send(json))
            .map_err(|_| SessionError::Transport("channel not open".into()))
    }

    fn send_text(&mut self, text: String) -> Result<()> {
        if !self.capabilities.can_author() {
            return Err(SessionError::Unauthorized(
                "only admins and staff can post".into(),
            ));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::Validation("message is empty".into()));
        }
        self.publish(&ClientFrame::text(text))
    }

    fn start_upload(
        &mut self,
        file: OutgoingFile,
        kind: Option<UploadKind>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let kind = kind.unwrap_or_else(|| UploadKind::infer(&file));
        if let Err(e) = upload::validate(self.capabilities, &file, kind) {
            let _ = reply.send(Err(e));
            return;
        }
        // Refuse before transferring; a stored file with no announcement
        // would be orphaned.
        if !self.channel_open() {
            let _ = reply.send(Err(SessionError::Transport("channel not open".into())));
            return;
        }
        let Some(token) = self.viewer.as_ref().map(|v| v.token.clone()) else {
            let _ = reply.send(Err(SessionError::Unauthorized("not signed in".into())));
            return;
        };

        let api = self.collab.api.clone();
        let done = self.completions.clone();
        tokio::spawn(async move {
            let result = upload::transfer(api.as_ref(), &token, &file, kind).await;
            let _ = done.send(Completion::Uploaded { result, reply });
        });
    }

    fn start_delete(&mut self, id: MessageId, reply: oneshot::Sender<Result<()>>) {
        if !self.capabilities.can_delete() {
            let _ = reply.send(Err(SessionError::Unauthorized(
                "only admins and staff can delete".into(),
            )));
            return;
        }
        let Some(server_id) = id.server_id() else {
            let _ = reply.send(Err(SessionError::Validation(format!(
                "message {id} has no server id"
            ))));
            return;
        };
        let Some(token) = self.viewer.as_ref().map(|v| v.token.clone()) else {
            let _ = reply.send(Err(SessionError::Unauthorized("not signed in".into())));
            return;
        };

        let api = self.collab.api.clone();
        let done = self.completions.clone();
        tokio::spawn(async move {
            let result = api.delete_message(server_id, &token).await;
            let _ = done.send(Completion::Deleted { id, result, reply });
        });
    }

    fn request_history(&mut self) {
        self.history_generation += 1;
        let generation = self.history_generation;
        let api = self.collab.api.clone();
        let viewer = self.viewer.clone();
        let room_id = self.room.id;
        let done = self.completions.clone();
        tokio::spawn(async move {
            let result = rooms::load_history(api.as_ref(), room_id, viewer.as_ref()).await;
            let _ = done.send(Completion::History { generation, result });
        });
    }

    // ── Async completions ─────────────────────────────────

    fn on_completion(&mut self, done: Completion) {
        match done {
            Completion::History { generation, result } => {
                if generation != self.history_generation {
                    debug!(generation, "discarding superseded history");
                    return;
                }
                match result {
                    Ok(history) => {
                        // Without a channel the fetch is the whole truth;
                        // with one, live entries must survive the merge.
                        let added = if self.connection.state() == ConnectionState::Idle {
                            self.log.replace_with_history(history);
                            self.log.len()
                        } else {
                            self.log.merge_history(history)
                        };
                        self.emit(SessionUpdate::HistoryLoaded { added });
                    }
                    Err(e) => {
                        warn!(room_id = self.room.id, error = %e, "history load failed");
                        self.emit(SessionUpdate::Error(e));
                    }
                }
            }
            Completion::Uploaded { result, reply } => {
                let outcome = result.and_then(|frame| self.publish(&frame));
                if let Err(e) = &outcome {
                    warn!(room_id = self.room.id, error = %e, "attachment not published");
                }
                let _ = reply.send(outcome);
            }
            Completion::Deleted { id, result, reply } => {
                if result.is_ok() && self.log.remove(&id) {
                    self.emit(SessionUpdate::Removed(id));
                }
                let _ = reply.send(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::alerts::tests::RecordingDevices;
    use crate::engine::capabilities::Role;
    use crate::engine::connection::{CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
    use crate::engine::rooms::{AuthorPolicy, RoomTier, RoomType};
    use crate::web::testing::{FakeApi, FakeChannel, FakeConnector, FakeServer};
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        handle: SessionHandle,
        updates: mpsc::UnboundedReceiver<SessionUpdate>,
        server: FakeServer,
        api: Arc<FakeApi>,
        devices: Arc<RecordingDevices>,
        join: JoinHandle<()>,
    }

    impl Harness {
        async fn next_update(&mut self) -> SessionUpdate {
            timeout(Duration::from_secs(60), self.updates.recv())
                .await
                .expect("timed out waiting for update")
                .expect("update stream closed")
        }

        async fn wait_for<T>(&mut self, mut f: impl FnMut(&SessionUpdate) -> Option<T>) -> T {
            loop {
                let update = self.next_update().await;
                if let Some(found) = f(&update) {
                    return found;
                }
            }
        }

        async fn wait_state(&mut self, state: ConnectionState) {
            self.wait_for(|u| matches!(u, SessionUpdate::Connection(s) if *s == state).then_some(()))
                .await
        }

        async fn open_channel(&mut self) -> FakeChannel {
            let channel = self.server.next_channel().await.expect("channel");
            channel.accept();
            self.wait_state(ConnectionState::Open).await;
            channel
        }
    }

    fn room(id: RoomId, tier: RoomTier) -> Room {
        Room {
            id,
            name: "Futures".into(),
            room_type: RoomType::Futures,
            tier,
            description: None,
            authoring: AuthorPolicy::CuratorsOnly,
        }
    }

    fn viewer(role: Role) -> Viewer {
        Viewer {
            id: 7,
            name: "kim".into(),
            role,
            approved: true,
            entitlement_expires: None,
            token: "tok".into(),
        }
    }

    fn start(api: FakeApi, room: Room, viewer: Option<Viewer>) -> Harness {
        let api = Arc::new(api);
        let (connector, server) = FakeConnector::new();
        let devices = Arc::new(RecordingDevices::default());
        let collab = Collaborators {
            api: api.clone(),
            connector: Arc::new(connector),
            devices: devices.clone(),
            preferences: Arc::new(Preferences::in_memory()),
        };
        let config = SessionConfig {
            ws_url: "ws://backend".into(),
            reconnect: ReconnectPolicy::default(),
            alerts: AlertSettings::default(),
        };
        let (handle, updates, join) = spawn(collab, config, room, viewer);
        Harness {
            handle,
            updates,
            server,
            api,
            devices,
            join,
        }
    }

    fn file(name: &str, mime: &str) -> OutgoingFile {
        OutgoingFile {
            name: name.into(),
            mime_type: Some(mime.into()),
            bytes: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn test_anonymous_guest_reads_history_without_channel() {
        let api = FakeApi::new().with_history(1, &["one", "two", "three"]);
        let mut h = start(api, room(1, RoomTier::Free), None);

        let caps = h
            .wait_for(|u| match u {
                SessionUpdate::Capabilities(c) => Some(*c),
                _ => None,
            })
            .await;
        assert!(caps.can_read());
        assert!(!caps.can_author());

        let added = h
            .wait_for(|u| match u {
                SessionUpdate::HistoryLoaded { added } => Some(*added),
                _ => None,
            })
            .await;
        assert_eq!(added, 3);

        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.messages.len(), 3);
        assert_eq!(snap.connection, ConnectionState::Idle);
        assert!(h.server.try_channel().is_none());
    }

    #[tokio::test]
    async fn test_member_without_entitlement_gets_nothing() {
        let mut lapsed = viewer(Role::Member);
        lapsed.approved = false;
        let mut h = start(FakeApi::new(), room(2, RoomTier::Paid), Some(lapsed));
        let err = h
            .wait_for(|u| match u {
                SessionUpdate::Error(e) => Some(e.code()),
                _ => None,
            })
            .await;
        assert_eq!(err, "UNAUTHORIZED");
        assert!(h.server.try_channel().is_none());
        assert_eq!(h.api.calls("room_messages"), 0);
    }

    #[tokio::test]
    async fn test_signal_alerts_once() {
        let mut h = start(FakeApi::new(), room(2, RoomTier::Paid), Some(viewer(Role::Member)));
        let ch = h.open_channel().await;
        assert_eq!(ch.url, "ws://backend/ws/chat/2?token=tok");

        let signal = r#"{"type":"message","id":10,"user_id":1,"content":"BUY EURUSD now","message_type":"signal"}"#;
        ch.push(signal);
        ch.push(signal);
        ch.push(r#"{"type":"message","id":11,"user_id":1,"content":"good morning"}"#);

        let mut alerts = Vec::new();
        loop {
            match h.next_update().await {
                SessionUpdate::Alert(outcome) => alerts.push(outcome),
                SessionUpdate::Inserted(m) if m.id == MessageId::Server(11) => break,
                _ => {}
            }
        }
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].popup.content, "BUY EURUSD now");
        assert_eq!(alerts[0].popup.room_label, "Futures (premium)");
        assert_eq!(*h.devices.chimes.lock().unwrap(), 1);

        let snap = h.handle.snapshot().await.unwrap();
        let copies = snap
            .messages
            .iter()
            .filter(|m| m.id == MessageId::Server(10))
            .count();
        assert_eq!(copies, 1);
    }

    #[tokio::test]
    async fn test_system_notice_is_not_logged_or_alerted() {
        let mut h = start(FakeApi::new(), room(2, RoomTier::Free), Some(viewer(Role::Member)));
        let ch = h.open_channel().await;
        ch.push(r#"{"type":"system","message":"SELL desk joined"}"#);
        let notice = h
            .wait_for(|u| match u {
                SessionUpdate::Notice(m) => Some(m.clone()),
                _ => None,
            })
            .await;
        assert_eq!(notice.text(), Some("SELL desk joined"));
        let snap = h.handle.snapshot().await.unwrap();
        assert!(snap.messages.is_empty());
        assert_eq!(snap.notices.len(), 1);
        assert!(snap.popups.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_popup_auto_dismisses() {
        let mut h = start(FakeApi::new(), room(2, RoomTier::Free), Some(viewer(Role::Member)));
        let ch = h.open_channel().await;
        ch.push(r#"{"type":"signal","content":"OPEN NQ long"}"#);
        let popup = h
            .wait_for(|u| match u {
                SessionUpdate::Alert(o) => Some(o.popup.clone()),
                _ => None,
            })
            .await;
        let shown = Instant::now();
        let closed = h
            .wait_for(|u| match u {
                SessionUpdate::PopupClosed(id) => Some(*id),
                _ => None,
            })
            .await;
        assert_eq!(closed, popup.id);
        assert!(shown.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_reconnects_after_delay() {
        let mut h = start(FakeApi::new(), room(2, RoomTier::Free), Some(viewer(Role::Member)));
        let ch = h.open_channel().await;

        ch.close(Some(1006));
        h.wait_state(ConnectionState::Closed).await;
        let closed_at = Instant::now();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(h.server.try_channel().is_none());

        let retry = h.server.next_channel().await.expect("retry");
        assert!(closed_at.elapsed() >= Duration::from_secs(5));
        retry.accept();
        h.wait_state(ConnectionState::Open).await;
        assert!(h.server.try_channel().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_refetches_missed_history() {
        let api = FakeApi::new().with_history(2, &["one", "two"]);
        let mut h = start(api, room(2, RoomTier::Free), Some(viewer(Role::Member)));

        let ch = h.server.next_channel().await.expect("channel");
        let first = h
            .wait_for(|u| match u {
                SessionUpdate::HistoryLoaded { added } => Some(*added),
                _ => None,
            })
            .await;
        assert_eq!(first, 2);
        ch.accept();
        h.wait_state(ConnectionState::Open).await;
        assert_eq!(h.api.calls("room_messages"), 1);

        h.api.push_history(2, "sent while away");
        ch.close(Some(1006));
        h.wait_state(ConnectionState::Closed).await;
        let retry = h.server.next_channel().await.expect("retry");
        retry.accept();
        h.wait_state(ConnectionState::Open).await;

        let added = h
            .wait_for(|u| match u {
                SessionUpdate::HistoryLoaded { added } => Some(*added),
                _ => None,
            })
            .await;
        assert_eq!(added, 1);
        assert_eq!(h.api.calls("room_messages"), 2);

        let snap = h.handle.snapshot().await.unwrap();
        let texts: Vec<_> = snap.messages.iter().filter_map(|m| m.text()).collect();
        assert_eq!(texts, vec!["one", "two", "sent while away"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_closes_cleanly_and_never_retries() {
        let mut h = start(FakeApi::new(), room(2, RoomTier::Free), Some(viewer(Role::Member)));
        let mut ch = h.open_channel().await;

        h.handle.cancel();
        assert_eq!(
            ch.next_command().await,
            Some(ChannelCommand::Close { code: CLOSE_NORMAL })
        );
        h.join.await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.server.try_channel().is_none());
        assert!(h.handle.snapshot().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_close_stops_reconnecting() {
        let mut h = start(FakeApi::new(), room(2, RoomTier::Free), Some(viewer(Role::Member)));
        let ch = h.open_channel().await;
        ch.close(Some(CLOSE_POLICY_VIOLATION));
        let code = h
            .wait_for(|u| match u {
                SessionUpdate::Error(e) => Some(e.code()),
                _ => None,
            })
            .await;
        assert_eq!(code, "UNAUTHORIZED");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.server.try_channel().is_none());
    }

    #[tokio::test]
    async fn test_curator_sends_text() {
        let mut h = start(FakeApi::new(), room(1, RoomTier::Free), Some(viewer(Role::Staff)));
        let mut ch = h.open_channel().await;

        h.handle.send_text("  SELL gold  ").await.unwrap();
        let Some(ChannelCommand::Send(json)) = ch.next_command().await else {
            panic!("Expected Send");
        };
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, serde_json::json!({"message": "SELL gold", "type": "text"}));

        let err = h.handle.send_text("   ").await.unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    #[tokio::test]
    async fn test_member_cannot_send() {
        let mut h = start(FakeApi::new(), room(1, RoomTier::Free), Some(viewer(Role::Member)));
        let mut ch = h.open_channel().await;
        let err = h.handle.send_text("hello").await.unwrap_err();
        assert!(matches!(err, SessionError::Unauthorized(_)));
        assert!(ch.try_command().is_none());
    }

    #[tokio::test]
    async fn test_executable_upload_rejected_before_transfer() {
        let mut h = start(FakeApi::new(), room(1, RoomTier::Free), Some(viewer(Role::Admin)));
        let mut ch = h.open_channel().await;

        let err = h
            .handle
            .upload(file("setup.exe", "application/x-msdownload"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert_eq!(h.api.calls("upload"), 0);
        assert!(ch.try_command().is_none());
        assert!(h.handle.snapshot().await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_upload_announces_attachment() {
        let mut h = start(FakeApi::new(), room(1, RoomTier::Free), Some(viewer(Role::Admin)));
        let mut ch = h.open_channel().await;

        h.handle
            .upload(file("chart.png", "image/png"), None)
            .await
            .unwrap();
        let Some(ChannelCommand::Send(json)) = ch.next_command().await else {
            panic!("Expected Send");
        };
        let frame: ClientFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(frame.message, "[image: chart.png]");
        assert_eq!(frame.file_url.as_deref(), Some("/uploads/images/chart.png"));
    }

    #[tokio::test]
    async fn test_failed_transfer_publishes_nothing() {
        let api = FakeApi::new().failing_uploads();
        let mut h = start(api, room(1, RoomTier::Free), Some(viewer(Role::Admin)));
        let mut ch = h.open_channel().await;
        let err = h
            .handle
            .upload(file("report.pdf", "application/pdf"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UploadFailure(_)));
        assert!(ch.try_command().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_finishing_after_teardown_is_dropped() {
        let api = FakeApi::new().with_delay(Duration::from_secs(10));
        let mut h = start(api, room(1, RoomTier::Free), Some(viewer(Role::Admin)));
        let mut ch = h.open_channel().await;

        let handle = h.handle.clone();
        let pending = tokio::spawn(async move {
            handle.upload(file("chart.png", "image/png"), None).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.api.calls("upload"), 1);

        h.handle.cancel();
        assert_eq!(
            ch.next_command().await,
            Some(ChannelCommand::Close { code: CLOSE_NORMAL })
        );
        h.join.await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert!(ch.try_command().is_none());
    }

    #[tokio::test]
    async fn test_upload_requires_open_channel() {
        let mut h = start(FakeApi::new(), room(1, RoomTier::Free), Some(viewer(Role::Admin)));
        let _pending = h.server.next_channel().await;
        let err = h
            .handle
            .upload(file("chart.png", "image/png"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(h.api.calls("upload"), 0);
    }

    #[tokio::test]
    async fn test_delete_removes_locally() {
        let mut h = start(FakeApi::new(), room(1, RoomTier::Free), Some(viewer(Role::Admin)));
        let ch = h.open_channel().await;
        ch.push(r#"{"type":"message","id":5,"user_id":1,"content":"typo"}"#);
        h.wait_for(|u| matches!(u, SessionUpdate::Inserted(_)).then_some(()))
            .await;

        h.handle.delete_message(MessageId::Server(5)).await.unwrap();
        assert_eq!(h.api.deleted(), vec![5]);
        assert!(h.handle.snapshot().await.unwrap().messages.is_empty());

        // The server's own broadcast of the deletion is now a no-op
        ch.push(r#"{"type":"delete","message_id":5}"#);
        let err = h
            .handle
            .delete_message(MessageId::local())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    #[tokio::test]
    async fn test_member_cannot_delete() {
        let mut h = start(FakeApi::new(), room(1, RoomTier::Free), Some(viewer(Role::Member)));
        let _ch = h.open_channel().await;
        let err = h
            .handle
            .delete_message(MessageId::Server(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Unauthorized(_)));
        assert_eq!(h.api.calls("delete_message"), 0);
    }

    #[tokio::test]
    async fn test_error_frame_surfaces_unauthorized() {
        let mut h = start(FakeApi::new(), room(1, RoomTier::Free), Some(viewer(Role::Member)));
        let ch = h.open_channel().await;
        ch.push(r#"{"type":"error","message":"members cannot post"}"#);
        ch.push("{not json");
        let err = h
            .wait_for(|u| match u {
                SessionUpdate::Error(SessionError::Unauthorized(reason)) => Some(reason.clone()),
                _ => None,
            })
            .await;
        assert_eq!(err, "members cannot post");
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_history_is_discarded() {
        let api = FakeApi::new()
            .with_history(1, &["a", "b"])
            .with_delay(Duration::from_secs(2));
        let mut h = start(api, room(1, RoomTier::Free), None);
        h.handle.reload();
        h.handle.reload();

        h.wait_for(|u| matches!(u, SessionUpdate::HistoryLoaded { .. }).then_some(()))
            .await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        while let Ok(update) = h.updates.try_recv() {
            assert!(
                !matches!(update, SessionUpdate::HistoryLoaded { .. }),
                "stale history applied"
            );
        }
        assert_eq!(h.api.calls("room_messages"), 3);
        assert_eq!(h.handle.snapshot().await.unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_disclaimer_acknowledgment() {
        let mut h = start(FakeApi::new(), room(1, RoomTier::Free), Some(viewer(Role::Member)));
        let _ch = h.open_channel().await;
        assert!(h.handle.snapshot().await.unwrap().disclaimer_required);
        h.handle.acknowledge_disclaimer();
        assert!(!h.handle.snapshot().await.unwrap().disclaimer_required);

        let curator = start(FakeApi::new(), room(1, RoomTier::Free), Some(viewer(Role::Admin)));
        assert!(!curator.handle.snapshot().await.unwrap().disclaimer_required);
    }

    #[tokio::test]
    async fn test_sound_toggle_switches_to_haptics() {
        let mut h = start(FakeApi::new(), room(1, RoomTier::Free), Some(viewer(Role::Member)));
        let ch = h.open_channel().await;
        h.handle.set_sound_enabled(false).await.unwrap();
        ch.push(r#"{"type":"message","id":3,"content":"매도 청산"}"#);
        h.wait_for(|u| matches!(u, SessionUpdate::Alert(_)).then_some(()))
            .await;
        assert_eq!(*h.devices.vibrations.lock().unwrap(), 1);
        assert_eq!(*h.devices.chimes.lock().unwrap(), 0);
        assert!(!h.handle.snapshot().await.unwrap().sound_enabled);
    }
}
