use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::timeout;

use signalroom_client::engine::alerts::{AlertDevices, AlertSettings, DeviceError};
use signalroom_client::engine::capabilities::{self, Role, Viewer};
use signalroom_client::engine::connection::{
    ConnectionAction, ConnectionManager, ConnectionState, ReconnectPolicy,
};
use signalroom_client::engine::events::{Message, MessageId, MessageKind, Origin, Payload};
use signalroom_client::engine::preferences::Preferences;
use signalroom_client::engine::reconciler::MessageLog;
use signalroom_client::engine::rooms::{AuthorPolicy, Room, RoomTier, RoomType, resolve_room};
use signalroom_client::engine::session::{self, Collaborators, SessionConfig, SessionUpdate};
use signalroom_client::engine::signals::classify;
use signalroom_client::engine::upload::OutgoingFile;
use signalroom_client::error::SessionError;
use signalroom_client::web::testing::{FakeApi, FakeConnector, FakeServer};

#[derive(Default)]
struct CountingDevices {
    chimes: AtomicU32,
}

impl AlertDevices for CountingDevices {
    fn unlock_audio(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn play_chime(&self) -> Result<(), DeviceError> {
        self.chimes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn vibrate(&self, _pattern_ms: &[u64]) -> Result<(), DeviceError> {
        Err(DeviceError::Unavailable)
    }

    fn notification_permitted(&self) -> bool {
        false
    }

    fn notify(&self, _title: &str, _body: &str) -> Result<(), DeviceError> {
        Err(DeviceError::PermissionDenied)
    }
}

fn room(id: i64, tier: RoomTier) -> Room {
    Room {
        id,
        name: "Crypto".into(),
        room_type: RoomType::Crypto,
        tier,
        description: None,
        authoring: AuthorPolicy::CuratorsOnly,
    }
}

fn viewer(role: Role) -> Viewer {
    Viewer {
        id: 21,
        name: "choi".into(),
        role,
        approved: true,
        entitlement_expires: Some(Utc::now() + chrono::Duration::days(30)),
        token: "token-21".into(),
    }
}

struct Running {
    handle: session::SessionHandle,
    updates: mpsc::UnboundedReceiver<SessionUpdate>,
    server: FakeServer,
    api: Arc<FakeApi>,
    devices: Arc<CountingDevices>,
}

fn start(api: FakeApi, room: Room, viewer: Option<Viewer>) -> Running {
    let api = Arc::new(api);
    let devices = Arc::new(CountingDevices::default());
    let (connector, server) = FakeConnector::new();
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
    let (handle, updates, _task) = session::spawn(collab, config, room, viewer);
    Running {
        handle,
        updates,
        server,
        api,
        devices,
    }
}

async fn next(updates: &mut mpsc::UnboundedReceiver<SessionUpdate>) -> SessionUpdate {
    timeout(Duration::from_secs(10), updates.recv())
        .await
        .expect("timed out")
        .expect("session ended")
}

fn text(id: i64, content: &str) -> Message {
    Message {
        id: MessageId::Server(id),
        author: None,
        kind: MessageKind::Text,
        payload: Payload::Text(content.into()),
        timestamp: Utc::now(),
        origin: Origin::Live,
    }
}

#[tokio::test]
async fn test_guest_in_free_room_sees_history_only() {
    let api = FakeApi::new()
        .with_free_room(1, "Notice")
        .with_history(1, &["market opens 09:00", "holiday schedule", "welcome"]);
    let room = resolve_room(&api, 1, None).await.unwrap();
    let mut run = start(api, room, None);

    loop {
        match next(&mut run.updates).await {
            SessionUpdate::Capabilities(caps) => {
                assert!(caps.can_read());
                assert!(!caps.can_author());
                assert!(!caps.can_upload());
                assert!(!caps.can_delete());
            }
            SessionUpdate::HistoryLoaded { added } => {
                assert_eq!(added, 3);
                break;
            }
            _ => {}
        }
    }

    let snap = run.handle.snapshot().await.unwrap();
    assert_eq!(snap.messages.len(), 3);
    assert_eq!(snap.connection, ConnectionState::Idle);
    assert!(snap.disclaimer_required);
    assert!(run.server.try_channel().is_none());
}

#[tokio::test]
async fn test_member_receives_signal_alert_once() {
    let api = FakeApi::new().with_paid_room(4, "VIP crypto");
    let member = viewer(Role::Member);
    let room = resolve_room(&api, 4, Some(&member)).await.unwrap();
    let mut run = start(api, room, Some(member));

    let channel = run.server.next_channel().await.unwrap();
    assert!(channel.url.ends_with("/ws/chat/4?token=token-21"));
    channel.accept();
    channel.push(
        r#"{"type":"message","id":100,"user_id":1,"user_name":"desk","user_role":"admin","content":"BUY EURUSD now","message_type":"signal"}"#,
    );

    let mut inserted = 0;
    let popup = loop {
        match next(&mut run.updates).await {
            SessionUpdate::Inserted(_) => inserted += 1,
            SessionUpdate::Alert(outcome) => break outcome.popup,
            _ => {}
        }
    };
    assert_eq!(inserted, 1);
    assert_eq!(popup.content, "BUY EURUSD now");
    assert_eq!(popup.room_label, "VIP crypto (premium)");
    assert_eq!(run.devices.chimes.load(Ordering::SeqCst), 1);

    let snap = run.handle.snapshot().await.unwrap();
    assert_eq!(snap.messages.len(), 1);
    assert_eq!(snap.popups.len(), 1);
}

#[tokio::test]
async fn test_executable_upload_is_rejected_locally() {
    let mut run = start(FakeApi::new(), room(2, RoomTier::Free), Some(viewer(Role::Admin)));
    let channel = run.server.next_channel().await.unwrap();
    channel.accept();
    loop {
        if let SessionUpdate::Connection(ConnectionState::Open) = next(&mut run.updates).await {
            break;
        }
    }

    let exe = OutgoingFile {
        name: "installer.exe".into(),
        mime_type: Some("application/x-msdownload".into()),
        bytes: vec![0x4d, 0x5a],
    };
    let err = run.handle.upload(exe, None).await.unwrap_err();
    assert!(matches!(err, SessionError::Validation(_)));
    assert_eq!(run.api.calls("upload"), 0);
    assert!(run.handle.snapshot().await.unwrap().messages.is_empty());
}

#[test]
fn test_two_quick_closures_leave_one_timer() {
    let mut manager = ConnectionManager::new(ReconnectPolicy::default());
    let member = viewer(Role::Member);
    manager.connect(Some(&member));
    manager.on_open();

    let first = manager.on_closed(Some(1006));
    let second = manager.on_closed(Some(1006));

    let pending_after_first: Vec<_> = first
        .iter()
        .filter(|a| matches!(a, ConnectionAction::ScheduleReconnect { .. }))
        .collect();
    assert_eq!(pending_after_first.len(), 1);

    let cancelled = second
        .iter()
        .filter(|a| matches!(a, ConnectionAction::CancelReconnect { .. }))
        .count();
    let scheduled: Vec<_> = second
        .iter()
        .filter_map(|a| match a {
            ConnectionAction::ScheduleReconnect { timer, delay } => Some((*timer, *delay)),
            _ => None,
        })
        .collect();
    assert_eq!(cancelled, 1);
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].1, Duration::from_secs(5));
    assert_eq!(manager.pending_timer(), Some(scheduled[0].0));
}

#[test]
fn test_capability_properties() {
    let lapsed = Viewer {
        entitlement_expires: Some(Utc::now() - chrono::Duration::days(1)),
        ..viewer(Role::Member)
    };
    for tier in [RoomTier::Free, RoomTier::Paid] {
        let caps = capabilities::resolve(None, &room(1, tier));
        assert!(!caps.can_author());
        assert!(!caps.can_delete());
    }
    assert!(!capabilities::resolve(Some(&lapsed), &room(1, RoomTier::Paid)).can_read());
}

#[test]
fn test_reconciler_properties() {
    let mut log = MessageLog::new();
    log.insert(text(1, "a"));
    log.insert(text(1, "a"));
    assert_eq!(log.len(), 1);

    assert!(!log.remove(&MessageId::Server(404)));
    assert_eq!(log.len(), 1);
}

#[test]
fn test_classifier_vocabulary() {
    for content in ["BUY", "SELL", "OPEN", "매수", "매도"] {
        assert!(classify(&text(1, content)), "{content}");
    }
    let tagged = Message {
        kind: MessageKind::Signal,
        ..text(2, "no keywords here")
    };
    assert!(classify(&tagged));
}
