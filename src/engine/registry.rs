use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::web::rest_client::RoomApi;

use super::capabilities::Viewer;
use super::events::{RoomId, UserId};
use super::rooms::Room;
use super::session::{self, Collaborators, SessionConfig, SessionHandle, SessionUpdate};

type SessionKey = (RoomId, Option<UserId>);

struct Entry {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

/// Live sessions, at most one per (room, viewer).
///
/// Opening a room the viewer already has open replaces the old session, the
/// same way a page refresh replaces a stale connection.
pub struct SessionRegistry<A> {
    collab: Collaborators<A>,
    config: SessionConfig,
    sessions: DashMap<SessionKey, Entry>,
}

impl<A: RoomApi> SessionRegistry<A> {
    pub fn new(collab: Collaborators<A>, config: SessionConfig) -> Self {
        Self {
            collab,
            config,
            sessions: DashMap::new(),
        }
    }

    /// Start a session, tearing down any previous one for the same key first.
    pub async fn open(
        &self,
        room: Room,
        viewer: Option<Viewer>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionUpdate>) {
        let key = (room.id, viewer.as_ref().map(|v| v.id));
        if let Some((_, stale)) = self.sessions.remove(&key) {
            info!(room_id = key.0, viewer_id = ?key.1, "replacing existing session");
            stop(stale).await;
        }

        let (handle, updates, task) =
            session::spawn(self.collab.clone(), self.config.clone(), room, viewer);
        self.sessions.insert(
            key,
            Entry {
                handle: handle.clone(),
                task,
            },
        );
        (handle, updates)
    }

    pub fn get(&self, room_id: RoomId, viewer_id: Option<UserId>) -> Option<SessionHandle> {
        self.sessions
            .get(&(room_id, viewer_id))
            .map(|entry| entry.handle.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Tear down one session (room change, unmount).
    pub async fn close(&self, room_id: RoomId, viewer_id: Option<UserId>) -> bool {
        match self.sessions.remove(&(room_id, viewer_id)) {
            Some((_, entry)) => {
                stop(entry).await;
                true
            }
            None => false,
        }
    }

    /// Tear down every session of a viewer (logout).
    pub async fn close_viewer(&self, viewer_id: UserId) -> usize {
        let keys: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().1 == Some(viewer_id))
            .map(|entry| *entry.key())
            .collect();
        let mut closed = 0;
        for key in keys {
            if self.close(key.0, key.1).await {
                closed += 1;
            }
        }
        closed
    }

    pub async fn shutdown(&self) {
        let keys: Vec<SessionKey> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            self.close(key.0, key.1).await;
        }
    }
}

async fn stop(entry: Entry) {
    entry.handle.cancel();
    // A panicked session task has nothing left to clean up.
    let _ = entry.task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::alerts::{AlertSettings, NoopDevices};
    use crate::engine::capabilities::Role;
    use crate::engine::connection::{CLOSE_NORMAL, ReconnectPolicy};
    use crate::engine::preferences::Preferences;
    use crate::engine::rooms::{AuthorPolicy, RoomTier, RoomType};
    use crate::web::testing::{FakeApi, FakeConnector, FakeServer};
    use crate::web::ws_client::ChannelCommand;
    use std::sync::Arc;

    fn registry() -> (SessionRegistry<FakeApi>, FakeServer) {
        let (connector, server) = FakeConnector::new();
        let collab = Collaborators {
            api: Arc::new(FakeApi::new()),
            connector: Arc::new(connector),
            devices: Arc::new(NoopDevices),
            preferences: Arc::new(Preferences::in_memory()),
        };
        let config = SessionConfig {
            ws_url: "ws://backend".into(),
            reconnect: ReconnectPolicy::default(),
            alerts: AlertSettings::default(),
        };
        (SessionRegistry::new(collab, config), server)
    }

    fn room(id: RoomId) -> Room {
        Room {
            id,
            name: "Stocks".into(),
            room_type: RoomType::Stock,
            tier: RoomTier::Free,
            description: None,
            authoring: AuthorPolicy::CuratorsOnly,
        }
    }

    fn viewer(id: UserId) -> Viewer {
        Viewer {
            id,
            name: format!("user{id}"),
            role: Role::Member,
            approved: true,
            entitlement_expires: None,
            token: "tok".into(),
        }
    }

    #[tokio::test]
    async fn test_reopen_replaces_session() {
        let (registry, mut server) = registry();
        let (first, _updates) = registry.open(room(1), Some(viewer(7))).await;
        let mut first_channel = server.next_channel().await.unwrap();
        first_channel.accept();

        let (second, _updates2) = registry.open(room(1), Some(viewer(7))).await;
        assert_eq!(registry.len(), 1);
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(
            first_channel.next_command().await,
            Some(ChannelCommand::Close { code: CLOSE_NORMAL })
        );
        assert!(server.next_channel().await.is_some());
    }

    #[tokio::test]
    async fn test_distinct_keys_coexist() {
        let (registry, _server) = registry();
        registry.open(room(1), Some(viewer(7))).await;
        registry.open(room(2), Some(viewer(7))).await;
        registry.open(room(1), Some(viewer(8))).await;
        registry.open(room(1), None).await;
        assert_eq!(registry.len(), 4);
        assert!(registry.get(1, None).is_some());
    }

    #[tokio::test]
    async fn test_close_viewer_on_logout() {
        let (registry, _server) = registry();
        registry.open(room(1), Some(viewer(7))).await;
        registry.open(room(2), Some(viewer(7))).await;
        registry.open(room(1), Some(viewer(8))).await;

        assert_eq!(registry.close_viewer(7).await, 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(1, Some(7)).is_none());
        assert!(!registry.close(1, Some(7)).await);

        registry.shutdown().await;
        assert!(registry.is_empty());
    }
}
