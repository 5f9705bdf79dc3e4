use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::engine::connection::CLOSE_NORMAL;
use crate::engine::events::RoomId;

/// Something that happened on the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Handshake completed.
    Opened,
    /// One inbound text frame.
    Frame(String),
    /// The channel is gone. `code` is absent when the socket dropped without a
    /// close frame or the handshake failed.
    Closed { code: Option<u16>, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    Send(String),
    Close { code: u16 },
}

/// Both ends of one channel as seen by the session.
pub struct ChannelHandle {
    pub commands: mpsc::UnboundedSender<ChannelCommand>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Opens realtime channels. Each call is one connection attempt; the handle
/// reports `Opened` or `Closed` first.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, url: &str) -> ChannelHandle;
}

/// Channel URL for a room. The token travels as a query parameter, so the
/// result must never be logged.
pub fn channel_url(ws_base: &str, room_id: RoomId, token: &str) -> String {
    format!(
        "{}/ws/chat/{}?token={}",
        ws_base.trim_end_matches('/'),
        room_id,
        urlencoding::encode(token)
    )
}

/// [`Connector`] over tokio-tungstenite. One task per channel owns the socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, url: &str) -> ChannelHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_channel(url.to_string(), cmd_rx, event_tx));
        ChannelHandle {
            commands: cmd_tx,
            events: event_rx,
        }
    }
}

async fn run_channel(
    url: String,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!(error = %e, "channel handshake failed");
            let _ = events.send(ChannelEvent::Closed {
                code: None,
                reason: e.to_string(),
            });
            return;
        }
    };
    info!("channel open");
    let _ = events.send(ChannelEvent::Opened);

    let (mut sink, mut stream) = ws_stream.split();

    let (code, reason) = loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(ChannelCommand::Send(text)) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        break (None, format!("send failed: {e}"));
                    }
                }
                Some(ChannelCommand::Close { code }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "client shutdown".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break (Some(code), "closed by client".to_string());
                }
                None => {
                    // Session dropped its handle.
                    let _ = sink.close().await;
                    break (Some(CLOSE_NORMAL), "handle dropped".to_string());
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if events.send(ChannelEvent::Frame(text.as_str().to_owned())).is_err() {
                        let _ = sink.close().await;
                        break (Some(CLOSE_NORMAL), "session gone".to_string());
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_owned()),
                        None => (None, "closed without frame".to_string()),
                    };
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(other)) => debug!(kind = ?other, "ignoring non-text frame"),
                Some(Err(e)) => break (None, e.to_string()),
                None => break (None, "stream ended".to_string()),
            },
        }
    };

    info!(code = ?code, %reason, "channel closed");
    let _ = events.send(ChannelEvent::Closed { code, reason });
}
