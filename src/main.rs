use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use signalroom_client::config::ClientConfig;
use signalroom_client::db::pool::{create_pool, run_migrations};
use signalroom_client::engine::alerts::{AlertDevices, DeviceError, PopupId};
use signalroom_client::engine::capabilities::Viewer;
use signalroom_client::engine::events::{Message, MessageId, Payload, RoomId};
use signalroom_client::engine::preferences::Preferences;
use signalroom_client::engine::registry::SessionRegistry;
use signalroom_client::engine::rooms::resolve_room;
use signalroom_client::engine::session::{Collaborators, SessionHandle, SessionUpdate};
use signalroom_client::engine::upload::{OutgoingFile, UploadKind};
use signalroom_client::web::rest_client::{RestClient, RoomApi};
use signalroom_client::web::ws_client::WsConnector;

/// Watch a trading room from the terminal.
#[derive(Parser)]
#[command(name = "signalroom", version)]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "signalroom.toml")]
    config: PathBuf,

    /// Room to open.
    #[arg(long)]
    room: RoomId,

    /// Bearer token. Without one the room is read as a guest.
    #[arg(long)]
    token: Option<String>,

    /// Allow desktop notifications (logged to stderr).
    #[arg(long)]
    notify: bool,
}

/// Terminal cues: the bell for the chime, stderr for notifications.
struct TerminalDevices {
    audio_unlocked: AtomicBool,
    notifications: bool,
}

impl AlertDevices for TerminalDevices {
    fn unlock_audio(&self) -> Result<(), DeviceError> {
        self.audio_unlocked.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn play_chime(&self) -> Result<(), DeviceError> {
        if !self.audio_unlocked.load(Ordering::Relaxed) {
            return Err(DeviceError::Locked);
        }
        let mut out = std::io::stdout();
        out.write_all(b"\x07")
            .and_then(|_| out.flush())
            .map_err(|e| DeviceError::Failed(e.to_string()))
    }

    fn vibrate(&self, _pattern_ms: &[u64]) -> Result<(), DeviceError> {
        Err(DeviceError::Unavailable)
    }

    fn notification_permitted(&self) -> bool {
        self.notifications
    }

    fn notify(&self, title: &str, body: &str) -> Result<(), DeviceError> {
        info!(%title, %body, "notification");
        Ok(())
    }
}

/// A line typed by the viewer.
#[derive(Debug, PartialEq, Eq)]
enum HostCommand {
    Send(String),
    Image(PathBuf),
    Upload(PathBuf),
    Delete(i64),
    Dismiss(u64),
    Mute,
    Unmute,
    Reload,
    Acknowledge,
    Show,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<HostCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(HostCommand::Send(line.to_string()));
    };
    let (cmd, arg) = rest.split_once(' ').unwrap_or((rest, ""));
    let arg = arg.trim();
    Some(match (cmd, arg) {
        ("image", path) if !path.is_empty() => HostCommand::Image(PathBuf::from(path)),
        ("upload", path) if !path.is_empty() => HostCommand::Upload(PathBuf::from(path)),
        ("delete", id) => match id.parse() {
            Ok(id) => HostCommand::Delete(id),
            Err(_) => HostCommand::Unknown(line.to_string()),
        },
        ("dismiss", id) => match id.parse() {
            Ok(id) => HostCommand::Dismiss(id),
            Err(_) => HostCommand::Unknown(line.to_string()),
        },
        ("mute", _) => HostCommand::Mute,
        ("unmute", _) => HostCommand::Unmute,
        ("reload", _) => HostCommand::Reload,
        ("ack", _) => HostCommand::Acknowledge,
        ("show", _) => HostCommand::Show,
        _ => HostCommand::Unknown(line.to_string()),
    })
}

fn render(message: &Message) -> String {
    let time = message.timestamp.format("%H:%M:%S");
    let id = match message.id {
        MessageId::Server(id) => format!("#{id}"),
        MessageId::Local(_) => "-".to_string(),
    };
    let body = match &message.payload {
        Payload::Text(text) => text.clone(),
        Payload::Attachment(attachment) => {
            format!("[{}] {} <{}>", message.kind.as_str(), attachment.name, attachment.url)
        }
    };
    format!("[{time}] {id} {}: {body}", message.author_label())
}

async fn run_command(handle: &SessionHandle, command: HostCommand) -> signalroom_client::error::Result<()> {
    match command {
        HostCommand::Send(text) => handle.send_text(text).await,
        HostCommand::Image(path) => upload(handle, &path, Some(UploadKind::Image)).await,
        HostCommand::Upload(path) => upload(handle, &path, None).await,
        HostCommand::Delete(id) => handle.delete_message(MessageId::Server(id)).await,
        HostCommand::Dismiss(id) => {
            handle.dismiss_popup(PopupId(id));
            Ok(())
        }
        HostCommand::Mute => handle.set_sound_enabled(false).await,
        HostCommand::Unmute => handle.set_sound_enabled(true).await,
        HostCommand::Reload => {
            handle.reload();
            Ok(())
        }
        HostCommand::Acknowledge => {
            handle.acknowledge_disclaimer();
            Ok(())
        }
        HostCommand::Show => {
            let snapshot = handle.snapshot().await?;
            println!(
                "== {} | {} | {} messages | sound {} ==",
                snapshot.room.label(),
                snapshot.connection.as_str(),
                snapshot.messages.len(),
                if snapshot.sound_enabled { "on" } else { "off" }
            );
            for message in &snapshot.messages {
                println!("{}", render(message));
            }
            Ok(())
        }
        HostCommand::Unknown(line) => {
            warn!(%line, "unknown command");
            Ok(())
        }
    }
}

async fn upload(
    handle: &SessionHandle,
    path: &Path,
    kind: Option<UploadKind>,
) -> signalroom_client::error::Result<()> {
    let file = OutgoingFile::from_path(path).await?;
    handle.upload(file, kind).await
}

async fn print_updates(mut updates: mpsc::UnboundedReceiver<SessionUpdate>) {
    while let Some(update) = updates.recv().await {
        match update {
            SessionUpdate::Inserted(message) => println!("{}", render(&message)),
            SessionUpdate::Notice(message) => {
                println!("-- {}", message.text().unwrap_or_default());
            }
            SessionUpdate::Removed(id) => println!("-- message {id} deleted"),
            SessionUpdate::Alert(outcome) => println!(
                "!! SIGNAL [{}] {} (popup {})",
                outcome.popup.room_label, outcome.popup.content, outcome.popup.id.0
            ),
            SessionUpdate::HistoryLoaded { added } => info!(added, "history applied"),
            SessionUpdate::Connection(state) => info!(state = state.as_str(), "connection"),
            SessionUpdate::Capabilities(caps) => info!(capabilities = ?caps, "capabilities"),
            SessionUpdate::PopupClosed(_) => {}
            SessionUpdate::Error(e) => warn!(code = e.code(), error = %e, "session error"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the room log.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ClientConfig::load(&args.config).context("failed to load configuration")?;

    let pool = match config.database_url() {
        Some(url) => {
            let pool = create_pool(url)
                .await
                .context("failed to open preference store")?;
            run_migrations(&pool)
                .await
                .context("failed to run database migrations")?;
            Some(pool)
        }
        None => None,
    };
    let preferences = Arc::new(Preferences::load(pool).await);

    let api = Arc::new(RestClient::new(&config.api.base_url, config.request_timeout())?);

    let viewer = match args.token {
        Some(token) => {
            let profile = api.me(&token).await.context("failed to fetch profile")?;
            let viewer = Viewer::from_profile(profile, token);
            info!(
                viewer = %viewer.name,
                role = viewer.role.as_str(),
                days_remaining = ?viewer.days_remaining(Utc::now()),
                "signed in"
            );
            Some(viewer)
        }
        None => None,
    };

    let room = resolve_room(api.as_ref(), args.room, viewer.as_ref())
        .await
        .with_context(|| format!("cannot open room {}", args.room))?;
    info!(room = %room.label(), kind = room.room_type.label(), "room resolved");

    let devices = Arc::new(TerminalDevices {
        audio_unlocked: AtomicBool::new(false),
        notifications: args.notify,
    });
    let collab = Collaborators {
        api,
        connector: Arc::new(WsConnector),
        devices,
        preferences,
    };
    let registry = SessionRegistry::new(collab, config.session_config());
    let (handle, updates) = registry.open(room, viewer).await;
    tokio::spawn(print_updates(updates));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping gracefully...");
        }
        shutdown.cancel();
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut gesture_seen = false;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        let Some(line) = line else {
            break;
        };
        if !gesture_seen {
            handle.unlock_audio();
            gesture_seen = true;
        }
        if let Some(command) = parse_command(&line)
            && let Err(e) = run_command(&handle, command).await
        {
            warn!(code = e.code(), error = %e, "command failed");
        }
    }

    registry.shutdown().await;
    info!("signalroom stopped");
    Ok(())
}
