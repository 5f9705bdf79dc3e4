use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::queries::preferences::{self as queries, SOUND_ENABLED};
use crate::error::Result;

/// Viewer settings shared by every session in the process.
///
/// The sound toggle is durable when a database is configured and falls back
/// to memory otherwise. Disclaimer acknowledgment is never persisted: it lasts
/// as long as the process.
pub struct Preferences {
    /// Optional database pool. When present, the sound toggle is persisted.
    db: Option<SqlitePool>,
    sound_enabled: AtomicBool,
    disclaimer_acknowledged: AtomicBool,
}

impl Preferences {
    /// Sound is on until the viewer turns it off.
    pub fn in_memory() -> Self {
        Self {
            db: None,
            sound_enabled: AtomicBool::new(true),
            disclaimer_acknowledged: AtomicBool::new(false),
        }
    }

    /// Load the persisted toggle. A read failure keeps the default rather
    /// than failing the session.
    pub async fn load(db: Option<SqlitePool>) -> Self {
        let mut sound = true;
        if let Some(pool) = &db {
            match queries::get_flag(pool, SOUND_ENABLED).await {
                Ok(Some(stored)) => sound = stored,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to read sound preference"),
            }
        }
        info!(sound_enabled = sound, persisted = db.is_some(), "preferences loaded");
        Self {
            db,
            sound_enabled: AtomicBool::new(sound),
            disclaimer_acknowledged: AtomicBool::new(false),
        }
    }

    pub fn sound_enabled(&self) -> bool {
        self.sound_enabled.load(Ordering::Relaxed)
    }

    /// Update the toggle and write it through to storage. The in-memory value
    /// changes even if the write fails.
    pub(crate) async fn set_sound_enabled(&self, enabled: bool) -> Result<()> {
        self.sound_enabled.store(enabled, Ordering::Relaxed);
        if let Some(pool) = &self.db {
            queries::set_flag(pool, SOUND_ENABLED, enabled).await?;
        }
        Ok(())
    }

    pub fn disclaimer_acknowledged(&self) -> bool {
        self.disclaimer_acknowledged.load(Ordering::Relaxed)
    }

    pub fn acknowledge_disclaimer(&self) {
        self.disclaimer_acknowledged.store(true, Ordering::Relaxed);
    }
}

impl Default for Preferences {
    fn default() -> Self {
        Self::in_memory()
    }
}
