use thiserror::Error;

/// Errors surfaced by the room session engine.
///
/// `Transport` and alert-device failures are recoverable: the session retries
/// or degrades. Everything else is reported to the viewer, but none of them
/// tears down the hosting view.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Missing or expired credential on a gated resource.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Room or message absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Channel closed abnormally or is not open.
    #[error("transport error: {0}")]
    Transport(String),

    /// Rejected before any network call.
    #[error("validation failed: {0}")]
    Validation(String),

    /// REST transfer of an attachment failed; nothing was published.
    #[error("upload failed: {0}")]
    UploadFailure(String),

    /// Inbound frame could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Any other REST failure (server error, bad response body).
    #[error("http error: {0}")]
    Http(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl SessionError {
    /// Whether the engine handles this error on its own (retry or degrade)
    /// instead of surfacing it to the viewer.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol(_))
    }

    /// Short machine-readable code, used when rendering errors to the host.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Transport(_) => "TRANSPORT",
            Self::Validation(_) => "VALIDATION",
            Self::UploadFailure(_) => "UPLOAD_FAILED",
            Self::Protocol(_) => "PROTOCOL",
            Self::Http(_) => "HTTP",
            Self::Config(_) => "CONFIG",
            Self::Storage(_) => "STORAGE",
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
