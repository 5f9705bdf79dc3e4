use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::engine::capabilities::ViewerProfile;
use crate::engine::events::{HistoryRecord, RoomId};
use crate::engine::rooms::RoomRecord;
use crate::engine::upload::{OutgoingFile, UploadKind, UploadedFile};
use crate::error::{Result, SessionError};

/// The backend's REST surface, as seen by the session engine.
///
/// Implemented over HTTP by [`RestClient`] and in memory by
/// [`crate::web::testing::FakeApi`].
pub trait RoomApi: Send + Sync + 'static {
    /// `GET /api/rooms/free` (no credential).
    fn free_rooms(&self) -> impl Future<Output = Result<Vec<RoomRecord>>> + Send;

    /// `GET /api/rooms/paid`. Rejection maps to `Unauthorized`.
    fn paid_rooms(&self, token: &str) -> impl Future<Output = Result<Vec<RoomRecord>>> + Send;

    /// `GET /api/rooms/{id}/messages`, oldest first.
    fn room_messages(
        &self,
        room_id: RoomId,
        token: Option<&str>,
    ) -> impl Future<Output = Result<Vec<HistoryRecord>>> + Send;

    /// `POST /api/upload/image` or `/api/upload/file` (multipart).
    fn upload(
        &self,
        kind: UploadKind,
        file: &OutgoingFile,
        token: &str,
    ) -> impl Future<Output = Result<UploadedFile>> + Send;

    /// `DELETE /api/messages/{id}`.
    fn delete_message(&self, message_id: i64, token: &str)
    -> impl Future<Output = Result<()>> + Send;

    /// `GET /api/me`.
    fn me(&self, token: &str) -> impl Future<Output = Result<ViewerProfile>> + Send;
}

/// HTTP implementation of [`RoomApi`].
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

/// FastAPI-style error body: `{"detail": "..."}`.
#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

impl RestClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("signalroom/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SessionError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    /// Resolve a server-relative attachment URL (e.g. `/uploads/x.png`).
    pub fn absolute_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }
}

/// Pull the human-readable reason out of an error response body.
fn error_detail(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            detail: serde_json::Value::String(s),
        }) => s,
        Ok(ErrorBody { detail }) => detail.to_string(),
        Err(_) => body.trim().to_string(),
    }
}

/// Map a non-success status onto the error taxonomy.
async fn check_status(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = error_detail(&body);
    debug!(%status, %detail, "{what} rejected");
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SessionError::Unauthorized(format!("{what}: {detail}"))
        }
        StatusCode::NOT_FOUND => SessionError::NotFound(format!("{what}: {detail}")),
        _ => SessionError::Http(format!("{what} returned {status}: {detail}")),
    })
}

impl RoomApi for RestClient {
    async fn free_rooms(&self) -> Result<Vec<RoomRecord>> {
        let resp = self.http.get(self.url("/rooms/free")).send().await?;
        Ok(check_status(resp, "free rooms").await?.json().await?)
    }

    async fn paid_rooms(&self, token: &str) -> Result<Vec<RoomRecord>> {
        let resp = self
            .http
            .get(self.url("/rooms/paid"))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(check_status(resp, "paid rooms").await?.json().await?)
    }

    async fn room_messages(
        &self,
        room_id: RoomId,
        token: Option<&str>,
    ) -> Result<Vec<HistoryRecord>> {
        let mut req = self.http.get(self.url(&format!("/rooms/{room_id}/messages")));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        Ok(check_status(resp, "room history").await?.json().await?)
    }

    async fn upload(
        &self,
        kind: UploadKind,
        file: &OutgoingFile,
        token: &str,
    ) -> Result<UploadedFile> {
        let mut part = Part::bytes(file.bytes.clone()).file_name(file.name.clone());
        if let Some(mime) = &file.mime_type {
            part = part
                .mime_str(mime)
                .map_err(|e| SessionError::Validation(format!("bad MIME type {mime}: {e}")))?;
        }
        let form = Form::new().part("file", part);

        let resp = self
            .http
            .post(self.url(kind.endpoint()))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SessionError::UploadFailure(e.to_string()))?;

        let resp = match check_status(resp, "upload").await {
            Ok(resp) => resp,
            Err(SessionError::Unauthorized(reason)) => {
                return Err(SessionError::Unauthorized(reason));
            }
            Err(e) => {
                warn!(file = %file.name, error = %e, "upload rejected");
                return Err(SessionError::UploadFailure(e.to_string()));
            }
        };

        resp.json::<UploadedFile>()
            .await
            .map_err(|e| SessionError::UploadFailure(format!("bad upload response: {e}")))
    }

    async fn delete_message(&self, message_id: i64, token: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/messages/{message_id}")))
            .bearer_auth(token)
            .send()
            .await?;
        check_status(resp, "delete message").await?;
        Ok(())
    }

    async fn me(&self, token: &str) -> Result<ViewerProfile> {
        let resp = self
            .http
            .get(self.url("/me"))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(check_status(resp, "profile").await?.json().await?)
    }
}
