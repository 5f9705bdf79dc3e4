use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::{Result, SessionError};
use crate::web::rest_client::RoomApi;

use super::capabilities::Capabilities;
use super::events::{ClientFrame, MessageKind};

/// Image extensions the backend stores.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Document extensions the backend stores.
pub const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "xls", "xlsx", "txt", "zip"];

pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;
pub const MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Image,
    Document,
}

impl UploadKind {
    /// Pick the kind for a dropped file: anything with an image MIME type is
    /// an image, everything else a document.
    pub fn infer(file: &OutgoingFile) -> Self {
        if file.has_image_mime() {
            Self::Image
        } else {
            Self::Document
        }
    }

    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Image => "/upload/image",
            Self::Document => "/upload/file",
        }
    }

    pub fn message_kind(&self) -> MessageKind {
        match self {
            Self::Image => MessageKind::Image,
            Self::Document => MessageKind::File,
        }
    }

    fn max_bytes(&self) -> usize {
        match self {
            Self::Image => MAX_IMAGE_BYTES,
            Self::Document => MAX_DOCUMENT_BYTES,
        }
    }

    fn allowed_extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Image => IMAGE_EXTENSIONS,
            Self::Document => DOCUMENT_EXTENSIONS,
        }
    }
}

/// A file the viewer wants to attach.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl OutgoingFile {
    /// Read a file from disk. The MIME type is derived from the extension.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| SessionError::Validation(format!("cannot read {}: {e}", path.display())))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SessionError::Validation(format!("bad file name: {}", path.display())))?
            .to_string();
        let mime_type = mime_for_extension(&name).map(str::to_string);
        Ok(Self {
            name,
            mime_type,
            bytes,
        })
    }

    /// Lowercased extension without the dot.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
    }

    pub fn has_image_mime(&self) -> bool {
        self.mime_type
            .as_deref()
            .is_some_and(|m| m.starts_with("image/"))
    }
}

fn mime_for_extension(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_str()?.to_lowercase();
    Some(match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "zip" => "application/zip",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => return None,
    })
}

/// Storage reference returned by the upload endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadedFile {
    pub url: String,
    pub filename: String,
}

/// Reject a file before any network call: capability first, then file
/// acceptability (MIME type for images, extension allow-list, size).
pub fn validate(caps: Capabilities, file: &OutgoingFile, kind: UploadKind) -> Result<()> {
    if !caps.can_upload() {
        return Err(SessionError::Unauthorized(
            "only admins and staff can upload".into(),
        ));
    }
    if file.bytes.is_empty() {
        return Err(SessionError::Validation(format!("{} is empty", file.name)));
    }
    if kind == UploadKind::Image && !file.has_image_mime() {
        return Err(SessionError::Validation(format!(
            "{} is not an image",
            file.name
        )));
    }

    let ext = file.extension().unwrap_or_default();
    if !kind.allowed_extensions().contains(&ext.as_str()) {
        return Err(SessionError::Validation(format!(
            "unsupported file type: .{ext}"
        )));
    }

    if file.bytes.len() > kind.max_bytes() {
        return Err(SessionError::Validation(format!(
            "{} exceeds {} MiB",
            file.name,
            kind.max_bytes() / (1024 * 1024)
        )));
    }
    Ok(())
}

/// Frame announcing a stored attachment on the live channel.
pub fn announcement(kind: UploadKind, uploaded: &UploadedFile) -> ClientFrame {
    let label = match kind {
        UploadKind::Image => "image",
        UploadKind::Document => "file",
    };
    ClientFrame {
        message: format!("[{label}: {}]", uploaded.filename),
        kind: kind.message_kind(),
        file_url: Some(uploaded.url.clone()),
        file_name: Some(uploaded.filename.clone()),
    }
}

/// Transfer a validated file over REST and build its announcement.
/// Nothing is returned for publication if the transfer fails.
pub async fn transfer<A: RoomApi>(
    api: &A,
    token: &str,
    file: &OutgoingFile,
    kind: UploadKind,
) -> Result<ClientFrame> {
    let uploaded = api.upload(kind, file, token).await?;
    info!(file = %file.name, url = %uploaded.url, "attachment stored");
    Ok(announcement(kind, &uploaded))
}
