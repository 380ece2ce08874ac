//! Request/response API client (session lifecycle + resumable uploads).
//!
//! Everything that is not the persistent channel goes through here: session
//! acquisition, turn cancellation, the chunked upload protocol and
//! pending-media deletion. Error bodies are decoded into [`ClientError`]
//! so retry hints reach the user.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cutline_types::{MediaMeta, SessionSnapshot};

use crate::error::{ClientError, ClientResult};

/// Request body for `media/init`.
#[derive(Debug, Clone, Serialize)]
pub struct UploadInitRequest {
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    /// Millisecond timestamp of the file's last modification, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
    /// Suggested chunk size; the server may ignore it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

/// Response of `media/init`: the server-assigned upload identity and the
/// effective chunking parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadInit {
    pub upload_id: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
}

/// Response of `media/{upload_id}/complete`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadComplete {
    pub media: MediaMeta,
    #[serde(default)]
    pub pending_media: Vec<MediaMeta>,
}

#[derive(Debug, Clone, Deserialize)]
struct PendingMediaList {
    #[serde(default)]
    pending_media: Vec<MediaMeta>,
}

/// HTTP client for the service API.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{path}", self.base_url)
    }

    /// Creates a fresh session and returns its snapshot.
    pub async fn create_session(&self) -> ClientResult<SessionSnapshot> {
        let resp = self.http.post(self.url("/sessions")).send().await?;
        read_json(resp).await
    }

    /// Fetches the snapshot of an existing session.
    ///
    /// A 404 surfaces as [`crate::error::ClientErrorKind::SessionNotFound`];
    /// callers drop the stored session reference and create a new one.
    pub async fn get_session(&self, session_id: &str) -> ClientResult<SessionSnapshot> {
        let resp = self
            .http
            .get(self.url(&format!("/sessions/{session_id}")))
            .send()
            .await?;
        read_json(resp).await
    }

    /// Requests interruption of the in-flight turn.
    ///
    /// The turn only ends when `assistant.end` arrives on the channel; this
    /// call merely asks the server to wind it down.
    pub async fn cancel_turn(&self, session_id: &str) -> ClientResult<Value> {
        let resp = self
            .http
            .post(self.url(&format!("/sessions/{session_id}/cancel")))
            .send()
            .await?;
        read_json(resp).await
    }

    /// Opens a resumable upload for one file.
    pub async fn init_upload(
        &self,
        session_id: &str,
        req: &UploadInitRequest,
    ) -> ClientResult<UploadInit> {
        let resp = self
            .http
            .post(self.url(&format!("/sessions/{session_id}/media/init")))
            .json(req)
            .send()
            .await?;
        read_json(resp).await
    }

    /// Uploads one chunk. Chunks carry a zero-based index and must be sent
    /// in order; the server's completion check counts cumulative bytes.
    pub async fn upload_chunk(
        &self,
        session_id: &str,
        upload_id: &str,
        index: u32,
        chunk: Bytes,
    ) -> ClientResult<()> {
        let part = reqwest::multipart::Part::bytes(chunk.to_vec()).file_name("chunk");
        let form = reqwest::multipart::Form::new()
            .text("index", index.to_string())
            .part("chunk", part);
        let resp = self
            .http
            .post(self.url(&format!("/sessions/{session_id}/media/{upload_id}/chunk")))
            .multipart(form)
            .send()
            .await?;
        expect_success(resp).await
    }

    /// Finalizes an upload; the server assembles the chunks and returns the
    /// new media plus the refreshed pending list.
    pub async fn complete_upload(
        &self,
        session_id: &str,
        upload_id: &str,
    ) -> ClientResult<UploadComplete> {
        let resp = self
            .http
            .post(self.url(&format!("/sessions/{session_id}/media/{upload_id}/complete")))
            .send()
            .await?;
        read_json(resp).await
    }

    /// Best-effort server-side cleanup of a failed upload.
    ///
    /// Errors are logged and swallowed: the file upload already failed and
    /// the caller is about to surface that; a cleanup failure must not mask
    /// it. The server garbage-collects stale uploads eventually anyway.
    pub async fn cancel_upload(&self, session_id: &str, upload_id: &str) {
        let result = self
            .http
            .post(self.url(&format!("/sessions/{session_id}/media/{upload_id}/cancel")))
            .send()
            .await;
        if let Err(err) = result {
            tracing::debug!(upload_id, error = %err, "upload cancel request failed");
        }
    }

    /// Deletes one pending attachment; returns the refreshed pending list.
    pub async fn delete_pending(
        &self,
        session_id: &str,
        media_id: &str,
    ) -> ClientResult<Vec<MediaMeta>> {
        let resp = self
            .http
            .delete(self.url(&format!("/sessions/{session_id}/media/pending/{media_id}")))
            .send()
            .await?;
        let list: PendingMediaList = read_json(resp).await?;
        Ok(list.pending_media)
    }
}

async fn expect_success(resp: reqwest::Response) -> ClientResult<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::http_status(status.as_u16(), &body))
}

async fn read_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> ClientResult<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::http_status(status.as_u16(), &body));
    }
    let body = resp.text().await?;
    serde_json::from_str(&body)
        .map_err(|err| ClientError::parse(format!("Failed to parse response: {err}")))
}
