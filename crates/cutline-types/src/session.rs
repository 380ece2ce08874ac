//! Session snapshot and media metadata as pushed by the server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-assigned limits for a session.
///
/// Defaults match the server's documented configuration so a snapshot from
/// an older server (missing the `limits` block) still yields sane values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLimits {
    /// Hard cap on media ever loaded into the session.
    pub max_media_per_session: u32,
    /// Cap on uploaded-but-unsent attachments.
    pub max_pending_media_per_session: u32,
    /// Effective chunk size for resumable uploads, in bytes.
    pub upload_chunk_bytes: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_media_per_session: 30,
            max_pending_media_per_session: 30,
            upload_chunk_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Public metadata for one media item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMeta {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Server-side classification: "video", "image", "audio", ...
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub thumb_url: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
}

/// One replayable conversation item, discriminated by `role`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum HistoryItem {
    User {
        #[serde(default)]
        content: String,
        #[serde(default)]
        attachments: Vec<MediaMeta>,
    },
    Assistant {
        #[serde(default)]
        content: String,
    },
    Tool {
        tool_call_id: String,
        #[serde(default)]
        server: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        state: String,
        #[serde(default)]
        args: Value,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        summary: Option<Value>,
    },
}

/// Full session state as returned by the session endpoints and pushed as
/// the `session.snapshot` event.
///
/// Server snapshots are authoritative: applying one overwrites any locally
/// tracked pending list or limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub developer_mode: bool,
    #[serde(default)]
    pub pending_media: Vec<MediaMeta>,
    #[serde(default)]
    pub history: Vec<HistoryItem>,
    #[serde(default)]
    pub limits: SessionLimits,
}
