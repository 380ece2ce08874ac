//! Messages exchanged over the persistent session channel.
//!
//! Every frame is a JSON envelope `{"type": "...", "data": {...}}`. Type
//! names are dotted (`chat.send`, `assistant.delta`); serde's adjacent
//! tagging maps them onto enum variants.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{MediaMeta, SessionSnapshot};

/// Close code the server uses when the requested session does not exist.
///
/// Unlike every other closure this one is fatal: the client must drop its
/// persisted session reference and acquire a fresh session.
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4404;

/// Client-to-server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    /// Send a user message, attaching previously uploaded media.
    #[serde(rename = "chat.send")]
    ChatSend {
        text: String,
        attachment_ids: Vec<String>,
        lang: String,
        /// Opaque per-request service overrides (models, TTS, search keys).
        /// Composed by the front end; the engine forwards it untouched.
        #[serde(skip_serializing_if = "Option::is_none")]
        service_config: Option<Value>,
    },

    /// Persist a language switch on the server side of the session.
    #[serde(rename = "session.set_lang")]
    SetLang { lang: String },

    /// Heartbeat keepalive. The server ignores the payload.
    #[serde(rename = "ping")]
    Ping {},

    /// Start a pipeline template run.
    #[serde(rename = "pipeline.start")]
    PipelineStart { template_id: String },

    /// Answer a pipeline confirmation prompt.
    #[serde(rename = "pipeline.confirm_response")]
    PipelineConfirmResponse { node_id: String, params: Value },
}

/// Server-to-client frames.
///
/// Unknown types and malformed payloads fail deserialization; the
/// connection layer drops such frames without surfacing an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Full session state push (on connect, or after server-side changes).
    #[serde(rename = "session.snapshot")]
    Snapshot(SessionSnapshot),

    /// Acknowledges a user message; carries the authoritative pending list.
    #[serde(rename = "chat.user")]
    ChatUser {
        #[serde(default)]
        text: String,
        #[serde(default)]
        attachments: Vec<MediaMeta>,
        #[serde(default)]
        pending_media: Vec<MediaMeta>,
    },

    /// The assistant turn has started streaming.
    #[serde(rename = "assistant.start")]
    AssistantStart {},

    /// Incremental assistant text.
    #[serde(rename = "assistant.delta")]
    AssistantDelta {
        #[serde(default)]
        delta: String,
    },

    /// Seal the current text segment (a tool card follows).
    #[serde(rename = "assistant.flush")]
    AssistantFlush {},

    /// The turn is over. A non-empty `text` is authoritative and replaces
    /// whatever the client accumulated.
    #[serde(rename = "assistant.end")]
    AssistantEnd {
        #[serde(default)]
        text: String,
        #[serde(default)]
        interrupted: bool,
    },

    /// A tool invocation has started.
    #[serde(rename = "tool.start")]
    ToolStart {
        tool_call_id: String,
        #[serde(default)]
        server: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        args: Value,
    },

    /// Authoritative progress for a running tool invocation.
    ///
    /// Fields are optional so updates apply as typed patches: a field
    /// present on the wire wins, an absent field retains the previous value.
    #[serde(rename = "tool.progress")]
    ToolProgress {
        tool_call_id: String,
        #[serde(default)]
        server: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: Option<String>,
    },

    /// A tool invocation has finished.
    #[serde(rename = "tool.end")]
    ToolEnd {
        tool_call_id: String,
        #[serde(default)]
        server: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        summary: Option<Value>,
    },

    /// The server wiped the conversation.
    #[serde(rename = "chat.cleared")]
    ChatCleared {
        #[serde(default)]
        ok: bool,
    },

    /// Turn-level failure. `partial_text` preserves streamed output.
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
        #[serde(default)]
        partial_text: Option<String>,
    },

    /// Pipeline run lifecycle. The engine forwards these untouched.
    #[serde(rename = "pipeline.started")]
    PipelineStarted {
        #[serde(default)]
        template_name: String,
        #[serde(default)]
        nodes: Vec<Value>,
    },
    #[serde(rename = "pipeline.progress")]
    PipelineProgress {
        #[serde(default)]
        node_id: String,
        #[serde(default)]
        status: String,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "pipeline.confirm")]
    PipelineConfirm {
        #[serde(default)]
        node_id: String,
        #[serde(default)]
        params: Value,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    #[serde(rename = "pipeline.confirm_ack")]
    PipelineConfirmAck {},
    #[serde(rename = "pipeline.done")]
    PipelineDone {},
    #[serde(rename = "pipeline.error")]
    PipelineError {
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "pipeline.cancelled")]
    PipelineCancelled {},
}

impl ClientMessage {
    /// Serializes the message into its wire envelope.
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"ping","data":{}}"#.to_string())
    }
}

impl ServerEvent {
    /// Parses an inbound text frame. `None` means the frame is malformed or
    /// of an unknown type and should be dropped.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}
