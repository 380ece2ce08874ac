//! Events emitted by the session engine toward front ends.
//!
//! The engine never renders anything itself: it pushes typed events over a
//! bounded channel and the consumer (terminal UI, web shell, tests) decides
//! what they look like. Events are serializable for JSON output modes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use cutline_types::{MediaMeta, ServerEvent, SessionSnapshot};

use crate::connection::ConnectionState;

/// Lifecycle state of one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Running,
    Success,
    Error,
}

impl ToolCallState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ToolCallState::Running)
    }
}

/// Where a tool call's progress value comes from.
///
/// Transitions `Synthetic` → `Reported` exactly once, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    /// Client-side estimate from elapsed time vs. an expected duration.
    Synthetic,
    /// Authoritative values pushed by the server.
    Reported,
}

/// Displayable snapshot of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallView {
    pub id: String,
    pub server: String,
    pub name: String,
    pub args: Value,
    pub state: ToolCallState,
    /// In [0, 1]. Zero in terminal states (no bar is shown for them).
    pub progress: f64,
    pub mode: ProgressMode,
    pub message: String,
    pub summary: Option<Value>,
}

/// Events the engine emits during a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    /// Connection state changed (connect, reconnect wait, user close).
    Connection { state: ConnectionState },

    /// The server no longer knows this session. The stored session
    /// reference has been invalidated; acquire a fresh session to continue.
    SessionLost,

    /// A session snapshot to (re)build UI state from, including history.
    SessionReady { snapshot: SessionSnapshot },

    /// A user message was committed locally (optimistic echo).
    UserCommitted { text: String, attachments: Vec<MediaMeta> },

    /// The authoritative pending-attachment list changed.
    PendingChanged { pending: Vec<MediaMeta> },

    /// The assistant turn opened. `placeholder` asks the consumer to show
    /// a "calling the model" hint until the first render arrives.
    AssistantStarted { placeholder: bool },

    /// Throttled render of the accumulated assistant text.
    AssistantRender { text: String },

    /// The current text segment was sealed (a tool card follows).
    SegmentSealed { text: String },

    /// The current segment had no streamed text and should be removed.
    SegmentDiscarded,

    /// The turn is over. `None` means the turn produced no visible
    /// message at all (elided, not rendered blank).
    AssistantCompleted { text: Option<String> },

    /// A tool invocation was created or updated.
    ToolCallUpdated { call: ToolCallView },

    /// Aggregate progress of the upload batch in flight.
    UploadProgress {
        /// Fraction of total batch bytes confirmed or in flight, in [0, 1].
        fraction: f64,
        file_index: usize,
        file_count: usize,
        file_name: String,
    },

    /// The upload batch finished (successfully or not; failures also
    /// produce a `Notice`).
    UploadIdle,

    /// Transient, user-visible message (capacity truncation, interrupt
    /// failure, upload errors). `retry_after` in seconds when the server
    /// supplied one.
    Notice {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },

    /// Composer-relevant flags changed.
    ComposerState { streaming: bool, canceling: bool, uploading: bool },

    /// The server wiped the conversation.
    ChatCleared,

    /// Pipeline run events, forwarded verbatim for the pipeline UI layer.
    Pipeline { event: ServerEvent },
}

/// Channel-based event sender (async, bounded).
pub type UiEventTx = mpsc::Sender<Arc<UiEvent>>;

/// Channel-based event receiver (async, bounded).
pub type UiEventRx = mpsc::Receiver<Arc<UiEvent>>;

/// Default channel capacity for event streams.
///
/// Set higher (128) to accommodate best-effort render sends without blocking.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Creates a bounded event channel with the default capacity.
pub fn create_event_channel() -> (UiEventTx, UiEventRx) {
    mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}

/// Event sender wrapper providing best-effort and reliable send modes.
///
/// Use `send_render()` for high-volume events (throttled renders, progress
/// ticks) that can be dropped if the consumer is slow. Use
/// `send_important()` for events that must be delivered (turn lifecycle,
/// tool lifecycle, notices, session loss).
#[derive(Clone)]
pub struct EventSender {
    tx: UiEventTx,
}

impl EventSender {
    pub fn new(tx: UiEventTx) -> Self {
        Self { tx }
    }

    /// Best-effort send: never awaits, drops if the channel is full.
    pub fn send_render(&self, ev: UiEvent) {
        let _ = self.tx.try_send(Arc::new(ev));
    }

    /// Reliable send: awaits delivery.
    pub async fn send_important(&self, ev: UiEvent) {
        let _ = self.tx.send(Arc::new(ev)).await;
    }
}
