//! The session runtime: one task owning all mutable session state.
//!
//! Commands from the handle, frames from the connection and internal timer
//! messages (synthetic ticks, deferred renders, upload progress) all drain
//! into one select loop. Components mutate state only from this loop, so
//! the engine needs no locks — the channels feeding the loop are the
//! serialization boundary. Network requests and timers run as spawned
//! tasks that report back through the inbox.

use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cutline_types::{ClientMessage, MediaMeta, ServerEvent, SessionSnapshot};

use crate::api::ApiClient;
use crate::config::{Config, paths};
use crate::connection::{self, ConnectionConfig, ConnectionEvent, ConnectionHandle};
use crate::error::{ClientErrorKind, ClientResult};
use crate::events::{EventSender, UiEvent, UiEventRx, create_event_channel};
use crate::session::Session;
use crate::stream::StreamRenderer;
use crate::tools::ToolCallTracker;
use crate::turn::{SendSource, TurnController, TurnEffect};
use crate::upload::{UploadCoordinator, UploadEvent, UploadSource, plan_batch};

/// Commands accepted by the runtime.
#[derive(Debug)]
pub enum Command {
    SendPrompt {
        text: String,
        source: SendSource,
        service_config: Option<Value>,
    },
    Interrupt,
    UploadFiles { paths: Vec<PathBuf> },
    DeletePending { media_id: String },
    SetLang { lang: String },
    PipelineStart { template_id: String },
    PipelineConfirm { node_id: String, params: Value },
    Shutdown,
}

/// Cloneable handle for driving a running session.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    pub fn send_prompt(&self, text: impl Into<String>, source: SendSource) {
        let _ = self.cmd_tx.send(Command::SendPrompt {
            text: text.into(),
            source,
            service_config: None,
        });
    }

    pub fn send_prompt_with_config(
        &self,
        text: impl Into<String>,
        source: SendSource,
        service_config: Option<Value>,
    ) {
        let _ = self.cmd_tx.send(Command::SendPrompt { text: text.into(), source, service_config });
    }

    pub fn interrupt(&self) {
        let _ = self.cmd_tx.send(Command::Interrupt);
    }

    pub fn upload_files(&self, paths: Vec<PathBuf>) {
        let _ = self.cmd_tx.send(Command::UploadFiles { paths });
    }

    pub fn delete_pending(&self, media_id: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::DeletePending { media_id: media_id.into() });
    }

    pub fn set_lang(&self, lang: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::SetLang { lang: lang.into() });
    }

    pub fn pipeline_start(&self, template_id: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::PipelineStart { template_id: template_id.into() });
    }

    pub fn pipeline_confirm(&self, node_id: impl Into<String>, params: Value) {
        let _ = self.cmd_tx.send(Command::PipelineConfirm { node_id: node_id.into(), params });
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

/// A connected session: the handle to drive it and the event stream to
/// render from.
pub struct ChatClient {
    pub handle: ClientHandle,
    pub events: UiEventRx,
    pub session_id: String,
}

impl ChatClient {
    /// Acquires a session (reusing `stored` when the server still knows
    /// it), connects the persistent channel and spawns the runtime.
    ///
    /// # Errors
    /// Returns an error when no session can be acquired at all.
    pub async fn start(config: Config, stored: Option<String>) -> ClientResult<Self> {
        let api = ApiClient::new(&config.base_url);
        let snapshot = acquire_session(&api, stored.as_deref()).await?;
        Ok(Self::start_with_snapshot(config, api, snapshot))
    }

    /// Spawns the runtime for an already-acquired session snapshot.
    pub fn start_with_snapshot(config: Config, api: ApiClient, snapshot: SessionSnapshot) -> Self {
        let session_id = snapshot.session_id.clone();
        let session = Session::from_snapshot(&snapshot, Some(&config.lang));

        let (conn, conn_rx) = connection::connect(ConnectionConfig {
            url: config.ws_url(&session_id),
            heartbeat_interval: config.heartbeat_interval(),
            reconnect_delay: config.reconnect_delay(),
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = create_event_channel();

        let tracker = ToolCallTracker::new(config.tool_ui.clone(), tick_tx);
        let renderer = StreamRenderer::new(config.render_interval(), due_tx);
        let events = EventSender::new(event_tx);

        let runtime = Runtime {
            config,
            api,
            session,
            snapshot_lang: snapshot.lang.clone(),
            controller: TurnController::new(),
            tracker,
            renderer,
            conn,
            conn_rx,
            cmd_rx,
            tick_rx,
            due_rx,
            inbox_rx,
            inbox_tx,
            events,
        };
        tokio::spawn(runtime.run(snapshot));

        Self { handle: ClientHandle { cmd_tx }, events: event_rx, session_id }
    }
}

/// Resolves a session snapshot: stored id first, fresh session otherwise.
/// A stale stored id is invalidated on disk before falling back.
pub async fn acquire_session(
    api: &ApiClient,
    stored: Option<&str>,
) -> ClientResult<SessionSnapshot> {
    if let Some(id) = stored {
        match api.get_session(id).await {
            Ok(snapshot) => return Ok(snapshot),
            Err(err) if err.kind == ClientErrorKind::SessionNotFound => {
                info!(session_id = id, "stored session is gone; creating a new one");
                clear_session_ref();
            }
            Err(err) => return Err(err),
        }
    }
    api.create_session().await
}

/// Reads the persisted session id, if any.
pub fn load_session_ref() -> Option<String> {
    let id = std::fs::read_to_string(paths::session_ref_path()).ok()?;
    let id = id.trim().to_string();
    (!id.is_empty()).then_some(id)
}

/// Persists the session id for the next run.
pub fn save_session_ref(session_id: &str) {
    let path = paths::session_ref_path();
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    if let Err(err) = std::fs::write(&path, session_id) {
        warn!(error = %err, "failed to persist session reference");
    }
}

/// Drops the persisted session id (session-not-found handling).
pub fn clear_session_ref() {
    let _ = std::fs::remove_file(paths::session_ref_path());
}

/// Internal messages from spawned tasks back into the runtime loop.
#[derive(Debug)]
enum InboxMsg {
    Upload(UploadEvent),
    CancelFailed(String),
    PendingDeleted(ClientResult<Vec<MediaMeta>>),
}

struct Runtime {
    config: Config,
    api: ApiClient,
    session: Session,
    snapshot_lang: Option<String>,
    controller: TurnController,
    tracker: ToolCallTracker,
    renderer: StreamRenderer,
    conn: ConnectionHandle,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    tick_rx: mpsc::UnboundedReceiver<String>,
    due_rx: mpsc::UnboundedReceiver<()>,
    inbox_rx: mpsc::UnboundedReceiver<InboxMsg>,
    inbox_tx: mpsc::UnboundedSender<InboxMsg>,
    events: EventSender,
}

impl Runtime {
    async fn run(mut self, snapshot: SessionSnapshot) {
        self.events.send_important(UiEvent::SessionReady { snapshot }).await;

        // Local language preference wins; push it so the server's session
        // state follows the client.
        if self.snapshot_lang.as_deref() != Some(self.session.lang.as_str()) {
            self.conn.send(ClientMessage::SetLang { lang: self.session.lang.clone() });
        }

        loop {
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => {
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Some(ev) = self.conn_rx.recv() => {
                    if self.handle_connection_event(ev).await {
                        break;
                    }
                }
                Some(id) = self.tick_rx.recv() => {
                    if let Some(view) = self.tracker.on_tick(&id) {
                        self.events.send_render(UiEvent::ToolCallUpdated { call: view });
                    }
                }
                Some(()) = self.due_rx.recv() => {
                    if let Some(ev) = self.renderer.on_render_due() {
                        self.events.send_render(ev);
                    }
                }
                Some(msg) = self.inbox_rx.recv() => self.handle_inbox(msg).await,
                else => break,
            }
        }
    }

    /// Returns true when the runtime should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SendPrompt { text, source, service_config } => {
                let effects =
                    self.controller.send_prompt(&mut self.session, &text, source, service_config);
                self.execute_effects(effects).await;
            }
            Command::Interrupt => {
                let effects = self.controller.interrupt();
                self.execute_effects(effects).await;
            }
            Command::UploadFiles { paths } => self.start_upload(paths).await,
            Command::DeletePending { media_id } => {
                let api = self.api.clone();
                let session_id = self.session.id.clone();
                let inbox = self.inbox_tx.clone();
                tokio::spawn(async move {
                    let result = api.delete_pending(&session_id, &media_id).await;
                    let _ = inbox.send(InboxMsg::PendingDeleted(result));
                });
            }
            Command::SetLang { lang } => {
                self.session.lang = lang.clone();
                self.conn.send(ClientMessage::SetLang { lang });
            }
            Command::PipelineStart { template_id } => {
                self.conn.send(ClientMessage::PipelineStart { template_id });
            }
            Command::PipelineConfirm { node_id, params } => {
                self.conn.send(ClientMessage::PipelineConfirmResponse { node_id, params });
            }
            Command::Shutdown => {
                self.conn.close();
                return true;
            }
        }
        false
    }

    async fn handle_connection_event(&mut self, ev: ConnectionEvent) -> bool {
        match ev {
            ConnectionEvent::StateChanged(state) => {
                self.events.send_important(UiEvent::Connection { state }).await;
            }
            ConnectionEvent::SessionLost => {
                // Unrecoverable locally: drop the stored reference so the
                // next start acquires a fresh session.
                clear_session_ref();
                self.events.send_important(UiEvent::SessionLost).await;
                return true;
            }
            ConnectionEvent::Frame(frame) => self.handle_server_event(frame).await,
        }
        false
    }

    async fn handle_server_event(&mut self, ev: ServerEvent) {
        match ev {
            ServerEvent::Snapshot(snapshot) => {
                self.session.apply_snapshot(&snapshot);
                self.events.send_important(UiEvent::SessionReady { snapshot }).await;
            }
            ServerEvent::ChatUser { pending_media, .. } => {
                // The server's pending list wins over our optimistic clear.
                self.session.set_pending(pending_media.clone());
                self.events
                    .send_important(UiEvent::PendingChanged { pending: pending_media })
                    .await;
            }
            ServerEvent::AssistantStart {} => {
                let effects = self.controller.on_assistant_start();
                self.execute_effects(effects).await;
                let started = self.renderer.begin();
                self.events.send_important(started).await;
            }
            ServerEvent::AssistantDelta { delta } => {
                for ev in self.renderer.append_delta(&delta) {
                    match ev {
                        UiEvent::AssistantRender { .. } => self.events.send_render(ev),
                        other => self.events.send_important(other).await,
                    }
                }
            }
            ServerEvent::AssistantFlush {} => {
                if let Some(ev) = self.renderer.flush_segment() {
                    self.events.send_important(ev).await;
                }
            }
            ServerEvent::AssistantEnd { text, .. } => {
                let effects = self.controller.on_turn_finished();
                self.execute_effects(effects).await;
                let done = self.renderer.finalize(&text);
                self.events.send_important(done).await;
            }
            ServerEvent::ToolStart { tool_call_id, server, name, args } => {
                if let Some(view) = self.tracker.on_start(&tool_call_id, &server, &name, args) {
                    self.events.send_important(UiEvent::ToolCallUpdated { call: view }).await;
                }
            }
            ServerEvent::ToolProgress { tool_call_id, server, name, progress, message } => {
                if let Some(view) =
                    self.tracker.on_progress(&tool_call_id, &server, &name, progress, message)
                {
                    self.events.send_important(UiEvent::ToolCallUpdated { call: view }).await;
                }
            }
            ServerEvent::ToolEnd { tool_call_id, is_error, summary, .. } => {
                if let Some(view) = self.tracker.on_end(&tool_call_id, is_error, summary) {
                    self.events.send_important(UiEvent::ToolCallUpdated { call: view }).await;
                }
            }
            ServerEvent::ChatCleared { .. } => {
                let effects = self.controller.on_turn_finished();
                self.execute_effects(effects).await;
                self.tracker.clear();
                let done = self.renderer.finalize("");
                self.events.send_important(done).await;
                self.events.send_important(UiEvent::ChatCleared).await;
            }
            ServerEvent::Error { message, partial_text } => {
                let effects = self.controller.on_turn_finished();
                self.execute_effects(effects).await;
                let done = self.renderer.finalize(partial_text.as_deref().unwrap_or(""));
                self.events.send_important(done).await;
                self.events
                    .send_important(UiEvent::Notice { message, retry_after: None })
                    .await;
            }
            pipeline @ (ServerEvent::PipelineStarted { .. }
            | ServerEvent::PipelineProgress { .. }
            | ServerEvent::PipelineConfirm { .. }
            | ServerEvent::PipelineConfirmAck {}
            | ServerEvent::PipelineDone {}
            | ServerEvent::PipelineError { .. }
            | ServerEvent::PipelineCancelled {}) => {
                self.events.send_important(UiEvent::Pipeline { event: pipeline }).await;
            }
        }
    }

    async fn start_upload(&mut self, paths: Vec<PathBuf>) {
        if self.controller.is_uploading() {
            self.events
                .send_important(UiEvent::Notice {
                    message: "An upload is already in progress.".to_string(),
                    retry_after: None,
                })
                .await;
            return;
        }
        if paths.is_empty() {
            return;
        }

        let max_pending = self.session.limits.max_pending_media_per_session;
        let plan = match plan_batch(self.session.pending_remaining(), paths.len(), max_pending) {
            Ok(plan) => plan,
            Err(err) => {
                // Capacity violations are rejected before any network call.
                self.events
                    .send_important(UiEvent::Notice {
                        message: err.message,
                        retry_after: None,
                    })
                    .await;
                return;
            }
        };

        if plan.skipped > 0 {
            self.events
                .send_important(UiEvent::Notice {
                    message: format!(
                        "Attachment limit: accepting {} of {} files ({} skipped, max {} pending).",
                        plan.accepted,
                        paths.len(),
                        plan.skipped,
                        max_pending,
                    ),
                    retry_after: None,
                })
                .await;
        }

        let accepted: Vec<PathBuf> = paths.into_iter().take(plan.accepted).collect();
        let effects = self.controller.set_uploading(true);
        self.execute_effects(effects).await;

        let coordinator = UploadCoordinator::new(
            self.api.clone(),
            self.session.id.clone(),
            self.config.upload_chunk_bytes,
        );
        let inbox = self.inbox_tx.clone();
        let (upload_tx, mut upload_rx) = mpsc::unbounded_channel();
        let forward = self.inbox_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = upload_rx.recv().await {
                if forward.send(InboxMsg::Upload(ev)).is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            // Files are read off the runtime task; a read failure aborts
            // the batch like any other upload error.
            let mut sources = Vec::with_capacity(accepted.len());
            for path in &accepted {
                match UploadSource::from_path(path) {
                    Ok(src) => sources.push(src),
                    Err(err) => {
                        let _ = inbox
                            .send(InboxMsg::Upload(UploadEvent::BatchFinished { failed: Some(err) }));
                        return;
                    }
                }
            }
            coordinator.run_batch(sources, upload_tx).await;
        });
    }

    async fn handle_inbox(&mut self, msg: InboxMsg) {
        match msg {
            InboxMsg::Upload(UploadEvent::Progress {
                fraction,
                file_index,
                file_count,
                file_name,
            }) => {
                self.events.send_render(UiEvent::UploadProgress {
                    fraction,
                    file_index,
                    file_count,
                    file_name,
                });
            }
            InboxMsg::Upload(UploadEvent::FileCompleted { pending_media, .. }) => {
                self.session.set_pending(pending_media.clone());
                self.events
                    .send_important(UiEvent::PendingChanged { pending: pending_media })
                    .await;
            }
            InboxMsg::Upload(UploadEvent::BatchFinished { failed }) => {
                let effects = self.controller.set_uploading(false);
                self.execute_effects(effects).await;
                if let Some(err) = failed {
                    self.events
                        .send_important(UiEvent::Notice {
                            message: format!("Upload failed: {}", err.message),
                            retry_after: err.retry_after,
                        })
                        .await;
                }
                self.events.send_important(UiEvent::UploadIdle).await;
            }
            InboxMsg::CancelFailed(message) => {
                let effects = self.controller.on_cancel_failed(&message);
                self.execute_effects(effects).await;
            }
            InboxMsg::PendingDeleted(Ok(pending)) => {
                self.session.set_pending(pending.clone());
                self.events.send_important(UiEvent::PendingChanged { pending }).await;
            }
            InboxMsg::PendingDeleted(Err(err)) => {
                self.events
                    .send_important(UiEvent::Notice {
                        message: format!("Delete failed: {}", err.message),
                        retry_after: err.retry_after,
                    })
                    .await;
            }
        }
    }

    async fn execute_effects(&mut self, effects: Vec<TurnEffect>) {
        for effect in effects {
            match effect {
                TurnEffect::Ui(ev) => self.events.send_important(ev).await,
                TurnEffect::SendWs(msg) => {
                    debug!(?msg, "outbound");
                    self.conn.send(msg);
                }
                TurnEffect::RequestCancel => {
                    let api = self.api.clone();
                    let session_id = self.session.id.clone();
                    let inbox = self.inbox_tx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = api.cancel_turn(&session_id).await {
                            let _ = inbox.send(InboxMsg::CancelFailed(err.to_string()));
                        }
                    });
                }
            }
        }
    }
}
