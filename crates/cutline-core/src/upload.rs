//! Resumable chunked uploads.
//!
//! One file at a time: `init` → sequential `chunk` posts → `complete`.
//! Chunks are never parallelized within a file because the server's
//! completion check counts cumulative bytes in index order. A failed chunk
//! aborts the file, fires a best-effort server-side `cancel` (partial
//! uploads must never linger as orphans) and propagates the error; files
//! already completed in the same batch are unaffected.

use bytes::Bytes;
use tokio::sync::mpsc;

use cutline_types::MediaMeta;

use crate::api::{ApiClient, UploadComplete, UploadInitRequest};
use crate::error::{ClientError, ClientResult};

/// Lifecycle of one file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Initializing,
    Uploading,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

/// One file queued for transfer.
#[derive(Debug, Clone)]
pub struct UploadSource {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    /// Millisecond timestamp of last modification, when known.
    pub last_modified: Option<u64>,
    pub bytes: Bytes,
}

impl UploadSource {
    /// Reads a file from disk, sniffing the mime type from its content.
    pub fn from_path(path: &std::path::Path) -> ClientResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|err| ClientError::transport(format!("{}: {err}", path.display())))?;
        let last_modified = std::fs::metadata(path)
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);
        let mime_type = infer::get(&bytes)
            .map(|k| k.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self {
            name,
            size: bytes.len() as u64,
            mime_type,
            last_modified,
            bytes: Bytes::from(bytes),
        })
    }
}

/// Mutable state of one transfer in flight.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub name: String,
    pub size: u64,
    pub status: UploadStatus,
    /// Bytes confirmed by acknowledged chunks. Monotonic, bounded by `size`.
    pub confirmed: u64,
    pub upload_id: Option<String>,
}

impl UploadTask {
    fn new(src: &UploadSource) -> Self {
        Self {
            name: src.name.clone(),
            size: src.size,
            status: UploadStatus::Initializing,
            confirmed: 0,
            upload_id: None,
        }
    }
}

/// Outcome of the capacity check run before any network call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub accepted: usize,
    pub skipped: usize,
}

/// Applies the pending-attachment capacity policy.
///
/// `remaining` is `max_pending - current_pending`. No room rejects the whole
/// batch; partial room truncates it to the first `remaining` files (the
/// caller surfaces a partial-acceptance notice with the skipped count).
pub fn plan_batch(remaining: usize, requested: usize, max_pending: u32) -> ClientResult<BatchPlan> {
    if requested == 0 {
        return Ok(BatchPlan { accepted: 0, skipped: 0 });
    }
    if remaining == 0 {
        return Err(ClientError::capacity(format!(
            "Pending attachment limit reached (max {max_pending})"
        )));
    }
    let accepted = requested.min(remaining);
    Ok(BatchPlan { accepted, skipped: requested - accepted })
}

/// Aggregate progress over a multi-file batch.
///
/// fraction = (bytes of fully completed files + confirmed bytes of the file
/// currently transferring) / total batch bytes. Completed files move their
/// bytes from `current` to `completed` in one step, so nothing is ever
/// counted twice and the fraction never decreases.
#[derive(Debug, Clone)]
pub struct BatchProgress {
    total: u64,
    completed: u64,
    current: u64,
}

impl BatchProgress {
    pub fn new(total_bytes: u64) -> Self {
        Self { total: total_bytes.max(1), completed: 0, current: 0 }
    }

    /// Records confirmed bytes for the file currently transferring.
    pub fn observe_current(&mut self, confirmed: u64) {
        self.current = self.current.max(confirmed);
    }

    /// Moves the current file's bytes into the completed bucket.
    pub fn complete_file(&mut self, size: u64) {
        self.completed += size;
        self.current = 0;
    }

    pub fn fraction(&self) -> f64 {
        ((self.completed + self.current) as f64 / self.total as f64).min(1.0)
    }
}

/// Progress and completion notifications from a batch task.
///
/// Sent into the runtime's inbox so all session-state mutation stays on the
/// single writer.
#[derive(Debug)]
pub enum UploadEvent {
    Progress {
        fraction: f64,
        file_index: usize,
        file_count: usize,
        file_name: String,
    },
    /// One file finished; carries the authoritative pending list.
    FileCompleted {
        media: MediaMeta,
        pending_media: Vec<MediaMeta>,
    },
    /// The batch is over. `failed` is the error that aborted it, if any.
    BatchFinished { failed: Option<ClientError> },
}

/// Drives the per-file upload protocol for one session.
#[derive(Clone)]
pub struct UploadCoordinator {
    api: ApiClient,
    session_id: String,
    chunk_size_hint: Option<u64>,
}

impl UploadCoordinator {
    pub fn new(api: ApiClient, session_id: String, chunk_size_hint: Option<u64>) -> Self {
        Self { api, session_id, chunk_size_hint }
    }

    /// Uploads one file: init, sequential chunks, complete.
    ///
    /// `on_chunk` receives the per-file confirmed byte count after each
    /// acknowledged chunk.
    ///
    /// # Errors
    /// Returns the first chunk/complete failure after issuing a best-effort
    /// server-side cancel for the partial upload.
    pub async fn upload_file(
        &self,
        src: &UploadSource,
        task: &mut UploadTask,
        mut on_chunk: impl FnMut(u64),
    ) -> ClientResult<UploadComplete> {
        let init = self
            .api
            .init_upload(
                &self.session_id,
                &UploadInitRequest {
                    filename: src.name.clone(),
                    size: src.size,
                    mime_type: src.mime_type.clone(),
                    last_modified: src.last_modified,
                    chunk_size: self.chunk_size_hint,
                },
            )
            .await?;

        task.upload_id = Some(init.upload_id.clone());
        task.status = UploadStatus::Uploading;

        // The server's chunking parameters win over any local suggestion.
        let chunk_size = init.chunk_size.max(1);

        let result = async {
            for index in 0..init.total_chunks {
                let start = (u64::from(index) * chunk_size).min(src.size);
                let end = (start + chunk_size).min(src.size);
                let chunk = src.bytes.slice(start as usize..end as usize);
                self.api
                    .upload_chunk(&self.session_id, &init.upload_id, index, chunk)
                    .await?;
                task.confirmed = (task.confirmed + (end - start)).min(src.size);
                on_chunk(task.confirmed);
            }
            task.status = UploadStatus::Completing;
            self.api.complete_upload(&self.session_id, &init.upload_id).await
        }
        .await;

        match result {
            Ok(done) => {
                task.status = UploadStatus::Completed;
                Ok(done)
            }
            Err(err) => {
                task.status = UploadStatus::Failed;
                self.api.cancel_upload(&self.session_id, &init.upload_id).await;
                Err(err)
            }
        }
    }

    /// Uploads a batch sequentially, reporting aggregate progress per chunk.
    ///
    /// The first failing file ends the batch; earlier completed files stay
    /// completed (their pending entries were already confirmed server-side).
    pub async fn run_batch(
        &self,
        sources: Vec<UploadSource>,
        tx: mpsc::UnboundedSender<UploadEvent>,
    ) {
        let total: u64 = sources.iter().map(|s| s.size).sum();
        let mut progress = BatchProgress::new(total);
        let file_count = sources.len();

        for (i, src) in sources.iter().enumerate() {
            let mut task = UploadTask::new(src);
            let file_index = i + 1;

            let result = self
                .upload_file(src, &mut task, |confirmed| {
                    progress.observe_current(confirmed);
                    let _ = tx.send(UploadEvent::Progress {
                        fraction: progress.fraction(),
                        file_index,
                        file_count,
                        file_name: src.name.clone(),
                    });
                })
                .await;

            match result {
                Ok(done) => {
                    progress.complete_file(src.size);
                    let _ = tx.send(UploadEvent::Progress {
                        fraction: progress.fraction(),
                        file_index,
                        file_count,
                        file_name: src.name.clone(),
                    });
                    let _ = tx.send(UploadEvent::FileCompleted {
                        media: done.media,
                        pending_media: done.pending_media,
                    });
                }
                Err(err) => {
                    let _ = tx.send(UploadEvent::BatchFinished { failed: Some(err) });
                    return;
                }
            }
        }

        let _ = tx.send(UploadEvent::BatchFinished { failed: None });
    }
}
