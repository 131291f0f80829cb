//! Resumable, progress-tracked blob uploads.
//!
//! Each [`UploadTask`] runs in its own tokio task, writing its source in
//! chunks to the blob store and publishing progress on a watch channel. The
//! status only moves forward (pending, active, then one terminal state) and
//! every transition is persisted so interrupted tasks can be listed and
//! resumed from the bytes the blob store already holds.
//!
//! Cancellation races with the transfer. The worker re-checks the status
//! before every chunk, before sealing the blob and before publishing the
//! address; whichever transition lands first under the task lock wins.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use safeline_shared::{SafelineError, UploadError};
use safeline_store::{BlobStore, Database, StoreError, UploadRecord, UploadStatus};

/// Where the bytes of an upload come from.
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// Bytes already in memory (e.g. a freshly captured photo).
    Memory { name: String, data: Bytes },
    /// A file on disk, read when the task is submitted.
    File(PathBuf),
}

impl UploadSource {
    pub fn memory(name: &str, data: impl Into<Bytes>) -> Self {
        Self::Memory {
            name: name.to_string(),
            data: data.into(),
        }
    }

    fn file_name(&self) -> String {
        match self {
            Self::Memory { name, .. } => name.clone(),
            Self::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    fn source_ref(&self) -> String {
        match self {
            Self::Memory { name, .. } => format!("memory:{name}"),
            Self::File(path) => path.display().to_string(),
        }
    }

    async fn load(self) -> Result<Bytes, UploadError> {
        match self {
            Self::Memory { data, .. } => Ok(data),
            Self::File(path) => tokio::fs::read(&path)
                .await
                .map(Bytes::from)
                .map_err(|e| UploadError::Source(format!("{}: {e}", path.display()))),
        }
    }
}

/// Blob key for a task: the task id plus a filesystem-safe file name.
fn destination_key(id: Uuid, file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let safe = safe.replace("..", "_");
    let safe = safe.trim_matches('.');
    if safe.is_empty() {
        format!("{}-blob", id.simple())
    } else {
        format!("{}-{safe}", id.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub status: UploadStatus,
}

impl UploadProgress {
    fn of(record: &UploadRecord) -> Self {
        Self {
            bytes_transferred: record.bytes_transferred,
            bytes_total: record.bytes_total,
            status: record.status,
        }
    }

    /// Rounded percentage. Reaches 100 only once the task has completed.
    pub fn percent(&self) -> u8 {
        if self.status == UploadStatus::Completed {
            return 100;
        }
        if self.bytes_total == 0 {
            return 0;
        }
        let pct = (self.bytes_transferred as f64 / self.bytes_total as f64 * 100.0).round();
        (pct as u8).min(99)
    }
}

struct TaskState {
    record: UploadRecord,
    error: Option<UploadError>,
}

struct Shared {
    key: String,
    state: Mutex<TaskState>,
    progress: watch::Sender<UploadProgress>,
    blobs: Arc<dyn BlobStore>,
    db: Arc<Mutex<Database>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TaskState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn status(&self) -> UploadStatus {
        self.lock().record.status
    }

    /// Apply `f` to the record if the task may move to `next`, then publish
    /// and persist. Returns whether the transition happened.
    fn advance(&self, next: UploadStatus, f: impl FnOnce(&mut TaskState)) -> bool {
        let mut state = self.lock();
        if !state.record.status.can_advance_to(next) {
            return false;
        }
        state.record.status = next;
        f(&mut state);
        self.commit(&mut state);
        true
    }

    /// Record transferred bytes while the task is still active.
    fn record_bytes(&self, transferred: u64) -> bool {
        let mut state = self.lock();
        if state.record.status != UploadStatus::Active {
            return false;
        }
        state.record.bytes_transferred = state.record.bytes_transferred.max(transferred);
        self.commit(&mut state);
        true
    }

    fn commit(&self, state: &mut TaskState) {
        state.record.updated_at = Utc::now();
        self.progress.send_replace(UploadProgress::of(&state.record));
        let saved = self
            .db
            .lock()
            .map_err(|_| StoreError::LockPoisoned)
            .and_then(|db| db.save_upload(&state.record));
        if let Err(e) = saved {
            warn!(task_id = %state.record.id, error = %e, "Failed to persist upload task");
        }
    }

    fn fail(&self, error: UploadError) {
        let reason = error.clone();
        if self.advance(UploadStatus::Failed, |state| state.error = Some(reason)) {
            warn!(key = %self.key, error = %error, "Upload failed");
        }
    }

    fn outcome(&self) -> Result<String, UploadError> {
        let state = self.lock();
        match state.record.status {
            UploadStatus::Completed => state
                .record
                .address
                .clone()
                .ok_or_else(|| UploadError::Transfer("completed without an address".to_string())),
            UploadStatus::Cancelled => Err(UploadError::Cancelled),
            _ => Err(state
                .error
                .clone()
                .unwrap_or_else(|| UploadError::Transfer("upload did not finish".to_string()))),
        }
    }
}

/// A tracked, cancellable transfer of one blob.
#[derive(Clone)]
pub struct UploadTask {
    shared: Arc<Shared>,
}

impl UploadTask {
    pub fn id(&self) -> Uuid {
        self.shared.lock().record.id
    }

    pub fn destination_key(&self) -> &str {
        &self.shared.key
    }

    pub fn record(&self) -> UploadRecord {
        self.shared.lock().record.clone()
    }

    pub fn status(&self) -> UploadStatus {
        self.shared.status()
    }

    pub fn progress(&self) -> watch::Receiver<UploadProgress> {
        self.shared.progress.subscribe()
    }

    /// Cancel a pending or active task. Returns `false` if it had already
    /// reached a terminal state.
    pub async fn cancel(&self) -> bool {
        if !self.shared.advance(UploadStatus::Cancelled, |_| {}) {
            return false;
        }
        info!(key = %self.shared.key, "Upload cancelled");
        if let Err(e) = self.shared.blobs.abort(&self.shared.key).await {
            warn!(key = %self.shared.key, error = %e, "Failed to discard cancelled blob");
        }
        true
    }

    /// Wait for the terminal state. Only a completed task yields an address.
    pub async fn wait(&self) -> Result<String, UploadError> {
        let mut rx = self.shared.progress.subscribe();
        if rx.wait_for(|p| p.status.is_terminal()).await.is_err() {
            return Err(UploadError::Transfer("progress channel closed".to_string()));
        }
        self.shared.outcome()
    }
}

impl std::fmt::Debug for UploadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTask")
            .field("key", &self.shared.key)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Starts upload tasks against one blob store.
pub struct UploadPipeline {
    blobs: Arc<dyn BlobStore>,
    db: Arc<Mutex<Database>>,
    chunk_size: usize,
    max_size: u64,
}

impl UploadPipeline {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        db: Arc<Mutex<Database>>,
        chunk_size: usize,
        max_size: u64,
    ) -> Self {
        Self {
            blobs,
            db,
            chunk_size: chunk_size.max(1),
            max_size,
        }
    }

    /// Read `source` and start transferring it. Fails straight away, with
    /// no task created, if the source cannot be read or is too large.
    pub async fn submit(&self, source: UploadSource) -> Result<UploadTask, UploadError> {
        let id = Uuid::new_v4();
        let key = destination_key(id, &source.file_name());
        let source_ref = source.source_ref();
        let data = source.load().await?;
        let record = UploadRecord {
            id,
            source_ref,
            destination_key: key,
            bytes_total: data.len() as u64,
            bytes_transferred: 0,
            status: UploadStatus::Pending,
            address: None,
            updated_at: Utc::now(),
        };
        self.start(record, data)
    }

    /// Restart an interrupted task from the bytes the blob store already
    /// holds. `source` must be the same content the task was created with.
    pub async fn resume(&self, id: Uuid, source: UploadSource) -> Result<UploadTask, UploadError> {
        let record = self
            .db
            .lock()
            .map_err(|_| StoreError::LockPoisoned)
            .and_then(|db| db.get_upload(id))
            .map_err(|e| UploadError::Source(format!("upload task {id}: {e}")))?;
        if record.status.is_terminal() {
            return Err(UploadError::Source(format!(
                "upload task {id} already {}",
                record.status
            )));
        }
        let data = source.load().await?;
        if data.len() as u64 != record.bytes_total {
            return Err(UploadError::Source(format!(
                "source is {} bytes, task expects {}",
                data.len(),
                record.bytes_total
            )));
        }
        info!(task_id = %id, "Resuming upload");
        self.start(record, data)
    }

    pub fn list(&self, status: Option<UploadStatus>) -> Result<Vec<UploadRecord>, SafelineError> {
        let db = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(db.list_uploads(status)?)
    }

    fn start(&self, record: UploadRecord, data: Bytes) -> Result<UploadTask, UploadError> {
        if record.bytes_total > self.max_size {
            return Err(UploadError::TooLarge {
                size: record.bytes_total,
                max: self.max_size,
            });
        }

        let (progress, _) = watch::channel(UploadProgress::of(&record));
        let shared = Arc::new(Shared {
            key: record.destination_key.clone(),
            state: Mutex::new(TaskState {
                record,
                error: None,
            }),
            progress,
            blobs: Arc::clone(&self.blobs),
            db: Arc::clone(&self.db),
        });
        {
            let mut state = shared.lock();
            shared.commit(&mut state);
        }

        debug!(key = %shared.key, "Upload submitted");
        let worker = Arc::clone(&shared);
        let chunk_size = self.chunk_size;
        tokio::spawn(async move {
            if let Err(e) = transfer(&worker, data, chunk_size).await {
                if e != UploadError::Cancelled {
                    worker.fail(e);
                }
            }
        });

        Ok(UploadTask { shared })
    }
}

async fn transfer(shared: &Shared, data: Bytes, chunk_size: usize) -> Result<(), UploadError> {
    let key = shared.key.as_str();
    let total = data.len() as u64;
    let mut offset = shared
        .blobs
        .pending_len(key)
        .await
        .map_err(|e| UploadError::Transfer(e.to_string()))?
        .min(total);

    // A resumed task is already active.
    let resumed = shared.status() == UploadStatus::Active;
    if !resumed && !shared.advance(UploadStatus::Active, |_| {}) {
        return Err(UploadError::Cancelled);
    }
    shared.record_bytes(offset);

    while offset < total {
        if shared.status() != UploadStatus::Active {
            return discard(shared).await;
        }
        let end = (offset + chunk_size as u64).min(total);
        if let Err(e) = shared
            .blobs
            .write_chunk(key, offset, &data[offset as usize..end as usize])
            .await
        {
            let error = match e {
                StoreError::BlobTooLarge { size, max } => UploadError::TooLarge { size, max },
                other => UploadError::Transfer(other.to_string()),
            };
            if let Err(e) = shared.blobs.abort(key).await {
                debug!(key, error = %e, "Failed to discard partial blob");
            }
            return Err(error);
        }
        offset = end;
        shared.record_bytes(offset);
    }

    if shared.status() != UploadStatus::Active {
        return discard(shared).await;
    }
    let address = shared
        .blobs
        .finalize(key)
        .await
        .map_err(|e| UploadError::Transfer(e.to_string()))?;

    let published = shared.advance(UploadStatus::Completed, |state| {
        state.record.bytes_transferred = total;
        state.record.address = Some(address);
    });
    if published {
        info!(key, bytes = total, "Upload completed");
        Ok(())
    } else {
        // Sealed after a cancel landed; the blob stays unreferenced.
        debug!(key, "Discarded completion of cancelled upload");
        Err(UploadError::Cancelled)
    }
}

async fn discard(shared: &Shared) -> Result<(), UploadError> {
    debug!(key = %shared.key, "Upload stopped before completion");
    if let Err(e) = shared.blobs.abort(&shared.key).await {
        debug!(key = %shared.key, error = %e, "Failed to discard partial blob");
    }
    Err(UploadError::Cancelled)
}
