//! Upload orchestration: prepare, deliver chunks in order, finalize.
//!
//! Encryption runs on a blocking thread a few chunks ahead of the network
//! and hands chunks over through the spool. Delivery is strictly
//! sequential. Every exit path removes the spool; a cancelled or failed
//! upload never reaches finalize.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::encrypt::{EncryptedChunks, FileEncryptionEngine, PreparedUpload};
use crate::metadata::FileMetadata;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::spool::{self, Spool, SpooledChunk};
use crate::{join_error, until_cancelled};
use filenvault_api::{ChunkTarget, ClientConfig, DoneRequest, PrepareRequest};
use filenvault_common::{Error, FolderRef, RemoteId, Result};
use filenvault_crypto::ChunkGeometry;
use filenvault_vault::Session;

/// Chunks the encryption thread may spool ahead of delivery.
const SPOOL_AHEAD: usize = 2;

/// Upload lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Prepared,
    ChunksInFlight,
    Finalizing,
    Done,
    Failed,
}

impl UploadState {
    /// Whether `next` may follow `self`.
    pub fn can_advance_to(self, next: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (self, next),
            (Idle, Prepared)
                | (Prepared, ChunksInFlight)
                | (ChunksInFlight, Finalizing)
                | (Finalizing, Done)
                | (Idle | Prepared | ChunksInFlight | Finalizing, Failed)
        )
    }

    /// Whether the upload has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Done | UploadState::Failed)
    }
}

/// Progress snapshot published while an upload runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub state: UploadState,
    pub chunks_sent: u64,
    pub chunks_total: u64,
}

impl Default for UploadProgress {
    fn default() -> Self {
        Self {
            state: UploadState::Idle,
            chunks_sent: 0,
            chunks_total: 0,
        }
    }
}

/// Result of a finished upload.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Identifier of the new remote file.
    pub uuid: RemoteId,
    /// Metadata stored with it.
    pub metadata: FileMetadata,
    /// Chunks delivered.
    pub chunks: u64,
}

struct UploadRun<'a> {
    progress: &'a watch::Sender<UploadProgress>,
}

impl UploadRun<'_> {
    fn state(&self) -> UploadState {
        self.progress.borrow().state
    }

    fn advance(&self, next: UploadState) {
        let current = self.state();
        if !current.can_advance_to(next) {
            warn!(?current, ?next, "Ignoring invalid upload transition");
            return;
        }
        self.progress.send_modify(|p| p.state = next);
        debug!(state = ?next, "Upload state");
    }

    fn set_total(&self, total: u64) {
        self.progress.send_modify(|p| p.chunks_total = total);
    }

    fn chunk_sent(&self) {
        self.progress.send_modify(|p| p.chunks_sent += 1);
    }
}

fn prepare_failed(err: Error) -> Error {
    match err {
        Error::Api { message, .. } => Error::Prepare(message),
        e if e.is_transient() => Error::Prepare(e.to_string()),
        other => other,
    }
}

fn chunk_failed(index: u64, err: Error) -> Error {
    match err {
        Error::Api { message, .. } => Error::ChunkUpload { index, message },
        e if e.is_transient() => Error::ChunkUpload {
            index,
            message: e.to_string(),
        },
        other => other,
    }
}

/// Encrypt on the blocking pool and spool chunks until done or the
/// receiver goes away.
fn produce(chunks: EncryptedChunks, dir: &Path, tx: mpsc::Sender<Result<SpooledChunk>>) {
    for item in chunks {
        let spooled = item.and_then(|chunk| spool::write_chunk(dir, &chunk));
        let failed = spooled.is_err();
        if tx.blocking_send(spooled).is_err() || failed {
            return;
        }
    }
}

/// Drives uploads for one session.
pub struct UploadOrchestrator {
    session: Arc<Session>,
    engine: FileEncryptionEngine,
    retry: RetryExecutor,
    scratch_root: PathBuf,
}

impl UploadOrchestrator {
    /// Create an orchestrator using the chunk, retry and scratch settings
    /// from `config`.
    pub fn new(session: Arc<Session>, config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            session,
            engine: FileEncryptionEngine::new(ChunkGeometry::new(config.chunk_size)?),
            retry: RetryExecutor::new(RetryConfig::from_client(config)),
            scratch_root: config.scratch_root(),
        })
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryExecutor::new(config);
        self
    }

    /// Upload `path` into `folder`.
    pub async fn upload(
        &self,
        path: &Path,
        folder: &FolderRef,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome> {
        let (progress, _) = watch::channel(UploadProgress::default());
        self.upload_with_progress(path, folder, cancel, &progress)
            .await
    }

    /// Upload `path` into `folder`, publishing progress on `progress`.
    ///
    /// # Errors
    /// - `Prepare` if the service refuses or is unreachable at prepare
    /// - `ChunkUpload` if a chunk cannot be delivered within the retry budget
    /// - `Cancelled` if `cancel` fires before finalize
    /// - `Io`/`InvalidInput` for local file problems
    pub async fn upload_with_progress(
        &self,
        path: &Path,
        folder: &FolderRef,
        cancel: &CancellationToken,
        progress: &watch::Sender<UploadProgress>,
    ) -> Result<UploadOutcome> {
        progress.send_replace(UploadProgress::default());
        let run = UploadRun { progress };

        let result = self.run(&run, path, folder, cancel).await;
        match &result {
            Ok(outcome) => {
                run.advance(UploadState::Done);
                info!(uuid = %outcome.uuid, chunks = outcome.chunks, "Upload complete");
            }
            Err(e) => {
                run.advance(UploadState::Failed);
                warn!(path = %path.display(), error = %e, "Upload failed");
            }
        }
        result
    }

    async fn run(
        &self,
        run: &UploadRun<'_>,
        path: &Path,
        folder: &FolderRef,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let engine = self.engine;
        let source = path.to_path_buf();
        let prepared = tokio::task::spawn_blocking(move || engine.encrypt_for_upload(&source, None))
            .await
            .map_err(join_error)??;

        let spool = Spool::create(&self.scratch_root).await?;
        let result = self.deliver(run, prepared, folder, &spool, cancel).await;

        if let Err(e) = spool.cleanup().await {
            warn!(error = %e, "Failed to remove upload spool");
        }
        result
    }

    async fn deliver(
        &self,
        run: &UploadRun<'_>,
        prepared: PreparedUpload,
        folder: &FolderRef,
        spool: &Spool,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome> {
        let PreparedUpload {
            file_key,
            metadata,
            wrapped_metadata,
            wrapped_name,
            chunk_count,
            chunks,
        } = prepared;

        let wrapped_key = self.session.vault().wrap_file_key(&file_key).await?;
        drop(file_key);

        let uuid = RemoteId::generate();
        run.set_total(chunk_count);

        // Idle -> Prepared
        let prepare = PrepareRequest {
            uuid: uuid.clone(),
            folder: folder.as_wire().to_string(),
            name: wrapped_name.clone(),
            size: metadata.size,
            chunks: chunk_count,
            mime: metadata.mime.clone(),
        };
        let prepare = &prepare;
        let upload_key = until_cancelled(
            cancel,
            self.retry.execute("prepare", || {
                self.session
                    .authed(|api, key| async move { api.upload_prepare(&key, prepare).await })
            }),
        )
        .await
        .map_err(prepare_failed)?;
        run.advance(UploadState::Prepared);

        // Prepared -> ChunksInFlight
        run.advance(UploadState::ChunksInFlight);
        let (tx, rx) = mpsc::channel(SPOOL_AHEAD);
        let dir = spool.path().to_path_buf();
        let producer = tokio::task::spawn_blocking(move || produce(chunks, &dir, tx));

        let sent = self
            .send_chunks(run, rx, spool, &uuid, &upload_key, cancel)
            .await;
        if let Err(e) = producer.await {
            warn!(error = %e, "Chunk encryption task failed");
        }
        let sent = sent?;
        if sent != chunk_count {
            return Err(Error::InvalidInput(format!(
                "{} changed while uploading: expected {} chunks, read {}",
                metadata.name, chunk_count, sent
            )));
        }

        // ChunksInFlight -> Finalizing. Once finalize is sent the upload is
        // committed, so cancellation is only honoured before it.
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        run.advance(UploadState::Finalizing);
        let done = DoneRequest {
            uuid: uuid.clone(),
            upload_key,
            name: wrapped_name,
            size: metadata.size,
            chunks: chunk_count,
            mime: metadata.mime.clone(),
            metadata: wrapped_metadata,
            key: wrapped_key,
        };
        let done = &done;
        self.retry
            .execute("finalize", || {
                self.session
                    .authed(|api, key| async move { api.upload_done(&key, done).await })
            })
            .await?;

        Ok(UploadOutcome {
            uuid,
            metadata,
            chunks: chunk_count,
        })
    }

    async fn send_chunks(
        &self,
        run: &UploadRun<'_>,
        mut rx: mpsc::Receiver<Result<SpooledChunk>>,
        spool: &Spool,
        uuid: &RemoteId,
        upload_key: &str,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let api = self.session.api();
        let mut sent = 0;

        while let Some(spooled) = until_cancelled(cancel, async { Ok(rx.recv().await) }).await? {
            let spooled = spooled?;
            let data = spool.load(&spooled).await?;
            let target = ChunkTarget {
                uuid: uuid.clone(),
                upload_key: upload_key.to_string(),
                index: spooled.wire_index(),
            };

            until_cancelled(
                cancel,
                self.retry
                    .execute("chunk", || api.upload_chunk(&target, data.clone())),
            )
            .await
            .map_err(|e| chunk_failed(target.index, e))?;

            spool.discard(&spooled).await?;
            sent += 1;
            run.chunk_sent();
            debug!(uuid = %uuid, chunk = target.index, size = data.len(), "Chunk delivered");
        }

        Ok(sent)
    }
}
