//! FilenVault transfer engine
//!
//! This module moves files between the local disk and the service with
//! all encryption done client-side:
//! - Per-file keys and chunked encryption of local files
//! - Upload orchestration (prepare, ordered chunks, finalize)
//! - Download, verification and decryption of remote files
//! - Best-effort decryption of folder listings
//! - Folder creation, moves and trash
//! - Retry with exponential backoff and per-transfer scratch spools

pub mod download;
pub mod encrypt;
pub mod folders;
pub mod metadata;
pub mod resolver;
pub mod retry;
pub mod spool;
pub mod upload;

pub use download::DownloadEngine;
pub use encrypt::{EncryptedChunks, FileEncryptionEngine, PreparedUpload};
pub use folders::{create_folder, list_folder, move_file, move_folder, trash_file, trash_folder};
pub use metadata::{guess_mime, FileMetadata, DEFAULT_MIME};
pub use resolver::{DirectoryMetadataResolver, Listing, ResolvedEntry, ResolvedFolder};
pub use retry::{RetryConfig, RetryExecutor};
pub use spool::Spool;
pub use upload::{UploadOrchestrator, UploadOutcome, UploadProgress, UploadState};

pub use tokio_util::sync::CancellationToken;

use std::future::Future;

use filenvault_common::{Error, Result};

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

pub(crate) fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::other(err))
}
