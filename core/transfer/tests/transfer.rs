//! End-to-end transfer tests against the in-memory service.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;

use filenvault_api::{endpoints, ClientConfig, MemoryApi};
use filenvault_common::{Credentials, Error, FolderRef, RemoteId};
use filenvault_crypto::{decrypt_chunk, derive_key, kdf, ChunkGeometry, EncryptedChunk, KdfParams};
use filenvault_transfer::{
    create_folder, list_folder, move_file, move_folder, trash_file, trash_folder,
    CancellationToken, DownloadEngine, FileEncryptionEngine, RetryConfig, UploadOrchestrator,
    UploadProgress, UploadState,
};
use filenvault_vault::Session;

const EMAIL: &str = "alice@example.com";
const PASSWORD: &str = "correct-horse";
const CHUNK: usize = 64 * 1024;

struct Harness {
    api: Arc<MemoryApi>,
    session: Arc<Session>,
    config: ClientConfig,
    scratch: TempDir,
    files: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let api = Arc::new(MemoryApi::new());
        api.add_account(EMAIL, PASSWORD, &KdfParams::minimum()).unwrap();

        let scratch = TempDir::new().unwrap();
        let config = ClientConfig {
            chunk_size: CHUNK,
            scratch_dir: Some(scratch.path().to_path_buf()),
            kdf_iterations: kdf::MIN_ITERATIONS,
            ..Default::default()
        };

        let credentials = Credentials::new(EMAIL, PASSWORD).unwrap();
        let session = Session::open(api.clone(), credentials, KdfParams::minimum())
            .await
            .unwrap();

        Self {
            api,
            session: Arc::new(session),
            config,
            scratch,
            files: TempDir::new().unwrap(),
        }
    }

    fn uploader(&self) -> UploadOrchestrator {
        UploadOrchestrator::new(self.session.clone(), &self.config)
            .unwrap()
            .with_retry(fast_retry(3))
    }

    fn downloader(&self) -> DownloadEngine {
        DownloadEngine::new(self.session.clone(), &self.config)
            .unwrap()
            .with_retry(fast_retry(3))
    }

    fn write(&self, name: &str, len: usize) -> PathBuf {
        let path = self.files.path().join(name);
        std::fs::write(&path, pattern(len)).unwrap();
        path
    }

    fn scratch_files(&self) -> usize {
        count_files(self.scratch.path())
    }

    fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.scratch.path()).unwrap().next().is_none()
    }
}

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig::new(max_retries)
        .with_initial_delay(Duration::from_millis(1))
        .with_jitter(false)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 256) as u8).collect()
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

#[test]
fn test_25_mib_file_encrypts_to_three_chunks() {
    // Same password and salt always give the same derived key.
    let params = KdfParams::minimum();
    let first = derive_key(PASSWORD.as_bytes(), "abc123", &params).unwrap();
    let second = derive_key(PASSWORD.as_bytes(), "abc123", &params).unwrap();
    assert_eq!(first.as_bytes(), second.as_bytes());

    let temp = TempDir::new().unwrap();
    let path = temp.path().join("big.bin");
    let data = pattern(25 * 1024 * 1024);
    std::fs::write(&path, &data).unwrap();

    let engine = FileEncryptionEngine::new(ChunkGeometry::default());
    let prepared = engine.encrypt_for_upload(&path, None).unwrap();
    assert_eq!(prepared.metadata.size, 26_214_400);
    assert_eq!(prepared.chunk_count, 3);

    let key = prepared.file_key.clone();
    let chunks: Vec<EncryptedChunk> = prepared
        .chunks
        .collect::<filenvault_common::Result<_>>()
        .unwrap();
    let sizes: Vec<usize> = chunks.iter().map(|c| c.plaintext_len).collect();
    assert_eq!(sizes, vec![10 * 1024 * 1024, 10 * 1024 * 1024, 5 * 1024 * 1024]);

    // Decrypt out of order: each chunk stands alone.
    let third = decrypt_chunk(&key, &chunks[2].blob.to_bytes()).unwrap();
    let first = decrypt_chunk(&key, &chunks[0].blob.to_bytes()).unwrap();
    let second = decrypt_chunk(&key, &chunks[1].blob.to_bytes()).unwrap();
    assert_eq!([first, second, third].concat(), data);
}

#[tokio::test]
async fn test_upload_download_round_trip() {
    let h = Harness::new().await;
    let source = h.write("notes.txt", 3 * CHUNK + 123);

    let outcome = h
        .uploader()
        .upload(&source, &FolderRef::Root, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.chunks, 4);
    assert_eq!(outcome.metadata.mime, "text/plain");
    assert!(h.api.has_file(&outcome.uuid));
    assert_eq!(h.api.pending_uploads(), 0);
    assert!(h.scratch_is_empty());

    // The service never sees plaintext.
    let plaintext = std::fs::read(&source).unwrap();
    let blob = h.api.stored_blob(&outcome.uuid).unwrap();
    assert_eq!(
        blob.len() as u64,
        ChunkGeometry::new(CHUNK).unwrap().encrypted_size(3 * CHUNK as u64 + 123)
    );
    assert!(!blob.windows(64).any(|w| w == &plaintext[..64]));

    let out_dir = TempDir::new().unwrap();
    let (metadata, written) = h
        .downloader()
        .download(&outcome.uuid, out_dir.path(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(written, out_dir.path().join("notes.txt"));
    assert_eq!(metadata.size, 3 * CHUNK as u64 + 123);
    assert_eq!(std::fs::read(&written).unwrap(), plaintext);
    assert_eq!(count_files(out_dir.path()), 1);
    assert!(h.scratch_is_empty());
}

#[tokio::test]
async fn test_empty_file_round_trip() {
    let h = Harness::new().await;
    let source = h.write("empty.dat", 0);

    let outcome = h
        .uploader()
        .upload(&source, &FolderRef::Root, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.chunks, 0);
    assert_eq!(h.api.call_count(endpoints::UPLOAD), 0);

    let out = TempDir::new().unwrap();
    let target = out.path().join("copy.dat");
    h.downloader()
        .download(&outcome.uuid, &target, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), Vec::<u8>::new());
}

#[tokio::test]
async fn test_transient_chunk_failures_are_retried() {
    let h = Harness::new().await;
    let source = h.write("data.bin", 2 * CHUNK + 1);
    h.api.fail_chunk(2, 2);

    let (progress, watcher) = watch::channel(UploadProgress::default());
    let outcome = h
        .uploader()
        .upload_with_progress(&source, &FolderRef::Root, &CancellationToken::new(), &progress)
        .await
        .unwrap();

    assert_eq!(outcome.chunks, 3);
    assert_eq!(h.api.call_count(endpoints::UPLOAD), 5);
    let last = *watcher.borrow();
    assert_eq!(last.state, UploadState::Done);
    assert_eq!((last.chunks_sent, last.chunks_total), (3, 3));
}

#[tokio::test]
async fn test_exhausted_chunk_retries_abort_without_finalize() {
    let h = Harness::new().await;
    let source = h.write("data.bin", 2 * CHUNK);
    h.api.fail_chunk(2, 100);

    let uploader = UploadOrchestrator::new(h.session.clone(), &h.config)
        .unwrap()
        .with_retry(fast_retry(2));
    let result = uploader
        .upload(&source, &FolderRef::Root, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::ChunkUpload { index: 2, .. })));
    assert_eq!(h.api.call_count(endpoints::UPLOAD_DONE), 0);
    assert!(h.scratch_is_empty());
}

#[tokio::test]
async fn test_prepare_failure() {
    let h = Harness::new().await;
    let source = h.write("data.bin", 10);
    h.api.fail_prepare(10);

    let result = h
        .uploader()
        .upload(&source, &FolderRef::Root, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::Prepare(_))));
    assert_eq!(h.api.call_count(endpoints::UPLOAD_PREPARE), 4);
    assert_eq!(h.api.call_count(endpoints::UPLOAD), 0);
    assert!(h.scratch_is_empty());
}

#[tokio::test]
async fn test_cancel_mid_flight_cleans_up_and_skips_finalize() {
    let h = Harness::new().await;
    let source = h.write("big.bin", 4 * CHUNK);
    h.api.stall_chunk(2);

    let cancel = CancellationToken::new();
    let (progress, watcher) = watch::channel(UploadProgress::default());
    let uploader = h.uploader();

    let canceller = async {
        while h.api.call_count(endpoints::UPLOAD) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(watcher.borrow().state, UploadState::ChunksInFlight);
        assert!(h.scratch_files() > 0, "chunk 2 should be spooled while in flight");
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(
        uploader.upload_with_progress(&source, &FolderRef::Root, &cancel, &progress),
        canceller
    );

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(watcher.borrow().state, UploadState::Failed);
    assert_eq!(h.api.call_count(endpoints::UPLOAD_DONE), 0);
    assert_eq!(h.api.pending_uploads(), 1);
    assert!(h.scratch_is_empty());
}

#[tokio::test]
async fn test_listing_survives_corrupt_entry() {
    let h = Harness::new().await;
    let uploader = h.uploader();
    for i in 0..9 {
        let path = h.write(&format!("file{}.txt", i), 100 + i);
        uploader
            .upload(&path, &FolderRef::Root, &CancellationToken::new())
            .await
            .unwrap();
    }

    h.api.insert_entry(
        &FolderRef::Root,
        serde_json::json!({
            "uuid": "corrupt",
            "key": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
            "metadata": "definitely not metadata",
            "bucket": "filen-1",
        }),
    );
    let shapeless = serde_json::json!({"key": ["not", "a", "string"], "bucket": "filen-2"});
    h.api.insert_entry(&FolderRef::Root, shapeless.clone());

    let listing = list_folder(&h.session, &FolderRef::Root).await.unwrap();

    assert_eq!(listing.files.len(), 11);
    assert_eq!(listing.files.iter().filter(|f| f.is_decrypted()).count(), 9);
    assert_eq!(listing.diagnostics.len(), 2);

    let corrupt = listing
        .files
        .iter()
        .find(|f| f.uuid() == Some("corrupt"))
        .unwrap();
    assert!(corrupt.metadata.is_none());
    assert_eq!(corrupt.raw["bucket"], "filen-1");
    assert_eq!(corrupt.raw["metadata"], "definitely not metadata");
    assert!(listing.files.iter().any(|f| f.raw == shapeless));

    let mut names: Vec<String> = listing
        .files
        .iter()
        .filter_map(|f| f.metadata.as_ref().map(|m| m.name.clone()))
        .collect();
    names.sort();
    assert_eq!(names.first().map(String::as_str), Some("file0.txt"));
    assert_eq!(names.len(), 9);
}

#[tokio::test]
async fn test_corrupt_file_key_fails_download_without_output() {
    let h = Harness::new().await;
    let source = h.write("secret.txt", 500);
    let outcome = h
        .uploader()
        .upload(&source, &FolderRef::Root, &CancellationToken::new())
        .await
        .unwrap();

    h.api.replace_file_key(&outcome.uuid, "bm9wZQ==");

    let out = TempDir::new().unwrap();
    let target = out.path().join("secret.txt");
    let result = h
        .downloader()
        .download(&outcome.uuid, &target, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::KeyUnwrap(_))));
    assert_eq!(count_files(out.path()), 0);
}

#[tokio::test]
async fn test_tampered_blob_leaves_no_partial_file() {
    let h = Harness::new().await;
    let source = h.write("report.bin", 2 * CHUNK + 77);
    let outcome = h
        .uploader()
        .upload(&source, &FolderRef::Root, &CancellationToken::new())
        .await
        .unwrap();

    // The last chunk ends in 0x03 padding; flipping the high bit of the
    // matching byte in the previous block makes it 0x83.
    let mut blob = h.api.stored_blob(&outcome.uuid).unwrap();
    let target_byte = blob.len() - 17;
    blob[target_byte] ^= 0x80;
    h.api.replace_blob(&outcome.uuid, blob);

    let out = TempDir::new().unwrap();
    let target = out.path().join("report.bin");
    let result = h
        .downloader()
        .download(&outcome.uuid, &target, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::Decrypt(_))));
    assert_eq!(count_files(out.path()), 0);
    assert!(h.scratch_is_empty());
}

#[tokio::test]
async fn test_truncated_blob_is_rejected() {
    let h = Harness::new().await;
    let source = h.write("report.bin", CHUNK + 5);
    let outcome = h
        .uploader()
        .upload(&source, &FolderRef::Root, &CancellationToken::new())
        .await
        .unwrap();

    let blob = h.api.stored_blob(&outcome.uuid).unwrap();
    h.api.replace_blob(&outcome.uuid, blob[..blob.len() - 32].to_vec());

    let out = TempDir::new().unwrap();
    let result = h
        .downloader()
        .download(&outcome.uuid, &out.path().join("x"), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(Error::Decrypt(_))));
    assert_eq!(count_files(out.path()), 0);
}

#[tokio::test]
async fn test_expired_session_relogs_during_upload() {
    let h = Harness::new().await;
    let source = h.write("a.txt", 10);
    h.api.expire_api_keys();

    h.uploader()
        .upload(&source, &FolderRef::Root, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.api.call_count(endpoints::LOGIN), 2);
}

#[tokio::test]
async fn test_create_folder_and_list() {
    let h = Harness::new().await;
    let id = create_folder(&h.session, "Invoices", &FolderRef::Root)
        .await
        .unwrap();

    let source = h.write("inv-001.pdf", 2048);
    let folder = FolderRef::Folder(id.clone());
    h.uploader()
        .upload(&source, &folder, &CancellationToken::new())
        .await
        .unwrap();

    let root = list_folder(&h.session, &FolderRef::Root).await.unwrap();
    assert_eq!(root.folders.len(), 1);
    assert_eq!(root.folders[0].name.as_deref(), Some("Invoices"));
    assert_eq!(root.folders[0].uuid(), Some(id.as_str()));
    assert!(root.files.is_empty());

    let inside = list_folder(&h.session, &folder).await.unwrap();
    assert_eq!(inside.files.len(), 1);
    let metadata = inside.files[0].metadata.as_ref().unwrap();
    assert_eq!(metadata.name, "inv-001.pdf");
    assert_eq!(metadata.mime, "application/pdf");

    assert!(create_folder(&h.session, "a/b", &FolderRef::Root).await.is_err());
}

#[tokio::test]
async fn test_move_and_trash() {
    let h = Harness::new().await;
    let archive = create_folder(&h.session, "Archive", &FolderRef::Root)
        .await
        .unwrap();
    let nested = create_folder(&h.session, "2023", &FolderRef::Folder(archive.clone()))
        .await
        .unwrap();
    let archive_ref = FolderRef::Folder(archive.clone());
    let nested_ref = FolderRef::Folder(nested.clone());

    let source = h.write("report.txt", 300);
    let outcome = h
        .uploader()
        .upload(&source, &FolderRef::Root, &CancellationToken::new())
        .await
        .unwrap();

    move_file(&h.session, &outcome.uuid, &nested_ref).await.unwrap();
    let root = list_folder(&h.session, &FolderRef::Root).await.unwrap();
    assert!(root.files.is_empty());
    let inside = list_folder(&h.session, &nested_ref).await.unwrap();
    assert_eq!(inside.files[0].metadata.as_ref().unwrap().name, "report.txt");

    // A folder cannot be moved into itself or below itself.
    assert!(matches!(
        move_folder(&h.session, &archive, &archive_ref).await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        move_folder(&h.session, &archive, &nested_ref).await,
        Err(Error::Api { .. })
    ));

    move_folder(&h.session, &nested, &FolderRef::Root).await.unwrap();
    let root = list_folder(&h.session, &FolderRef::Root).await.unwrap();
    assert_eq!(root.folders.len(), 2);

    trash_folder(&h.session, &nested).await.unwrap();
    assert!(!h.api.has_folder(&nested));
    assert!(!h.api.has_file(&outcome.uuid));
    assert!(h.api.has_folder(&archive));

    let other = h.write("other.txt", 10);
    let other = h
        .uploader()
        .upload(&other, &archive_ref, &CancellationToken::new())
        .await
        .unwrap();
    trash_file(&h.session, &other.uuid).await.unwrap();
    assert!(!h.api.has_file(&other.uuid));
    assert!(matches!(
        trash_file(&h.session, &other.uuid).await,
        Err(Error::Api { .. })
    ));
}

#[tokio::test]
async fn test_storage_usage_counts_uploads() {
    let h = Harness::new().await;
    let source = h.write("a.bin", 1000);
    h.uploader()
        .upload(&source, &FolderRef::Root, &CancellationToken::new())
        .await
        .unwrap();

    let usage = h.session.storage_usage().await.unwrap();
    assert_eq!(usage.used, 1000);
    assert!(usage.percentage() > 0.0);

    let missing = RemoteId::new("no-such-file").unwrap();
    let out = TempDir::new().unwrap();
    let result = h
        .downloader()
        .download(&missing, &out.path().join("x"), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(Error::Api { .. })));
}
