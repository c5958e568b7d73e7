//! Download, verification and decryption of remote files.
//!
//! The encrypted blob is the in-order concatenation of independently
//! encrypted chunks. It is spooled to disk, checked against the size the
//! metadata implies, split at the encrypted chunk stride and decrypted
//! chunk by chunk into a hidden partial file that is renamed into place
//! only when everything checked out.

use futures::StreamExt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metadata::FileMetadata;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::spool::Spool;
use crate::{join_error, until_cancelled};
use filenvault_api::{ClientConfig, FilenApi};
use filenvault_common::{Error, RemoteId, Result};
use filenvault_crypto::{decrypt_chunk, ChunkGeometry, ChunkReader, FileKey};
use filenvault_vault::Session;

/// Downloads files for one session.
pub struct DownloadEngine {
    session: Arc<Session>,
    geometry: ChunkGeometry,
    retry: RetryExecutor,
    scratch_root: PathBuf,
}

/// Stream a blob into `path`, returning the bytes received.
async fn fetch_to_file(api: &Arc<dyn FilenApi>, url: &str, path: &Path) -> Result<u64> {
    let mut stream = api.fetch_blob(url).await?;
    let mut file = tokio::fs::File::create(path).await?;
    let mut received = 0u64;

    while let Some(piece) = stream.next().await {
        let piece = piece?;
        file.write_all(&piece).await?;
        received += piece.len() as u64;
    }
    file.flush().await?;
    Ok(received)
}

/// Decrypt a spooled blob into `out` (blocking). Returns plaintext bytes written.
fn decrypt_blob(
    blob: &Path,
    out: File,
    key: &FileKey,
    geometry: ChunkGeometry,
    cancel: &CancellationToken,
) -> Result<u64> {
    let reader = BufReader::new(File::open(blob)?);
    let mut writer = BufWriter::new(out);
    let mut written = 0u64;

    for (index, encoded) in ChunkReader::new(reader, geometry.encrypted_chunk_size()).enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let plaintext = decrypt_chunk(key, &encoded?)
            .map_err(|_| Error::Decrypt(format!("Chunk {} rejected", index + 1)))?;
        writer.write_all(&plaintext)?;
        written += plaintext.len() as u64;
    }

    writer.flush()?;
    Ok(written)
}

/// Hidden sibling the plaintext is written to before the final rename.
///
/// Removed on drop unless [`PartialFile::commit`] moved it into place, so
/// a failed, cancelled or abandoned download leaves nothing behind.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn for_destination(destination: &Path) -> Result<Self> {
        let name = destination
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::InvalidInput(format!("No file name in {}", destination.display()))
            })?;
        Ok(Self {
            path: destination.with_file_name(format!(".{}.filenvault-part", name)),
            committed: false,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Rename into `destination`.
    async fn commit(mut self, destination: &Path) -> Result<()> {
        tokio::fs::rename(&self.path, destination).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed partial file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove partial file")
            }
        }
    }
}

/// Where to write: `destination` itself, or the remote name inside it if
/// it is a directory. Remote names are reduced to their last component.
fn resolve_destination(destination: &Path, metadata: &FileMetadata) -> Result<PathBuf> {
    if !destination.is_dir() {
        return Ok(destination.to_path_buf());
    }
    let name = Path::new(&metadata.name)
        .file_name()
        .ok_or_else(|| Error::InvalidInput(format!("Unusable remote name: {:?}", metadata.name)))?;
    Ok(destination.join(name))
}

impl DownloadEngine {
    /// Create an engine using the chunk, retry and scratch settings from
    /// `config`. The chunk size must match the one used for upload.
    pub fn new(session: Arc<Session>, config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            session,
            geometry: ChunkGeometry::new(config.chunk_size)?,
            retry: RetryExecutor::new(RetryConfig::from_client(config)),
            scratch_root: config.scratch_root(),
        })
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryExecutor::new(config);
        self
    }

    /// Download `uuid` to `destination` (a file path, or a directory to
    /// place the file in under its remote name).
    ///
    /// # Postconditions
    /// - On success the destination holds exactly the uploaded plaintext
    /// - On failure no file has been created at the destination
    ///
    /// # Errors
    /// - `KeyUnwrap` if the file key cannot be unwrapped
    /// - `Decrypt` if metadata or any chunk fails to decrypt, or the blob
    ///   does not have the layout its metadata implies
    /// - `Cancelled` if `cancel` fires first
    pub async fn download(
        &self,
        uuid: &RemoteId,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(FileMetadata, PathBuf)> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let info = until_cancelled(
            cancel,
            self.retry.execute("file info", || {
                self.session
                    .authed(|api, key| async move { api.file_info(&key, uuid).await })
            }),
        )
        .await?;

        let file_key = self.session.vault().unwrap_file_key(&info.key).await?;
        let metadata = FileMetadata::decrypt(&file_key, &info.metadata)?;

        let expected_chunks = self.geometry.chunk_count(metadata.size);
        if let Some(reported) = info.chunks {
            if reported != expected_chunks {
                return Err(Error::Decrypt(format!(
                    "File has {} chunks but its size implies {}",
                    reported, expected_chunks
                )));
            }
        }

        let destination = resolve_destination(destination, &metadata)?;
        let part = PartialFile::for_destination(&destination)?;
        let spool = Spool::create(&self.scratch_root).await?;

        let result = match self
            .fetch_and_decrypt(uuid, file_key, &metadata, &spool, part.path(), cancel)
            .await
        {
            Ok(()) => part.commit(&destination).await,
            Err(e) => {
                drop(part);
                Err(e)
            }
        };

        if let Err(e) = &result {
            warn!(uuid = %uuid, error = %e, "Download failed");
        }
        if let Err(e) = spool.cleanup().await {
            warn!(error = %e, "Failed to remove download spool");
        }
        result?;

        info!(uuid = %uuid, size = metadata.size, chunks = expected_chunks, "Download complete");
        Ok((metadata, destination))
    }

    async fn fetch_and_decrypt(
        &self,
        uuid: &RemoteId,
        file_key: FileKey,
        metadata: &FileMetadata,
        spool: &Spool,
        part: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = until_cancelled(
            cancel,
            self.retry.execute("download url", || {
                self.session
                    .authed(|api, key| async move { api.download_url(&key, uuid).await })
            }),
        )
        .await?;

        let blob_path = spool.file("blob");
        let api = self.session.api();
        let received = until_cancelled(
            cancel,
            self.retry
                .execute("download", || fetch_to_file(api, &url, &blob_path)),
        )
        .await?;

        let expected = self.geometry.encrypted_size(metadata.size);
        if received != expected {
            return Err(Error::Decrypt(format!(
                "Downloaded {} bytes, expected {}",
                received, expected
            )));
        }
        debug!(uuid = %uuid, bytes = received, "Blob spooled");

        // Stops the blocking decrypt if this future is dropped. The output is
        // opened here so it cannot be recreated after the partial file is gone.
        let out = tokio::fs::File::create(part).await?.into_std().await;
        let geometry = self.geometry;
        let token = cancel.child_token();
        let _stop = token.clone().drop_guard();
        let written = tokio::task::spawn_blocking(move || {
            decrypt_blob(&blob_path, out, &file_key, geometry, &token)
        })
        .await
        .map_err(join_error)??;

        if written != metadata.size {
            return Err(Error::Decrypt(format!(
                "Decrypted {} bytes, metadata says {}",
                written, metadata.size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filenvault_crypto::encrypt_chunk;
    use tempfile::TempDir;

    #[test]
    fn test_partial_path_is_hidden_sibling() {
        let part = PartialFile::for_destination(Path::new("/tmp/out/report.pdf")).unwrap();
        assert_eq!(part.path(), Path::new("/tmp/out/.report.pdf.filenvault-part"));
        assert!(PartialFile::for_destination(Path::new("/")).is_err());
    }

    #[test]
    fn test_abandoned_partial_file_is_removed() {
        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("report.pdf");
        let part = PartialFile::for_destination(&destination).unwrap();
        let path = part.path().to_path_buf();
        std::fs::write(&path, b"half a file").unwrap();

        drop(part);
        assert!(!path.exists());
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn test_committed_partial_file_is_kept() {
        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("report.pdf");
        let part = PartialFile::for_destination(&destination).unwrap();
        let path = part.path().to_path_buf();
        std::fs::write(&path, b"whole file").unwrap();

        part.commit(&destination).await.unwrap();
        assert!(!path.exists());
        assert_eq!(std::fs::read(&destination).unwrap(), b"whole file");
    }

    #[test]
    fn test_resolve_destination_strips_directories() {
        let temp = TempDir::new().unwrap();
        let metadata = FileMetadata::new("../../etc/passwd", 1);
        assert_eq!(
            resolve_destination(temp.path(), &metadata).unwrap(),
            temp.path().join("passwd")
        );

        let file = temp.path().join("explicit.bin");
        assert_eq!(resolve_destination(&file, &metadata).unwrap(), file);

        let dotdot = FileMetadata::new("..", 1);
        assert!(resolve_destination(temp.path(), &dotdot).is_err());
    }

    #[test]
    fn test_decrypt_blob_splits_at_stride() {
        let temp = TempDir::new().unwrap();
        let geometry = ChunkGeometry::new(32).unwrap();
        let key = FileKey::generate();
        let data: Vec<u8> = (0..70u8).collect();

        let mut blob = Vec::new();
        for (i, window) in data.chunks(32).enumerate() {
            blob.extend(encrypt_chunk(&key, i as u64, window).unwrap().blob.to_bytes());
        }
        assert_eq!(blob.len() as u64, geometry.encrypted_size(70));

        let blob_path = temp.path().join("blob");
        let out = temp.path().join("out");
        std::fs::write(&blob_path, &blob).unwrap();

        let written = decrypt_blob(
            &blob_path,
            File::create(&out).unwrap(),
            &key,
            geometry,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(written, 70);
        assert_eq!(std::fs::read(&out).unwrap(), data);
    }

    #[test]
    fn test_decrypt_blob_rejects_tampering() {
        let temp = TempDir::new().unwrap();
        let geometry = ChunkGeometry::new(32).unwrap();
        let key = FileKey::generate();

        let mut blob = encrypt_chunk(&key, 0, &[7u8; 32]).unwrap().blob.to_bytes();
        // Flipping the last byte of the second-to-last block turns the final
        // padding byte from 0x10 into 0x11, which is never valid.
        let target = blob.len() - 17;
        blob[target] ^= 0x01;

        let blob_path = temp.path().join("blob");
        std::fs::write(&blob_path, &blob).unwrap();

        let result = decrypt_blob(
            &blob_path,
            File::create(temp.path().join("out")).unwrap(),
            &key,
            geometry,
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::Decrypt(_))));
    }
}
