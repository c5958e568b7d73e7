//! Per-transfer scratch directory for encrypted data.
//!
//! Uploads spool each encrypted chunk here between encryption and delivery;
//! downloads spool the encrypted blob before decrypting it. The directory
//! is removed by [`Spool::cleanup`], and by `Drop` if a transfer future is
//! abandoned without reaching cleanup.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use filenvault_common::{Error, Result};
use filenvault_crypto::EncryptedChunk;

/// An encrypted chunk written to the spool.
#[derive(Debug, Clone)]
pub struct SpooledChunk {
    /// Zero-based chunk index.
    pub index: u64,
    /// Plaintext bytes the chunk carries.
    pub plaintext_len: usize,
    /// Spool file holding `iv || ciphertext`.
    pub path: PathBuf,
}

impl SpooledChunk {
    /// 1-based index as used on the wire.
    pub fn wire_index(&self) -> u64 {
        self.index + 1
    }
}

/// Scratch directory owned by one transfer.
pub struct Spool {
    dir: PathBuf,
    removed: bool,
}

impl Spool {
    /// Create a fresh, uniquely named directory under `root`.
    pub async fn create(root: &Path) -> Result<Self> {
        let dir = root.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&dir).await.map_err(Error::Io)?;
        debug!(dir = %dir.display(), "Spool created");
        Ok(Self {
            dir,
            removed: false,
        })
    }

    /// The spool directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Path of a named file inside the spool.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Read a spooled chunk back.
    pub async fn load(&self, chunk: &SpooledChunk) -> Result<Bytes> {
        fs::read(&chunk.path).await.map(Bytes::from).map_err(Error::Io)
    }

    /// Delete a spooled chunk once delivered.
    pub async fn discard(&self, chunk: &SpooledChunk) -> Result<()> {
        fs::remove_file(&chunk.path).await.map_err(Error::Io)
    }

    /// Remove the directory and everything in it.
    pub async fn cleanup(mut self) -> Result<()> {
        self.removed = true;
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                debug!(dir = %self.dir.display(), "Spool removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "Failed to remove spool");
            }
        }
    }
}

/// Write an encrypted chunk into `dir` (blocking).
///
/// Runs on the encryption thread. Fails if the spool was removed in the
/// meantime, which stops the producer.
pub fn write_chunk(dir: &Path, chunk: &EncryptedChunk) -> Result<SpooledChunk> {
    let path = dir.join(format!("chunk-{:06}", chunk.wire_index()));
    std::fs::write(&path, chunk.blob.to_bytes()).map_err(Error::Io)?;
    Ok(SpooledChunk {
        index: chunk.index,
        plaintext_len: chunk.plaintext_len,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use filenvault_crypto::{decrypt_chunk, encrypt_chunk, FileKey};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_load_discard() {
        let temp = TempDir::new().unwrap();
        let spool = Spool::create(temp.path()).await.unwrap();
        let key = FileKey::generate();

        let chunk = encrypt_chunk(&key, 0, b"chunk data").unwrap();
        let spooled = write_chunk(spool.path(), &chunk).unwrap();
        assert_eq!(spooled.wire_index(), 1);
        assert!(spooled.path.exists());

        let bytes = spool.load(&spooled).await.unwrap();
        assert_eq!(decrypt_chunk(&key, &bytes).unwrap(), b"chunk data");

        spool.discard(&spooled).await.unwrap();
        assert!(!spooled.path.exists());
        assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_directory() {
        let temp = TempDir::new().unwrap();
        let spool = Spool::create(temp.path()).await.unwrap();
        let dir = spool.path().to_path_buf();
        std::fs::write(spool.file("blob"), b"x").unwrap();

        spool.cleanup().await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_drop_removes_directory() {
        let temp = TempDir::new().unwrap();
        let dir = {
            let spool = Spool::create(temp.path()).await.unwrap();
            std::fs::write(spool.file("chunk-000001"), b"x").unwrap();
            spool.path().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_write_after_removal_fails() {
        let temp = TempDir::new().unwrap();
        let spool = Spool::create(temp.path()).await.unwrap();
        let dir = spool.path().to_path_buf();
        spool.cleanup().await.unwrap();

        let chunk = encrypt_chunk(&FileKey::generate(), 0, b"late").unwrap();
        assert!(write_chunk(&dir, &chunk).is_err());
    }
}
