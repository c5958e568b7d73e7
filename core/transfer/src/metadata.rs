//! File metadata as stored encrypted alongside each file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use filenvault_common::{Error, Result};
use filenvault_crypto::{codec, ChunkGeometry, FileKey, WrappedBlob};

/// MIME type used when the extension says nothing.
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Plaintext metadata of a remote file.
///
/// Serialized as camelCase JSON and encrypted under the file key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// File name, without directories.
    pub name: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// MIME type.
    pub mime: String,
    /// Modification time, milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
}

/// Guess a MIME type from a file name.
pub fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or(DEFAULT_MIME)
        .to_string()
}

impl FileMetadata {
    /// Metadata for a name and size, MIME guessed from the name.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        let mime = guess_mime(&name);
        Self {
            name,
            size,
            mime,
            last_modified: None,
        }
    }

    /// Metadata of a local file.
    ///
    /// # Errors
    /// - `InvalidInput` if the path has no file name or is not a regular file
    /// - `Io` if the file cannot be inspected
    pub fn for_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidInput(format!("No file name in {}", path.display())))?;

        let stat = std::fs::metadata(path)?;
        if !stat.is_file() {
            return Err(Error::InvalidInput(format!(
                "Not a regular file: {}",
                path.display()
            )));
        }

        let mut metadata = Self::new(name, stat.len());
        metadata.last_modified = stat
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis());
        Ok(metadata)
    }

    /// Number of chunks the file occupies.
    pub fn chunk_count(&self, geometry: &ChunkGeometry) -> u64 {
        geometry.chunk_count(self.size)
    }

    /// Encrypt under the file key (base64 WrappedMetadata).
    pub fn encrypt(&self, key: &FileKey) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(codec::encrypt(key.as_bytes(), &json)?.to_base64())
    }

    /// Decrypt WrappedMetadata.
    ///
    /// # Errors
    /// - `Decrypt` for a bad blob, wrong key, or plaintext that is not
    ///   metadata JSON
    pub fn decrypt(key: &FileKey, wrapped: &str) -> Result<Self> {
        let blob = WrappedBlob::from_base64(wrapped)?;
        let json = codec::decrypt(key.as_bytes(), &blob)?;
        serde_json::from_slice(&json)
            .map_err(|e| Error::Decrypt(format!("Metadata is not valid JSON: {}", e)))
    }
}

/// Encrypt a bare file name under the file key (base64).
pub fn encrypt_name(name: &str, key: &FileKey) -> Result<String> {
    Ok(codec::encrypt(key.as_bytes(), name.as_bytes())?.to_base64())
}
