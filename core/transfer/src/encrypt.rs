//! Client-side encryption of a local file for upload.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::metadata::{encrypt_name, FileMetadata};
use filenvault_common::Result;
use filenvault_crypto::{encrypt_chunk, ChunkGeometry, ChunkReader, EncryptedChunk, FileKey};

/// A file ready to upload: keys, encrypted metadata and a lazy chunk stream.
pub struct PreparedUpload {
    /// Key for this file only.
    pub file_key: FileKey,
    /// Plaintext metadata.
    pub metadata: FileMetadata,
    /// Metadata encrypted under the file key (base64).
    pub wrapped_metadata: String,
    /// File name encrypted under the file key (base64).
    pub wrapped_name: String,
    /// Number of chunks the stream will yield.
    pub chunk_count: u64,
    /// Encrypted chunks in order.
    pub chunks: EncryptedChunks,
}

/// Reads and encrypts a file one window at a time.
///
/// Only one plaintext window is held in memory at once.
pub struct EncryptedChunks {
    reader: ChunkReader<BufReader<File>>,
    key: FileKey,
    next_index: u64,
}

impl Iterator for EncryptedChunks {
    type Item = Result<EncryptedChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let window = match self.reader.next()? {
            Ok(window) => window,
            Err(e) => return Some(Err(e)),
        };
        let index = self.next_index;
        self.next_index += 1;
        Some(encrypt_chunk(&self.key, index, &window))
    }
}

/// Produces [`PreparedUpload`]s. Does no network I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileEncryptionEngine {
    geometry: ChunkGeometry,
}

impl FileEncryptionEngine {
    /// Create an engine with the given chunk layout.
    pub fn new(geometry: ChunkGeometry) -> Self {
        Self { geometry }
    }

    /// The chunk layout.
    pub fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    /// Prepare `path` for upload.
    ///
    /// A fresh random file key is generated unless `key` is given.
    /// Chunks are encrypted lazily as the returned stream is consumed; each
    /// carries its own IV and decrypts on its own.
    ///
    /// # Errors
    /// - `InvalidInput` if `path` is not a regular file
    /// - `Io` if the file cannot be opened
    pub fn encrypt_for_upload(&self, path: &Path, key: Option<FileKey>) -> Result<PreparedUpload> {
        let metadata = FileMetadata::for_path(path)?;
        let file_key = key.unwrap_or_else(FileKey::generate);

        let wrapped_metadata = metadata.encrypt(&file_key)?;
        let wrapped_name = encrypt_name(&metadata.name, &file_key)?;
        let chunk_count = metadata.chunk_count(&self.geometry);

        let file = File::open(path)?;
        let chunks = EncryptedChunks {
            reader: ChunkReader::new(BufReader::new(file), self.geometry.chunk_size()),
            key: file_key.clone(),
            next_index: 0,
        };

        Ok(PreparedUpload {
            file_key,
            metadata,
            wrapped_metadata,
            wrapped_name,
            chunk_count,
            chunks,
        })
    }
}
