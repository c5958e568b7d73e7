//! Fixed-size chunking for file contents.
//!
//! Files are cut into windows of `chunk_size` plaintext bytes and every
//! window is encrypted on its own with a fresh IV, so chunk `i` covers file
//! offset `i * chunk_size` and can be decrypted in isolation.

use std::io::{ErrorKind, Read};

use crate::codec::{self, WrappedBlob, BLOCK_SIZE};
use crate::keys::FileKey;
use filenvault_common::{Error, Result};

/// Default plaintext chunk size (10 MiB).
pub const CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Chunk layout for a given chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGeometry {
    chunk_size: usize,
}

impl ChunkGeometry {
    /// Create a geometry.
    ///
    /// # Errors
    /// - Returns error if `chunk_size` is zero or not a multiple of BLOCK_SIZE
    pub fn new(chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 || chunk_size % BLOCK_SIZE != 0 {
            return Err(Error::InvalidInput(format!(
                "Chunk size must be a positive multiple of {}, got {}",
                BLOCK_SIZE, chunk_size
            )));
        }
        Ok(Self { chunk_size })
    }

    /// Plaintext bytes per full chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks for a file of `size` bytes: `ceil(size / chunk_size)`.
    pub fn chunk_count(&self, size: u64) -> u64 {
        size.div_ceil(self.chunk_size as u64)
    }

    /// Encoded size of one full chunk (`chunk_size + 32`).
    pub fn encrypted_chunk_size(&self) -> usize {
        codec::encrypted_len(self.chunk_size)
    }

    /// Total encoded size of a file of `size` plaintext bytes.
    pub fn encrypted_size(&self, size: u64) -> u64 {
        let full = size / self.chunk_size as u64;
        let rest = (size % self.chunk_size as u64) as usize;
        let mut total = full * self.encrypted_chunk_size() as u64;
        if rest > 0 {
            total += codec::encrypted_len(rest) as u64;
        }
        total
    }
}

impl Default for ChunkGeometry {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// Reads a source in consecutive windows of a fixed size.
///
/// Every window is full except possibly the last. An empty source yields
/// nothing.
pub struct ChunkReader<R> {
    reader: R,
    window: usize,
    done: bool,
}

impl<R: Read> ChunkReader<R> {
    /// Wrap a reader.
    pub fn new(reader: R, window: usize) -> Self {
        Self {
            reader,
            window,
            done: false,
        }
    }

    fn fill(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buffer = vec![0u8; self.window];
        let mut filled = 0;

        while filled < self.window {
            match self.reader.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if filled < self.window {
            self.done = true;
        }
        if filled == 0 {
            return Ok(None);
        }
        buffer.truncate(filled);
        Ok(Some(buffer))
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fill() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// One encrypted chunk.
#[derive(Debug, Clone)]
pub struct EncryptedChunk {
    /// Zero-based position in the file.
    pub index: u64,
    /// Plaintext bytes carried by this chunk.
    pub plaintext_len: usize,
    /// `iv || ciphertext`.
    pub blob: WrappedBlob,
}

impl EncryptedChunk {
    /// 1-based index as used on the wire.
    pub fn wire_index(&self) -> u64 {
        self.index + 1
    }
}

/// Encrypt one plaintext window.
pub fn encrypt_chunk(key: &FileKey, index: u64, data: &[u8]) -> Result<EncryptedChunk> {
    let blob = codec::encrypt(key.as_bytes(), data)?;
    Ok(EncryptedChunk {
        index,
        plaintext_len: data.len(),
        blob,
    })
}

/// Decrypt one encoded chunk (`iv || ciphertext`).
pub fn decrypt_chunk(key: &FileKey, encoded: &[u8]) -> Result<Vec<u8>> {
    codec::decrypt_bytes(key.as_bytes(), encoded)
}
