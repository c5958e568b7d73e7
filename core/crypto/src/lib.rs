//! Cryptographic primitives for FilenVault.
//!
//! This module provides:
//! - A single AES-256-CBC codec used for every encryption in the system
//! - PBKDF2 key derivation and the separate login hash
//! - Key types with automatic zeroization
//! - Chunk geometry for per-chunk file encryption
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Every encryption draws a fresh IV from the OS RNG

pub mod chunk;
pub mod codec;
pub mod kdf;
pub mod keys;

pub use chunk::{decrypt_chunk, encrypt_chunk, ChunkGeometry, ChunkReader, EncryptedChunk, CHUNK_SIZE};
pub use codec::{decrypt, encrypt, WrappedBlob};
pub use kdf::{derive_key, login_hash, KdfParams};
pub use keys::{DerivedKey, FileKey, MasterKey, KEY_LENGTH};
