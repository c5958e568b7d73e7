//! Symmetric codec: AES-256-CBC with PKCS#7 padding and a random IV.
//!
//! This is the single primitive behind master-key unwrap, file-key wrap,
//! metadata encryption and chunk encryption. Output is always
//! `iv || ciphertext`.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use std::fmt;

use crate::keys::KEY_LENGTH;
use filenvault_common::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// IV size (16 bytes).
pub const IV_SIZE: usize = 16;

/// AES block size (16 bytes).
pub const BLOCK_SIZE: usize = 16;

/// An encrypted value: IV plus block-aligned ciphertext.
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedBlob {
    iv: [u8; IV_SIZE],
    ciphertext: Vec<u8>,
}

impl WrappedBlob {
    /// Parse `iv || ciphertext`.
    ///
    /// # Errors
    /// - Returns `Decrypt` if the input is shorter than one IV plus one block
    ///   or the ciphertext is not block aligned
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < IV_SIZE + BLOCK_SIZE {
            return Err(Error::Decrypt("Ciphertext too short".to_string()));
        }
        let (iv, ciphertext) = bytes.split_at(IV_SIZE);
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(Error::Decrypt(
                "Ciphertext not aligned to block size".to_string(),
            ));
        }
        let mut iv_arr = [0u8; IV_SIZE];
        iv_arr.copy_from_slice(iv);
        Ok(Self {
            iv: iv_arr,
            ciphertext: ciphertext.to_vec(),
        })
    }

    /// Decode the base64 transport form.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Decrypt(format!("Invalid base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Serialize as `iv || ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Base64 transport form of `iv || ciphertext`.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    /// The IV.
    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// The ciphertext without IV.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Length of `iv || ciphertext`.
    pub fn len(&self) -> usize {
        IV_SIZE + self.ciphertext.len()
    }

    /// Never true for a parsed or produced blob; present for API symmetry.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Debug for WrappedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappedBlob({} bytes)", self.len())
    }
}

/// Length of the encoded blob produced for `plaintext_len` bytes.
///
/// Padding always adds between 1 and 16 bytes, so an aligned plaintext
/// gains a full block.
pub const fn encrypted_len(plaintext_len: usize) -> usize {
    IV_SIZE + (plaintext_len / BLOCK_SIZE + 1) * BLOCK_SIZE
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_LENGTH {
        return Err(Error::InvalidInput(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(())
}

/// Encrypt plaintext under a 32-byte key.
///
/// # Postconditions
/// - A fresh IV is drawn from the OS RNG for every call
/// - Ciphertext length is a multiple of BLOCK_SIZE
///
/// # Errors
/// - Returns error if key length is incorrect
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<WrappedBlob> {
    check_key(key)?;

    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let encryptor = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|e| Error::InvalidInput(format!("Failed to create encryptor: {}", e)))?;
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    Ok(WrappedBlob { iv, ciphertext })
}

/// Decrypt a blob under a 32-byte key.
///
/// # Errors
/// - Returns error if key length is incorrect
/// - Returns `Decrypt` if padding is invalid. The error does not say which
///   byte was wrong.
pub fn decrypt(key: &[u8], blob: &WrappedBlob) -> Result<Vec<u8>> {
    check_key(key)?;

    let decryptor = Aes256CbcDec::new_from_slices(key, &blob.iv)
        .map_err(|e| Error::InvalidInput(format!("Failed to create decryptor: {}", e)))?;

    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(&blob.ciphertext)
        .map_err(|_| Error::Decrypt("Ciphertext rejected".to_string()))
}

/// Parse and decrypt raw `iv || ciphertext` bytes.
pub fn decrypt_bytes(key: &[u8], bytes: &[u8]) -> Result<Vec<u8>> {
    decrypt(key, &WrappedBlob::from_bytes(bytes)?)
}
