//! Master key custody.
//!
//! The vault holds the account master key for the lifetime of a session and
//! performs every wrap/unwrap that needs it. The key is guarded by a
//! single-writer/many-reader lock: installing a new key after re-login
//! waits for in-flight wraps to finish, and no caller ever observes a mix
//! of old and new key.

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use filenvault_common::{Error, Result, SensitiveBytes};
use filenvault_crypto::{codec, DerivedKey, FileKey, MasterKey, WrappedBlob};

/// Folder name payload as wrapped under the master key.
#[derive(Serialize, Deserialize)]
struct FolderName {
    name: String,
}

/// Unwrap a base64 master key blob with the password-derived key.
///
/// # Errors
/// - `KeyUnwrap` for wrong key, corrupt blob or a plaintext that is not a
///   256-bit key. The message does not say which.
pub fn unwrap_master_key(wrapped: &str, derived: &DerivedKey) -> Result<MasterKey> {
    let rejected = |_| Error::KeyUnwrap("Master key could not be unwrapped".to_string());

    let blob = WrappedBlob::from_base64(wrapped).map_err(rejected)?;
    let plaintext = codec::decrypt(derived.as_bytes(), &blob).map_err(rejected)?;
    let plaintext = SensitiveBytes::new(plaintext);
    MasterKey::from_slice(plaintext.as_bytes()).map_err(rejected)
}

/// Session-scoped holder of the master key.
#[derive(Default)]
pub struct MasterKeyVault {
    key: RwLock<Option<MasterKey>>,
}

impl MasterKeyVault {
    /// Create an empty (locked) vault.
    pub fn new() -> Self {
        Self::default()
    }

    /// Unwrap `wrapped` and install the result as the active key.
    pub async fn unlock(&self, wrapped: &str, derived: &DerivedKey) -> Result<()> {
        let key = unwrap_master_key(wrapped, derived)?;
        self.install(key).await;
        Ok(())
    }

    /// Replace the active key. The previous key is zeroized on drop.
    pub async fn install(&self, key: MasterKey) {
        let mut guard = self.key.write().await;
        *guard = Some(key);
        debug!("Master key installed");
    }

    /// Drop the active key.
    pub async fn clear(&self) {
        self.key.write().await.take();
    }

    /// Whether a key is installed.
    pub async fn is_unlocked(&self) -> bool {
        self.key.read().await.is_some()
    }

    async fn with_key<T>(&self, f: impl FnOnce(&MasterKey) -> Result<T>) -> Result<T> {
        let guard = self.key.read().await;
        let key = guard
            .as_ref()
            .ok_or_else(|| Error::Auth("Vault is locked; log in first".to_string()))?;
        f(key)
    }

    /// Wrap a file key for upload (base64).
    pub async fn wrap_file_key(&self, file_key: &FileKey) -> Result<String> {
        self.with_key(|master| {
            codec::encrypt(master.as_bytes(), file_key.as_bytes()).map(|b| b.to_base64())
        })
        .await
    }

    /// Unwrap a file key received from the service.
    ///
    /// # Errors
    /// - `KeyUnwrap` if the blob is corrupt or was wrapped under another key
    pub async fn unwrap_file_key(&self, wrapped: &str) -> Result<FileKey> {
        self.with_key(|master| {
            let rejected = |_| Error::KeyUnwrap("File key could not be unwrapped".to_string());
            let blob = WrappedBlob::from_base64(wrapped).map_err(rejected)?;
            let plaintext =
                SensitiveBytes::new(codec::decrypt(master.as_bytes(), &blob).map_err(rejected)?);
            FileKey::from_slice(plaintext.as_bytes()).map_err(rejected)
        })
        .await
    }

    /// Wrap a folder name as `{"name": ..}` (base64).
    pub async fn wrap_folder_name(&self, name: &str) -> Result<String> {
        let payload = serde_json::to_vec(&FolderName {
            name: name.to_string(),
        })?;
        self.with_key(|master| codec::encrypt(master.as_bytes(), &payload).map(|b| b.to_base64()))
            .await
    }

    /// Recover a folder name.
    pub async fn unwrap_folder_name(&self, wrapped: &str) -> Result<String> {
        let plaintext = self
            .with_key(|master| {
                let blob = WrappedBlob::from_base64(wrapped)?;
                codec::decrypt(master.as_bytes(), &blob).map(SensitiveBytes::new)
            })
            .await?;
        let folder: FolderName = serde_json::from_slice(plaintext.as_bytes())?;
        Ok(folder.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filenvault_crypto::{derive_key, KdfParams};

    fn wrapped_master(password: &str, salt: &str) -> (MasterKey, String) {
        let master = MasterKey::generate();
        let derived = derive_key(password.as_bytes(), salt, &KdfParams::minimum()).unwrap();
        let wrapped = codec::encrypt(derived.as_bytes(), master.as_bytes())
            .unwrap()
            .to_base64();
        (master, wrapped)
    }

    #[test]
    fn test_unwrap_master_key() {
        let (master, wrapped) = wrapped_master("correct horse", "salt-1");
        let derived = derive_key(b"correct horse", "salt-1", &KdfParams::minimum()).unwrap();

        let unwrapped = unwrap_master_key(&wrapped, &derived).unwrap();
        assert_eq!(unwrapped.as_bytes(), master.as_bytes());
    }

    #[test]
    fn test_wrong_password_is_key_unwrap_error() {
        let (_, wrapped) = wrapped_master("correct horse", "salt-1");
        let derived = derive_key(b"battery staple", "salt-1", &KdfParams::minimum()).unwrap();

        match unwrap_master_key(&wrapped, &derived) {
            Err(Error::KeyUnwrap(message)) => assert!(!message.contains("padding")),
            other => panic!("expected KeyUnwrap, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_garbage_blob_is_key_unwrap_error() {
        let derived = DerivedKey::from_bytes([1u8; 32]);
        assert!(matches!(
            unwrap_master_key("not base64!", &derived),
            Err(Error::KeyUnwrap(_))
        ));
        assert!(matches!(
            unwrap_master_key("AAAA", &derived),
            Err(Error::KeyUnwrap(_))
        ));
    }

    #[tokio::test]
    async fn test_locked_vault_refuses_wrap() {
        let vault = MasterKeyVault::new();
        assert!(!vault.is_unlocked().await);
        assert!(matches!(
            vault.wrap_file_key(&FileKey::generate()).await,
            Err(Error::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_file_key_wrap_round_trip() {
        let vault = MasterKeyVault::new();
        vault.install(MasterKey::generate()).await;

        let file_key = FileKey::generate();
        let wrapped = vault.wrap_file_key(&file_key).await.unwrap();
        let unwrapped = vault.unwrap_file_key(&wrapped).await.unwrap();
        assert_eq!(unwrapped.as_bytes(), file_key.as_bytes());

        // Installing a new master key invalidates keys wrapped under the old one.
        vault.install(MasterKey::generate()).await;
        assert!(matches!(
            vault.unwrap_file_key(&wrapped).await,
            Err(Error::KeyUnwrap(_))
        ));
    }

    #[tokio::test]
    async fn test_folder_name_round_trip() {
        let vault = MasterKeyVault::new();
        vault.install(MasterKey::generate()).await;

        let wrapped = vault.wrap_folder_name("Photos 2024").await.unwrap();
        assert_eq!(vault.unwrap_folder_name(&wrapped).await.unwrap(), "Photos 2024");

        vault.clear().await;
        assert!(vault.unwrap_folder_name(&wrapped).await.is_err());
    }
}
