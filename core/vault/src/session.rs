//! Authenticated session management.
//!
//! A session owns the API key and the master key vault. Keys are populated
//! by [`Session::login`] and replaced atomically by re-login; they are
//! zeroized when the session is locked or dropped.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::master::MasterKeyVault;
use filenvault_api::{FilenApi, LoginRequest, StorageUsage, UserInfo, AUTH_VERSION};
use filenvault_common::{Credentials, Error, Result, SecretString, SensitiveBytes};
use filenvault_crypto::{derive_key, login_hash, KdfParams};

/// State of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Logged in; keys are available.
    Active,
    /// Not logged in, or locked; keys have been cleared.
    Locked,
}

/// Authenticated client session.
pub struct Session {
    api: Arc<dyn FilenApi>,
    credentials: Credentials,
    kdf_params: KdfParams,
    api_key: RwLock<Option<SecretString>>,
    vault: MasterKeyVault,
    /// Serializes logins so concurrent auth failures trigger one re-login.
    login_lock: Mutex<()>,
}

impl Session {
    /// Create a locked session. Call [`Session::login`] before use.
    pub fn new(api: Arc<dyn FilenApi>, credentials: Credentials, kdf_params: KdfParams) -> Self {
        Self {
            api,
            credentials,
            kdf_params,
            api_key: RwLock::new(None),
            vault: MasterKeyVault::new(),
            login_lock: Mutex::new(()),
        }
    }

    /// Create and log in.
    pub async fn open(
        api: Arc<dyn FilenApi>,
        credentials: Credentials,
        kdf_params: KdfParams,
    ) -> Result<Self> {
        let session = Self::new(api, credentials, kdf_params);
        session.login().await?;
        Ok(session)
    }

    /// Log in and install a fresh master key.
    ///
    /// # Postconditions
    /// - API key and master key belong to the same login
    ///
    /// # Errors
    /// - `Auth` if the service rejects the credentials
    /// - `Protocol` if the login response lacks required fields
    /// - `KeyUnwrap` if the master key cannot be unwrapped
    pub async fn login(&self) -> Result<()> {
        let _guard = self.login_lock.lock().await;
        self.login_locked().await
    }

    async fn login_locked(&self) -> Result<()> {
        let email = &self.credentials.email;
        let auth = self.api.auth_info(email).await?;

        let request = LoginRequest {
            email: email.clone(),
            password_hash: login_hash(self.credentials.password.expose(), &auth.salt),
            two_factor_code: String::new(),
            auth_version: AUTH_VERSION,
        };
        let data = self.api.login(&request).await?;

        let password = SensitiveBytes::new(self.credentials.password.expose().as_bytes().to_vec());
        let salt = data.salt.clone();
        let params = self.kdf_params;
        let derived = tokio::task::spawn_blocking(move || {
            derive_key(password.as_bytes(), &salt, &params)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        // masterKeys is validated non-empty; the first entry is the active key.
        let Some(wrapped) = data.master_keys.first() else {
            return Err(Error::missing_field(filenvault_api::endpoints::LOGIN, "masterKeys[0]"));
        };

        let mut api_key = self.api_key.write().await;
        self.vault.unlock(wrapped, &derived).await?;
        *api_key = Some(data.api_key);

        info!(email = %data.email, "Logged in");
        Ok(())
    }

    /// Current state.
    pub async fn state(&self) -> SessionState {
        if self.api_key.read().await.is_some() && self.vault.is_unlocked().await {
            SessionState::Active
        } else {
            SessionState::Locked
        }
    }

    /// The service client.
    pub fn api(&self) -> &Arc<dyn FilenApi> {
        &self.api
    }

    /// The master key vault.
    pub fn vault(&self) -> &MasterKeyVault {
        &self.vault
    }

    /// Current API key.
    ///
    /// # Errors
    /// - `Auth` if not logged in
    pub async fn api_key(&self) -> Result<SecretString> {
        self.api_key
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Auth("Not logged in".to_string()))
    }

    /// Run an authenticated call, re-logging in once if the API key expired.
    ///
    /// The call is repeated at most once. A second `Auth` failure is returned
    /// to the caller.
    pub async fn authed<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn FilenApi>, SecretString) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = self.api_key().await?;
        match call(self.api.clone(), key.clone()).await {
            Err(Error::Auth(reason)) => {
                warn!(%reason, "API key rejected, logging in again");
                self.relogin(&key).await?;
                let fresh = self.api_key().await?;
                call(self.api.clone(), fresh).await
            }
            other => other,
        }
    }

    /// Re-login unless another task already replaced `stale`.
    async fn relogin(&self, stale: &SecretString) -> Result<()> {
        let _guard = self.login_lock.lock().await;
        if self.api_key.read().await.as_ref() != Some(stale) {
            return Ok(());
        }
        self.login_locked().await
    }

    /// Account details.
    pub async fn user_info(&self) -> Result<UserInfo> {
        self.authed(|api, key| async move { api.user_info(&key).await })
            .await
    }

    /// Quota usage.
    pub async fn storage_usage(&self) -> Result<StorageUsage> {
        self.authed(|api, key| async move { api.storage_usage(&key).await })
            .await
    }

    /// Clear all keys from memory.
    pub async fn lock(&self) {
        let mut api_key = self.api_key.write().await;
        self.vault.clear().await;
        api_key.take();
    }
}
