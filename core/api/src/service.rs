//! The remote service interface.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

use crate::dto::{
    AuthInfo, ChunkTarget, CreateFolderRequest, DirContent, DoneRequest, FileInfo, LoginData,
    LoginRequest, MoveRequest, PrepareRequest, StorageUsage, UserInfo,
};
use filenvault_common::{FolderRef, RemoteId, Result, SecretString};

/// Byte stream type for downloads.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Endpoints the transfer engine needs from the service.
///
/// Every call is a single request: retries, re-login and cancellation are
/// layered on top by the caller. Implementations map transport failures to
/// `Network`/`Timeout`, HTTP 401 to `Auth`, `status: false` to `Api` (or
/// `Auth` for `auth_info` and `login`) and missing fields to `Protocol`.
#[async_trait]
pub trait FilenApi: Send + Sync {
    /// Implementation name (e.g. "http", "memory").
    fn name(&self) -> &str;

    /// Fetch the account salt. An unknown account is `Auth`.
    async fn auth_info(&self, email: &str) -> Result<AuthInfo>;

    /// Log in with the login hash. Refused credentials are `Auth`.
    async fn login(&self, request: &LoginRequest) -> Result<LoginData>;

    /// Account details.
    async fn user_info(&self, api_key: &SecretString) -> Result<UserInfo>;

    /// Quota usage.
    async fn storage_usage(&self, api_key: &SecretString) -> Result<StorageUsage>;

    /// Open an upload session; returns the upload key.
    async fn upload_prepare(&self, api_key: &SecretString, request: &PrepareRequest) -> Result<String>;

    /// Deliver one encrypted chunk.
    async fn upload_chunk(&self, target: &ChunkTarget, data: Bytes) -> Result<()>;

    /// Commit an upload session.
    async fn upload_done(&self, api_key: &SecretString, request: &DoneRequest) -> Result<()>;

    /// Wrapped key and metadata of a file.
    async fn file_info(&self, api_key: &SecretString, uuid: &RemoteId) -> Result<FileInfo>;

    /// Short-lived URL for the encrypted blob.
    async fn download_url(&self, api_key: &SecretString, uuid: &RemoteId) -> Result<String>;

    /// Stream the encrypted blob behind a download URL.
    async fn fetch_blob(&self, url: &str) -> Result<ByteStream>;

    /// List a folder.
    async fn dir_content(&self, api_key: &SecretString, folder: &FolderRef) -> Result<DirContent>;

    /// Create a folder.
    async fn create_folder(
        &self,
        api_key: &SecretString,
        request: &CreateFolderRequest,
    ) -> Result<RemoteId>;

    /// Move a file into another folder.
    async fn move_file(&self, api_key: &SecretString, request: &MoveRequest) -> Result<()>;

    /// Move a file to the trash.
    async fn trash_file(&self, api_key: &SecretString, uuid: &RemoteId) -> Result<()>;

    /// Move a folder into another folder.
    async fn move_folder(&self, api_key: &SecretString, request: &MoveRequest) -> Result<()>;

    /// Move a folder and everything below it to the trash.
    async fn trash_folder(&self, api_key: &SecretString, uuid: &RemoteId) -> Result<()>;
}
