//! Request and response payloads, one set per endpoint.
//!
//! Responses are deserialized into `Raw*` shapes whose fields are all
//! optional, then validated into the types the rest of the crate uses.
//! A missing required field becomes [`Error::Protocol`] naming the endpoint.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use filenvault_common::{Error, RemoteId, Result, SecretString};

/// Endpoint paths, relative to the API base URL.
pub mod endpoints {
    /// Account salt lookup.
    pub const AUTH_INFO: &str = "/v3/auth/info";
    /// Login with the login hash.
    pub const LOGIN: &str = "/v3/login";
    /// Account details.
    pub const USER_INFO: &str = "/v3/user/info";
    /// Quota usage.
    pub const USER_STORAGE: &str = "/v3/user/storage";
    /// Open an upload session.
    pub const UPLOAD_PREPARE: &str = "/v3/upload/prepare";
    /// Deliver one encrypted chunk.
    pub const UPLOAD: &str = "/v3/upload";
    /// Commit an upload session.
    pub const UPLOAD_DONE: &str = "/v3/upload/done";
    /// Wrapped key and metadata of a file.
    pub const FILE_INFO: &str = "/v3/file/info";
    /// Download URL of a file.
    pub const DOWNLOAD_FILE: &str = "/v3/download/file";
    /// Move a file into another folder.
    pub const FILE_MOVE: &str = "/v3/file/move";
    /// Move a file to the trash.
    pub const FILE_TRASH: &str = "/v3/file/trash";
    /// Folder listing.
    pub const DIR_CONTENT: &str = "/v3/dir/content";
    /// Create a folder.
    pub const DIR_CREATE: &str = "/v3/dir/create";
    /// Move a folder into another folder.
    pub const DIR_MOVE: &str = "/v3/dir/move";
    /// Move a folder and its contents to the trash.
    pub const DIR_TRASH: &str = "/v3/dir/trash";
}

use endpoints::*;

/// Authentication version sent at login.
pub const AUTH_VERSION: u32 = 2;

/// Common response wrapper: `{status, message?, data?}`.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    /// Whether the request succeeded.
    pub status: bool,
    /// Human-readable message, usually present on failure.
    #[serde(default)]
    pub message: Option<String>,
    /// Endpoint payload.
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    /// Unwrap the payload, turning `status: false` into [`Error::Api`].
    pub fn into_data(self, endpoint: &str) -> Result<T> {
        if !self.status {
            return Err(Error::Api {
                endpoint: endpoint.to_string(),
                message: self.message.unwrap_or_else(|| "Unknown error".to_string()),
            });
        }
        self.data.ok_or_else(|| Error::missing_field(endpoint, "data"))
    }

    /// Check status only, ignoring any payload.
    pub fn into_status(self, endpoint: &str) -> Result<()> {
        if self.status {
            Ok(())
        } else {
            Err(Error::Api {
                endpoint: endpoint.to_string(),
                message: self.message.unwrap_or_else(|| "Unknown error".to_string()),
            })
        }
    }
}

fn require<T>(value: Option<T>, endpoint: &str, field: &str) -> Result<T> {
    value.ok_or_else(|| Error::missing_field(endpoint, field))
}

fn require_text(value: Option<String>, endpoint: &str, field: &str) -> Result<String> {
    match value {
        Some(text) if !text.is_empty() => Ok(text),
        _ => Err(Error::missing_field(endpoint, field)),
    }
}

// ---------------------------------------------------------------------------
// auth

/// `POST /v3/auth/info`
#[derive(Debug, Clone, Serialize)]
pub struct AuthInfoRequest {
    /// Account email.
    pub email: String,
}

/// `/auth/info` payload as received.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAuthInfo {
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub auth_version: Option<u32>,
}

/// Validated `/auth/info` payload.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    /// Per-account salt.
    pub salt: String,
    /// Auth version the account uses, if reported.
    pub auth_version: Option<u32>,
}

impl RawAuthInfo {
    pub fn validate(self) -> Result<AuthInfo> {
        Ok(AuthInfo {
            salt: require_text(self.salt, AUTH_INFO, "salt")?,
            auth_version: self.auth_version,
        })
    }
}

/// `POST /v3/login`
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// Account email.
    pub email: String,
    /// The login hash, never the password.
    #[serde(rename = "password")]
    pub password_hash: String,
    /// Second factor; empty when the account has none.
    pub two_factor_code: String,
    /// Always [`AUTH_VERSION`].
    pub auth_version: u32,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("auth_version", &self.auth_version)
            .finish_non_exhaustive()
    }
}

/// Login payload as received.
#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLogin {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub master_keys: Option<Vec<String>>,
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Validated login payload.
#[derive(Debug, Clone)]
pub struct LoginData {
    /// Token for authenticated calls.
    pub api_key: SecretString,
    /// Wrapped master keys (base64); the first is the active one.
    pub master_keys: Vec<String>,
    /// Salt for master-key derivation.
    pub salt: String,
    /// Account email as the server knows it.
    pub email: String,
}

impl RawLogin {
    pub fn validate(self) -> Result<LoginData> {
        let master_keys = require(self.master_keys, LOGIN, "masterKeys")?;
        if master_keys.is_empty() {
            return Err(Error::missing_field(LOGIN, "masterKeys[0]"));
        }
        Ok(LoginData {
            api_key: SecretString::new(require_text(self.api_key, LOGIN, "apiKey")?),
            master_keys,
            salt: require_text(self.salt, LOGIN, "salt")?,
            email: require_text(self.email, LOGIN, "email")?,
        })
    }
}

// ---------------------------------------------------------------------------
// user

/// `/user/info` payload as received.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUserInfo {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub plan: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Account details from `/v3/user/info`.
#[derive(Debug, Clone)]
pub struct UserInfo {
    /// Account email.
    pub email: String,
    /// Plan name if the service reports one.
    pub plan: Option<String>,
    /// Everything else the service sent.
    pub extra: Map<String, Value>,
}

impl RawUserInfo {
    pub fn validate(self) -> Result<UserInfo> {
        let plan = match self.plan {
            Some(Value::String(name)) => Some(name),
            Some(Value::Object(obj)) => obj.get("name").and_then(Value::as_str).map(String::from),
            _ => None,
        };
        Ok(UserInfo {
            email: require_text(self.email, USER_INFO, "email")?,
            plan,
            extra: self.extra,
        })
    }
}

/// `/user/storage` payload as received.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStorageUsage {
    #[serde(default)]
    pub storage: Option<u64>,
    #[serde(default)]
    pub max_storage: Option<u64>,
    #[serde(default)]
    pub max_upload_speed: Option<u64>,
}

/// Quota figures from `/v3/user/storage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    /// Bytes in use.
    pub used: u64,
    /// Quota in bytes.
    pub total: u64,
    /// Upload bandwidth cap in bytes per second, if any.
    pub max_upload_speed: Option<u64>,
}

impl StorageUsage {
    /// Share of the quota in use, in percent. Zero when there is no quota.
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used as f64 / self.total as f64 * 100.0
    }
}

impl RawStorageUsage {
    pub fn validate(self) -> Result<StorageUsage> {
        Ok(StorageUsage {
            used: require(self.storage, USER_STORAGE, "storage")?,
            total: require(self.max_storage, USER_STORAGE, "maxStorage")?,
            max_upload_speed: self.max_upload_speed,
        })
    }
}

// ---------------------------------------------------------------------------
// upload

/// `POST /v3/upload/prepare` body (API key added by the transport).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareRequest {
    /// Identifier chosen for the new file.
    pub uuid: RemoteId,
    /// Destination folder on the wire (`"base"` for the root).
    pub folder: String,
    /// File name encrypted under the file key (base64).
    pub name: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Number of chunks that will be delivered.
    pub chunks: u64,
    /// MIME type.
    pub mime: String,
}

/// `/upload/prepare` payload as received.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPrepare {
    #[serde(default)]
    pub upload_key: Option<String>,
}

impl RawPrepare {
    /// Returns the upload key.
    pub fn validate(self) -> Result<String> {
        require_text(self.upload_key, UPLOAD_PREPARE, "uploadKey")
    }
}

/// Addressing for one `POST /v3/upload` call; the chunk bytes are the body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkTarget {
    /// File being uploaded.
    pub uuid: RemoteId,
    /// Key returned by prepare.
    pub upload_key: String,
    /// 1-based chunk index.
    #[serde(rename = "chunk")]
    pub index: u64,
}

/// `POST /v3/upload/done` body (API key added by the transport).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneRequest {
    /// File being uploaded.
    pub uuid: RemoteId,
    /// Key returned by prepare.
    pub upload_key: String,
    /// File name encrypted under the file key (base64).
    pub name: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Number of chunks delivered.
    pub chunks: u64,
    /// MIME type.
    pub mime: String,
    /// Metadata JSON encrypted under the file key (base64).
    pub metadata: String,
    /// File key wrapped under the master key (base64).
    pub key: String,
}

// ---------------------------------------------------------------------------
// files

/// Body carrying a single identifier (`file/info`, `download/file`,
/// `dir/content` and the trash endpoints).
#[derive(Debug, Clone, Serialize)]
pub struct UuidRequest {
    /// File or folder identifier.
    pub uuid: String,
}

/// Body of `POST /v3/file/move` and `POST /v3/dir/move`.
#[derive(Debug, Clone, Serialize)]
pub struct MoveRequest {
    /// File or folder being moved.
    pub uuid: RemoteId,
    /// Destination folder on the wire (`"base"` for the root).
    pub to: String,
}

/// `/file/info` payload as received.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFileInfo {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
    #[serde(default)]
    pub chunks: Option<u64>,
}

/// Validated `/v3/file/info` payload.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// File key wrapped under the master key (base64).
    pub key: String,
    /// Metadata wrapped under the file key (base64).
    pub metadata: String,
    /// Chunk count recorded at upload, when the service reports it.
    pub chunks: Option<u64>,
}

impl RawFileInfo {
    pub fn validate(self) -> Result<FileInfo> {
        Ok(FileInfo {
            key: require_text(self.key, FILE_INFO, "key")?,
            metadata: require_text(self.metadata, FILE_INFO, "metadata")?,
            chunks: self.chunks,
        })
    }
}

/// `/download/file` payload as received.
#[derive(Debug, Default, Deserialize)]
pub struct RawDownload {
    #[serde(default, rename = "downloadURL")]
    pub download_url: Option<String>,
}

impl RawDownload {
    pub fn validate(self) -> Result<String> {
        require_text(self.download_url, DOWNLOAD_FILE, "downloadURL")
    }
}

// ---------------------------------------------------------------------------
// directories

/// Typed view of a listed file.
///
/// Listings keep entries as raw JSON; this is read out of one entry at a
/// time so a malformed entry only affects itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// File identifier.
    pub uuid: String,
    /// File key wrapped under the master key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Metadata wrapped under the file key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// Typed view of a listed folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    /// Folder identifier.
    pub uuid: String,
    /// `{"name": ..}` wrapped under the master key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Parent folder on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

fn malformed_entry(err: serde_json::Error) -> Error {
    Error::Protocol {
        endpoint: DIR_CONTENT.to_string(),
        message: format!("malformed entry: {}", err),
    }
}

impl RemoteEntry {
    /// Read the typed fields of a raw listing entry.
    ///
    /// # Errors
    /// - `Protocol` if `uuid` is missing or a field has the wrong type
    pub fn from_raw(raw: &Value) -> Result<Self> {
        Self::deserialize(raw).map_err(malformed_entry)
    }
}

impl RemoteFolder {
    /// Read the typed fields of a raw listing entry.
    ///
    /// # Errors
    /// - `Protocol` if `uuid` is missing or a field has the wrong type
    pub fn from_raw(raw: &Value) -> Result<Self> {
        Self::deserialize(raw).map_err(malformed_entry)
    }
}

/// `uuid` of a raw listing entry, if it has a string one.
pub fn raw_uuid(raw: &Value) -> Option<&str> {
    raw.get("uuid").and_then(Value::as_str)
}

/// `/v3/dir/content` payload.
///
/// Entries are kept exactly as sent; only the two lists themselves are
/// required to be arrays.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirContent {
    /// Raw file entries.
    #[serde(default)]
    pub files: Vec<Value>,
    /// Raw folder entries.
    #[serde(default)]
    pub folders: Vec<Value>,
}

/// `POST /v3/dir/create` body (API key added by the transport).
#[derive(Debug, Clone, Serialize)]
pub struct CreateFolderRequest {
    /// Identifier chosen for the new folder.
    pub uuid: RemoteId,
    /// `{"name": ..}` wrapped under the master key (base64).
    pub name: String,
    /// Parent folder on the wire.
    pub parent: String,
}

/// `/dir/create` payload as received.
#[derive(Debug, Default, Deserialize)]
pub struct RawCreateFolder {
    #[serde(default)]
    pub uuid: Option<String>,
}

impl RawCreateFolder {
    pub fn validate(self) -> Result<RemoteId> {
        RemoteId::new(require_text(self.uuid, DIR_CREATE, "uuid")?)
    }
}
