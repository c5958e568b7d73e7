//! In-memory service double for testing.
//!
//! Behaves like the remote service for every endpoint of [`FilenApi`]:
//! accounts log in with the login hash, uploads go through prepare, chunk
//! and done, and finished files can be fetched back as one blob. Failures
//! can be injected and every call is recorded.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use rand::{rngs::OsRng, RngCore};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::dto::{
    endpoints, AuthInfo, ChunkTarget, CreateFolderRequest, DirContent, DoneRequest, FileInfo,
    LoginData, LoginRequest, MoveRequest, PrepareRequest, RemoteFolder, StorageUsage, UserInfo,
};
use crate::service::{ByteStream, FilenApi};
use filenvault_common::{Error, FolderRef, RemoteId, Result, SecretString};
use filenvault_crypto::{codec, derive_key, login_hash, KdfParams, MasterKey};

const BLOB_URL_PREFIX: &str = "memory://blob/";

/// Default quota reported by `storage_usage`.
const DEFAULT_QUOTA: u64 = 10 * 1024 * 1024 * 1024;

struct Account {
    auth_salt: String,
    key_salt: String,
    hash: String,
    wrapped_master_key: String,
}

struct PendingUpload {
    upload_key: String,
    folder: String,
    chunks: BTreeMap<u64, Vec<u8>>,
}

struct StoredFile {
    folder: String,
    key: String,
    metadata: String,
    chunks: u64,
    size: u64,
    blob: Vec<u8>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    sessions: HashMap<String, String>,
    uploads: HashMap<String, PendingUpload>,
    files: HashMap<String, StoredFile>,
    folders: Vec<RemoteFolder>,
    listing_fixtures: Vec<(String, Value)>,
    chunk_failures: HashMap<u64, u32>,
    stalled_chunks: HashSet<u64>,
    prepare_failures: u32,
    calls: Vec<String>,
}

/// In-memory implementation of the service.
///
/// Data lives only as long as the value.
#[derive(Default)]
pub struct MemoryApi {
    state: Mutex<State>,
}

fn random_salt() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl MemoryApi {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, endpoint: &str) -> MutexGuard<'_, State> {
        let mut state = self.state();
        state.calls.push(endpoint.to_string());
        state
    }

    /// Register an account and return its freshly generated master key.
    ///
    /// The master key is wrapped under the key derived from `password`
    /// with `params`, exactly as a client would have stored it.
    pub fn add_account(&self, email: &str, password: &str, params: &KdfParams) -> Result<MasterKey> {
        let auth_salt = random_salt();
        let key_salt = random_salt();
        let master_key = MasterKey::generate();

        let derived = derive_key(password.as_bytes(), &key_salt, params)?;
        let wrapped_master_key = codec::encrypt(derived.as_bytes(), master_key.as_bytes())?.to_base64();

        let account = Account {
            hash: login_hash(password, &auth_salt),
            auth_salt,
            key_salt,
            wrapped_master_key,
        };
        self.state().accounts.insert(email.to_string(), account);
        Ok(master_key)
    }

    /// Fail the next `times` deliveries of the chunk with 1-based `index`.
    pub fn fail_chunk(&self, index: u64, times: u32) {
        self.state().chunk_failures.insert(index, times);
    }

    /// Never answer deliveries of the chunk with 1-based `index`.
    pub fn stall_chunk(&self, index: u64) {
        self.state().stalled_chunks.insert(index);
    }

    /// Fail the next `times` prepare calls.
    pub fn fail_prepare(&self, times: u32) {
        self.state().prepare_failures = times;
    }

    /// Invalidate every issued API key.
    pub fn expire_api_keys(&self) {
        self.state().sessions.clear();
    }

    /// Add a raw listing entry under `folder`, sent exactly as given.
    pub fn insert_entry(&self, folder: &FolderRef, entry: Value) {
        self.state()
            .listing_fixtures
            .push((folder.as_wire().to_string(), entry));
    }

    /// Endpoints called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of calls made to `endpoint`.
    pub fn call_count(&self, endpoint: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == endpoint).count()
    }

    /// Whether a finished file exists.
    pub fn has_file(&self, uuid: &RemoteId) -> bool {
        self.state().files.contains_key(uuid.as_str())
    }

    /// Whether a folder exists.
    pub fn has_folder(&self, uuid: &RemoteId) -> bool {
        self.state().folder_exists(uuid.as_str())
    }

    /// Number of upload sessions that were prepared but never finished.
    pub fn pending_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    /// Stored encrypted blob of a finished file.
    pub fn stored_blob(&self, uuid: &RemoteId) -> Option<Vec<u8>> {
        self.state().files.get(uuid.as_str()).map(|f| f.blob.clone())
    }

    /// Replace the stored blob of a finished file.
    pub fn replace_blob(&self, uuid: &RemoteId, blob: Vec<u8>) {
        if let Some(file) = self.state().files.get_mut(uuid.as_str()) {
            file.blob = blob;
        }
    }

    /// Replace the wrapped key of a finished file.
    pub fn replace_file_key(&self, uuid: &RemoteId, key: &str) {
        if let Some(file) = self.state().files.get_mut(uuid.as_str()) {
            file.key = key.to_string();
        }
    }
}

impl State {
    fn check_key(&self, endpoint: &str, api_key: &SecretString) -> Result<String> {
        self.sessions
            .get(api_key.expose())
            .cloned()
            .ok_or_else(|| Error::Auth(format!("{} rejected the API key", endpoint)))
    }

    fn folder_exists(&self, wire: &str) -> bool {
        wire == FolderRef::Root.as_wire() || self.folders.iter().any(|f| f.uuid == wire)
    }

    /// `uuid` and every folder below it.
    fn subtree(&self, uuid: &str) -> HashSet<String> {
        let mut found = HashSet::from([uuid.to_string()]);
        loop {
            let before = found.len();
            for folder in &self.folders {
                if folder.parent.as_deref().is_some_and(|p| found.contains(p)) {
                    found.insert(folder.uuid.clone());
                }
            }
            if found.len() == before {
                return found;
            }
        }
    }
}

fn rejected(endpoint: &str, message: &str) -> Error {
    Error::Api {
        endpoint: endpoint.to_string(),
        message: message.to_string(),
    }
}

fn refused(endpoint: &str, message: &str) -> Error {
    Error::Auth(format!("{}: {}", endpoint, message))
}

#[async_trait]
impl FilenApi for MemoryApi {
    fn name(&self) -> &str {
        "memory"
    }

    async fn auth_info(&self, email: &str) -> Result<AuthInfo> {
        let state = self.record(endpoints::AUTH_INFO);
        let account = state
            .accounts
            .get(email)
            .ok_or_else(|| refused(endpoints::AUTH_INFO, "Account not found"))?;
        Ok(AuthInfo {
            salt: account.auth_salt.clone(),
            auth_version: Some(crate::dto::AUTH_VERSION),
        })
    }

    async fn login(&self, request: &LoginRequest) -> Result<LoginData> {
        let mut state = self.record(endpoints::LOGIN);
        let account = state
            .accounts
            .get(&request.email)
            .ok_or_else(|| refused(endpoints::LOGIN, "Invalid credentials"))?;

        let matches: bool = account
            .hash
            .as_bytes()
            .ct_eq(request.password_hash.as_bytes())
            .into();
        if !matches {
            return Err(refused(endpoints::LOGIN, "Invalid credentials"));
        }

        let data = LoginData {
            api_key: SecretString::new(Uuid::new_v4().to_string()),
            master_keys: vec![account.wrapped_master_key.clone()],
            salt: account.key_salt.clone(),
            email: request.email.clone(),
        };
        state
            .sessions
            .insert(data.api_key.expose().to_string(), request.email.clone());
        Ok(data)
    }

    async fn user_info(&self, api_key: &SecretString) -> Result<UserInfo> {
        let state = self.record(endpoints::USER_INFO);
        let email = state.check_key(endpoints::USER_INFO, api_key)?;
        Ok(UserInfo {
            email,
            plan: Some("Free".to_string()),
            extra: Default::default(),
        })
    }

    async fn storage_usage(&self, api_key: &SecretString) -> Result<StorageUsage> {
        let state = self.record(endpoints::USER_STORAGE);
        state.check_key(endpoints::USER_STORAGE, api_key)?;
        let used = state.files.values().map(|f| f.size).sum();
        Ok(StorageUsage {
            used,
            total: DEFAULT_QUOTA,
            max_upload_speed: None,
        })
    }

    async fn upload_prepare(&self, api_key: &SecretString, request: &PrepareRequest) -> Result<String> {
        let mut state = self.record(endpoints::UPLOAD_PREPARE);
        state.check_key(endpoints::UPLOAD_PREPARE, api_key)?;

        if state.prepare_failures > 0 {
            state.prepare_failures -= 1;
            return Err(Error::Network("injected prepare failure".to_string()));
        }

        let upload_key = Uuid::new_v4().to_string();
        state.uploads.insert(
            request.uuid.to_string(),
            PendingUpload {
                upload_key: upload_key.clone(),
                folder: request.folder.clone(),
                chunks: BTreeMap::new(),
            },
        );
        Ok(upload_key)
    }

    async fn upload_chunk(&self, target: &ChunkTarget, data: Bytes) -> Result<()> {
        let stalled = self.record(endpoints::UPLOAD).stalled_chunks.contains(&target.index);
        if stalled {
            futures::future::pending::<()>().await;
        }

        let mut state = self.state();

        if let Some(remaining) = state.chunk_failures.get_mut(&target.index) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Network(format!(
                    "injected failure for chunk {}",
                    target.index
                )));
            }
        }

        let upload = state
            .uploads
            .get_mut(target.uuid.as_str())
            .filter(|u| u.upload_key == target.upload_key)
            .ok_or_else(|| rejected(endpoints::UPLOAD, "Unknown upload session"))?;
        if target.index == 0 {
            return Err(rejected(endpoints::UPLOAD, "Chunk indices start at 1"));
        }
        upload.chunks.insert(target.index, data.to_vec());
        Ok(())
    }

    async fn upload_done(&self, api_key: &SecretString, request: &DoneRequest) -> Result<()> {
        let mut state = self.record(endpoints::UPLOAD_DONE);
        state.check_key(endpoints::UPLOAD_DONE, api_key)?;

        let upload = match state.uploads.get(request.uuid.as_str()) {
            Some(u) if u.upload_key == request.upload_key => u,
            _ => return Err(rejected(endpoints::UPLOAD_DONE, "Unknown upload session")),
        };
        let expected: Vec<u64> = (1..=request.chunks).collect();
        let received: Vec<u64> = upload.chunks.keys().copied().collect();
        if expected != received {
            return Err(rejected(endpoints::UPLOAD_DONE, "Chunks missing"));
        }

        let Some(upload) = state.uploads.remove(request.uuid.as_str()) else {
            return Err(rejected(endpoints::UPLOAD_DONE, "Unknown upload session"));
        };
        let file = StoredFile {
            folder: upload.folder,
            key: request.key.clone(),
            metadata: request.metadata.clone(),
            chunks: request.chunks,
            size: request.size,
            blob: upload.chunks.into_values().flatten().collect(),
        };
        state.files.insert(request.uuid.to_string(), file);
        Ok(())
    }

    async fn file_info(&self, api_key: &SecretString, uuid: &RemoteId) -> Result<FileInfo> {
        let state = self.record(endpoints::FILE_INFO);
        state.check_key(endpoints::FILE_INFO, api_key)?;
        let file = state
            .files
            .get(uuid.as_str())
            .ok_or_else(|| rejected(endpoints::FILE_INFO, "File not found"))?;
        Ok(FileInfo {
            key: file.key.clone(),
            metadata: file.metadata.clone(),
            chunks: Some(file.chunks),
        })
    }

    async fn download_url(&self, api_key: &SecretString, uuid: &RemoteId) -> Result<String> {
        let state = self.record(endpoints::DOWNLOAD_FILE);
        state.check_key(endpoints::DOWNLOAD_FILE, api_key)?;
        if !state.files.contains_key(uuid.as_str()) {
            return Err(rejected(endpoints::DOWNLOAD_FILE, "File not found"));
        }
        Ok(format!("{}{}", BLOB_URL_PREFIX, uuid))
    }

    async fn fetch_blob(&self, url: &str) -> Result<ByteStream> {
        let state = self.record("download");
        let uuid = url
            .strip_prefix(BLOB_URL_PREFIX)
            .ok_or_else(|| Error::NotFound(format!("Unknown download URL: {}", url)))?;
        let blob = state
            .files
            .get(uuid)
            .map(|f| f.blob.clone())
            .ok_or_else(|| Error::NotFound(format!("Blob not found: {}", uuid)))?;

        // Deliver in uneven pieces so readers cannot rely on chunk-aligned reads.
        let pieces: Vec<Result<Bytes>> = blob
            .chunks(7919)
            .map(|piece| Ok(Bytes::copy_from_slice(piece)))
            .collect();
        Ok(Box::pin(stream::iter(pieces)))
    }

    async fn dir_content(&self, api_key: &SecretString, folder: &FolderRef) -> Result<DirContent> {
        let state = self.record(endpoints::DIR_CONTENT);
        state.check_key(endpoints::DIR_CONTENT, api_key)?;
        let wire = folder.as_wire();

        let mut stored: Vec<_> = state.files.iter().filter(|(_, f)| f.folder == wire).collect();
        stored.sort_by(|a, b| a.0.cmp(b.0));

        let mut files: Vec<Value> = stored
            .into_iter()
            .map(|(uuid, f)| {
                json!({
                    "uuid": uuid,
                    "key": f.key,
                    "metadata": f.metadata,
                    "chunks": f.chunks,
                })
            })
            .collect();
        files.extend(
            state
                .listing_fixtures
                .iter()
                .filter(|(parent, _)| parent == wire)
                .map(|(_, entry)| entry.clone()),
        );

        let folders = state
            .folders
            .iter()
            .filter(|f| f.parent.as_deref() == Some(wire))
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(DirContent { files, folders })
    }

    async fn create_folder(
        &self,
        api_key: &SecretString,
        request: &CreateFolderRequest,
    ) -> Result<RemoteId> {
        let mut state = self.record(endpoints::DIR_CREATE);
        state.check_key(endpoints::DIR_CREATE, api_key)?;
        if !state.folder_exists(&request.parent) {
            return Err(rejected(endpoints::DIR_CREATE, "Parent folder not found"));
        }
        state.folders.push(RemoteFolder {
            uuid: request.uuid.to_string(),
            name: Some(request.name.clone()),
            parent: Some(request.parent.clone()),
        });
        Ok(request.uuid.clone())
    }

    async fn move_file(&self, api_key: &SecretString, request: &MoveRequest) -> Result<()> {
        let mut state = self.record(endpoints::FILE_MOVE);
        state.check_key(endpoints::FILE_MOVE, api_key)?;
        if !state.folder_exists(&request.to) {
            return Err(rejected(endpoints::FILE_MOVE, "Destination folder not found"));
        }
        let file = state
            .files
            .get_mut(request.uuid.as_str())
            .ok_or_else(|| rejected(endpoints::FILE_MOVE, "File not found"))?;
        file.folder = request.to.clone();
        Ok(())
    }

    async fn trash_file(&self, api_key: &SecretString, uuid: &RemoteId) -> Result<()> {
        let mut state = self.record(endpoints::FILE_TRASH);
        state.check_key(endpoints::FILE_TRASH, api_key)?;
        state
            .files
            .remove(uuid.as_str())
            .map(|_| ())
            .ok_or_else(|| rejected(endpoints::FILE_TRASH, "File not found"))
    }

    async fn move_folder(&self, api_key: &SecretString, request: &MoveRequest) -> Result<()> {
        let mut state = self.record(endpoints::DIR_MOVE);
        state.check_key(endpoints::DIR_MOVE, api_key)?;
        if !state.folders.iter().any(|f| f.uuid == request.uuid.as_str()) {
            return Err(rejected(endpoints::DIR_MOVE, "Folder not found"));
        }
        if !state.folder_exists(&request.to) {
            return Err(rejected(endpoints::DIR_MOVE, "Destination folder not found"));
        }
        if state.subtree(request.uuid.as_str()).contains(&request.to) {
            return Err(rejected(endpoints::DIR_MOVE, "Cannot move a folder into itself"));
        }
        for folder in state.folders.iter_mut() {
            if folder.uuid == request.uuid.as_str() {
                folder.parent = Some(request.to.clone());
            }
        }
        Ok(())
    }

    async fn trash_folder(&self, api_key: &SecretString, uuid: &RemoteId) -> Result<()> {
        let mut state = self.record(endpoints::DIR_TRASH);
        state.check_key(endpoints::DIR_TRASH, api_key)?;
        if !state.folders.iter().any(|f| f.uuid == uuid.as_str()) {
            return Err(rejected(endpoints::DIR_TRASH, "Folder not found"));
        }
        let doomed = state.subtree(uuid.as_str());
        state.folders.retain(|f| !doomed.contains(&f.uuid));
        state.files.retain(|_, f| !doomed.contains(&f.folder));
        state.listing_fixtures.retain(|(parent, _)| !doomed.contains(parent));
        Ok(())
    }
}
