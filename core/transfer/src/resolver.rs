//! Best-effort decryption of folder listings.
//!
//! Every entry is decrypted on its own into a `Result`; a final pass keeps
//! the decrypted metadata where it worked and the raw entry where it did
//! not. One bad entry never fails the listing.

use futures::future::join_all;
use serde_json::Value;
use tracing::warn;

use crate::metadata::FileMetadata;
use filenvault_api::{endpoints, raw_uuid, DirContent, RemoteEntry, RemoteFolder};
use filenvault_common::{Error, Result};
use filenvault_vault::MasterKeyVault;

/// Placeholder for entries that arrive without a usable `uuid`.
const UNKNOWN_UUID: &str = "<unknown>";

/// A listed file, decrypted where possible.
#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    /// The entry exactly as the service sent it.
    pub raw: Value,
    /// Decrypted metadata, `None` if it could not be recovered.
    pub metadata: Option<FileMetadata>,
}

impl ResolvedEntry {
    /// Entry identifier, if the service sent one.
    pub fn uuid(&self) -> Option<&str> {
        raw_uuid(&self.raw)
    }

    /// Whether metadata was recovered.
    pub fn is_decrypted(&self) -> bool {
        self.metadata.is_some()
    }

    /// The raw entry with the decrypted `name`, `size`, `mime` and
    /// `lastModified` merged in.
    pub fn merged(&self) -> Value {
        let mut merged = self.raw.clone();
        if let (Value::Object(object), Some(Ok(Value::Object(decrypted)))) = (
            &mut merged,
            self.metadata.as_ref().map(serde_json::to_value),
        ) {
            object.extend(decrypted);
        }
        merged
    }
}

/// A listed folder, name decrypted where possible.
#[derive(Debug, Clone)]
pub struct ResolvedFolder {
    /// The folder exactly as the service sent it.
    pub raw: Value,
    /// Decrypted name, `None` if it could not be recovered.
    pub name: Option<String>,
}

impl ResolvedFolder {
    /// Folder identifier, if the service sent one.
    pub fn uuid(&self) -> Option<&str> {
        raw_uuid(&self.raw)
    }
}

/// A resolved folder listing.
#[derive(Debug, Default)]
pub struct Listing {
    /// Subfolders.
    pub folders: Vec<ResolvedFolder>,
    /// Files.
    pub files: Vec<ResolvedEntry>,
    /// One `PartialDecrypt` per entry left undecrypted.
    pub diagnostics: Vec<Error>,
}

fn partial(raw: &Value, err: &Error) -> Error {
    Error::PartialDecrypt {
        uuid: raw_uuid(raw).unwrap_or(UNKNOWN_UUID).to_string(),
        message: err.to_string(),
    }
}

/// Decrypts listing entries with the session's master key.
pub struct DirectoryMetadataResolver<'a> {
    vault: &'a MasterKeyVault,
}

impl<'a> DirectoryMetadataResolver<'a> {
    /// Create a resolver over `vault`.
    pub fn new(vault: &'a MasterKeyVault) -> Self {
        Self { vault }
    }

    async fn decrypt_entry(&self, raw: &Value) -> Result<FileMetadata> {
        let entry = RemoteEntry::from_raw(raw)?;
        let wrapped_key = entry
            .key
            .as_deref()
            .ok_or_else(|| Error::missing_field(endpoints::DIR_CONTENT, "key"))?;
        let wrapped_metadata = entry
            .metadata
            .as_deref()
            .ok_or_else(|| Error::missing_field(endpoints::DIR_CONTENT, "metadata"))?;

        let file_key = self.vault.unwrap_file_key(wrapped_key).await?;
        FileMetadata::decrypt(&file_key, wrapped_metadata)
    }

    async fn decrypt_folder(&self, raw: &Value) -> Result<String> {
        let folder = RemoteFolder::from_raw(raw)?;
        let wrapped = folder
            .name
            .as_deref()
            .ok_or_else(|| Error::missing_field(endpoints::DIR_CONTENT, "name"))?;
        self.vault.unwrap_folder_name(wrapped).await
    }

    /// Decrypt file entries. Never fails; malformed or undecryptable
    /// entries come back raw with a diagnostic.
    pub async fn resolve_entries(&self, entries: Vec<Value>) -> (Vec<ResolvedEntry>, Vec<Error>) {
        let attempts = join_all(entries.iter().map(|raw| self.decrypt_entry(raw))).await;

        let mut diagnostics = Vec::new();
        let resolved = entries
            .into_iter()
            .zip(attempts)
            .map(|(raw, attempt)| {
                let metadata = match attempt {
                    Ok(metadata) => Some(metadata),
                    Err(e) => {
                        let diagnostic = partial(&raw, &e);
                        warn!(error = %diagnostic, "Listing entry left undecrypted");
                        diagnostics.push(diagnostic);
                        None
                    }
                };
                ResolvedEntry { raw, metadata }
            })
            .collect();

        (resolved, diagnostics)
    }

    /// Decrypt folder names, same policy as [`Self::resolve_entries`].
    pub async fn resolve_folders(&self, folders: Vec<Value>) -> (Vec<ResolvedFolder>, Vec<Error>) {
        let attempts = join_all(folders.iter().map(|raw| self.decrypt_folder(raw))).await;

        let mut diagnostics = Vec::new();
        let resolved = folders
            .into_iter()
            .zip(attempts)
            .map(|(raw, attempt)| {
                let name = match attempt {
                    Ok(name) => Some(name),
                    Err(e) => {
                        let diagnostic = partial(&raw, &e);
                        warn!(error = %diagnostic, "Folder name left undecrypted");
                        diagnostics.push(diagnostic);
                        None
                    }
                };
                ResolvedFolder { raw, name }
            })
            .collect();

        (resolved, diagnostics)
    }

    /// Resolve a whole folder listing.
    pub async fn resolve(&self, content: DirContent) -> Listing {
        let (folders, mut diagnostics) = self.resolve_folders(content.folders).await;
        let (files, file_diagnostics) = self.resolve_entries(content.files).await;
        diagnostics.extend(file_diagnostics);

        Listing {
            folders,
            files,
            diagnostics,
        }
    }
}
