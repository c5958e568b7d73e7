//! Folder listing, creation, moves and trash.

use tracing::info;

use crate::resolver::{DirectoryMetadataResolver, Listing};
use filenvault_api::{CreateFolderRequest, MoveRequest};
use filenvault_common::{Error, FolderRef, RemoteId, Result};
use filenvault_vault::Session;

/// List `folder` and decrypt what can be decrypted.
///
/// Only the listing call itself can fail; per-entry problems end up in
/// [`Listing::diagnostics`].
pub async fn list_folder(session: &Session, folder: &FolderRef) -> Result<Listing> {
    let content = session
        .authed(|api, key| async move { api.dir_content(&key, folder).await })
        .await?;

    let listing = DirectoryMetadataResolver::new(session.vault())
        .resolve(content)
        .await;
    info!(
        folder = folder.as_wire(),
        files = listing.files.len(),
        folders = listing.folders.len(),
        undecrypted = listing.diagnostics.len(),
        "Listed folder"
    );
    Ok(listing)
}

/// Create a folder named `name` under `parent`.
///
/// # Errors
/// - `InvalidInput` if the name is empty or contains a path separator
pub async fn create_folder(session: &Session, name: &str, parent: &FolderRef) -> Result<RemoteId> {
    if name.trim().is_empty() || name.contains('/') {
        return Err(Error::InvalidInput(format!("Invalid folder name: {:?}", name)));
    }

    let request = CreateFolderRequest {
        uuid: RemoteId::generate(),
        name: session.vault().wrap_folder_name(name).await?,
        parent: parent.as_wire().to_string(),
    };
    let request = &request;
    let id = session
        .authed(|api, key| async move { api.create_folder(&key, request).await })
        .await?;

    info!(uuid = %id, parent = parent.as_wire(), "Folder created");
    Ok(id)
}

/// Move a file into `to`.
pub async fn move_file(session: &Session, uuid: &RemoteId, to: &FolderRef) -> Result<()> {
    let request = MoveRequest {
        uuid: uuid.clone(),
        to: to.as_wire().to_string(),
    };
    let request = &request;
    session
        .authed(|api, key| async move { api.move_file(&key, request).await })
        .await?;

    info!(uuid = %uuid, to = to.as_wire(), "File moved");
    Ok(())
}

/// Move a folder into `to`.
///
/// # Errors
/// - `InvalidInput` if `to` is the folder itself
pub async fn move_folder(session: &Session, uuid: &RemoteId, to: &FolderRef) -> Result<()> {
    if to.as_wire() == uuid.as_str() {
        return Err(Error::InvalidInput(format!("Cannot move folder {} into itself", uuid)));
    }

    let request = MoveRequest {
        uuid: uuid.clone(),
        to: to.as_wire().to_string(),
    };
    let request = &request;
    session
        .authed(|api, key| async move { api.move_folder(&key, request).await })
        .await?;

    info!(uuid = %uuid, to = to.as_wire(), "Folder moved");
    Ok(())
}

/// Move a file to the trash.
pub async fn trash_file(session: &Session, uuid: &RemoteId) -> Result<()> {
    session
        .authed(|api, key| async move { api.trash_file(&key, uuid).await })
        .await?;

    info!(uuid = %uuid, "File trashed");
    Ok(())
}

/// Move a folder and everything below it to the trash.
pub async fn trash_folder(session: &Session, uuid: &RemoteId) -> Result<()> {
    session
        .authed(|api, key| async move { api.trash_folder(&key, uuid).await })
        .await?;

    info!(uuid = %uuid, "Folder trashed");
    Ok(())
}
