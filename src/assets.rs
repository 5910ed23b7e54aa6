//! Asset Upload Pipeline
//!
//! Uploads listing photos to object storage and keeps the per-form list of
//! completed uploads.

use std::sync::{Arc, Mutex, PoisonError};

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, ObjectStorage};

/// Media types accepted for listing photos
pub const ACCEPTED_MEDIA_TYPES: &[&str] = &["image/jpeg", "image/png"];

/// Lifecycle of a single photo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetState {
    Selected,
    Uploading,
    Uploaded,
    Attached,
    Failed,
}

/// A file picked by the user, not yet uploaded
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedFile {
    pub file_name: String,
    /// Declared media type, e.g. `image/png`
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl SelectedFile {
    fn normalized_media_type(&self) -> String {
        self.media_type.trim().to_ascii_lowercase()
    }

    pub fn is_supported(&self) -> bool {
        ACCEPTED_MEDIA_TYPES.contains(&self.normalized_media_type().as_str())
    }
}

/// An uploaded photo
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAsset {
    pub asset_id: String,
    pub owner_uid: String,
    pub remote_url: String,
    /// `data:` URL of the original bytes; process-local, never persisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_preview_url: Option<String>,
    pub state: AssetState,
}

impl ImageAsset {
    /// Object-storage path of this asset
    pub fn storage_path(&self) -> String {
        storage_path(&self.owner_uid, &self.asset_id)
    }
}

/// Object-storage path for an owner's asset
pub fn storage_path(owner_uid: &str, asset_id: &str) -> String {
    format!("images/{owner_uid}/{asset_id}")
}

/// Uploads and deletes photos in object storage
#[derive(Clone)]
pub struct UploadPipeline {
    storage: Arc<dyn ObjectStorage>,
}

impl UploadPipeline {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    /// Upload `file` for `owner_uid` and resolve its durable URL
    pub async fn upload(
        &self,
        file: SelectedFile,
        owner_uid: &str,
    ) -> Result<ImageAsset, AssetError> {
        if !file.is_supported() {
            info!("Rejected {} ({})", file.file_name, file.media_type);
            return Err(AssetError::UnsupportedType(file.media_type));
        }

        let media_type = file.normalized_media_type();
        let asset_id = Uuid::new_v4().to_string();
        let path = storage_path(owner_uid, &asset_id);
        let preview = preview_url(&media_type, &file.bytes);

        debug!("Asset {} {:?}: {}", asset_id, AssetState::Uploading, file.file_name);

        let result = match self.storage.put(&path, file.bytes, &media_type).await {
            Ok(handle) => self.storage.resolve_url(&handle).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(remote_url) => {
                info!("Asset {} uploaded to {}", asset_id, path);
                Ok(ImageAsset {
                    asset_id,
                    owner_uid: owner_uid.to_string(),
                    remote_url,
                    local_preview_url: Some(preview),
                    state: AssetState::Uploaded,
                })
            }
            Err(e) => {
                error!("Asset {} {:?}: {}", asset_id, AssetState::Failed, e);
                Err(AssetError::Upload(e))
            }
        }
    }

    /// Remove the remote object behind `asset`
    pub async fn delete_asset(&self, asset: &ImageAsset) -> Result<(), AssetError> {
        let path = asset.storage_path();
        self.storage.delete(&path).await.map_err(|e| {
            warn!("Failed to delete asset {}: {}", path, e);
            AssetError::Delete(e)
        })?;
        info!("Deleted asset {}", path);
        Ok(())
    }
}

fn preview_url(media_type: &str, bytes: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{media_type};base64,{encoded}")
}

/// Completed uploads of one form, in completion order.
///
/// Cloning shares the same list.
#[derive(Debug, Clone, Default)]
pub struct AssetTray {
    assets: Arc<Mutex<Vec<ImageAsset>>>,
}

impl AssetTray {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ImageAsset>> {
        self.assets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a completed upload
    pub fn push(&self, asset: ImageAsset) {
        self.lock().push(asset);
    }

    pub fn snapshot(&self) -> Vec<ImageAsset> {
        self.lock().clone()
    }

    pub fn find(&self, asset_id: &str) -> Option<ImageAsset> {
        self.lock().iter().find(|a| a.asset_id == asset_id).cloned()
    }

    pub fn remove(&self, asset_id: &str) -> Option<ImageAsset> {
        let mut assets = self.lock();
        let index = assets.iter().position(|a| a.asset_id == asset_id)?;
        Some(assets.remove(index))
    }

    /// Remove every asset whose id is in `asset_ids`, keeping the others in order
    pub fn remove_all(&self, asset_ids: &[String]) {
        self.lock().retain(|a| !asset_ids.contains(&a.asset_id));
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Asset pipeline errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AssetError {
    #[error("Unsupported image type: {0:?} (send a JPEG or PNG)")]
    UnsupportedType(String),

    #[error("Failed to upload image: {0}")]
    Upload(BackendError),

    #[error("Failed to delete image: {0}")]
    Delete(BackendError),

    #[error("Image not found: {0}")]
    NotFound(String),
}
