//! Source asset lookup.
//!
//! The coordinator only needs [`AssetStore::load_by_uuid`]. The stock
//! [`DirectoryAssetStore`] indexes a directory tree in which every source
//! image is named `<uuid>.<ext>`:
//!
//! ```text
//! assets/
//! ├── 2024/
//! │   ├── 3f2c9a1e-….jpg
//! │   └── 9b71d0c4-….png
//! └── 7a0e55f2-….webp
//! ```
//!
//! The index is built once when the store is opened. Dimensions are read
//! from the image header on lookup, without decoding pixels.

use crate::types::ImageDescriptor;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Extensions indexed as sources: everything the codec can decode.
const SOURCE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "tif", "tiff"];

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("asset directory {0} does not exist")]
    MissingRoot(PathBuf),
    #[error("walking asset directory: {0}")]
    Walk(#[from] walkdir::Error),
}

/// A resolved source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetHandle {
    pub uuid: String,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

impl AssetHandle {
    pub fn descriptor(&self) -> ImageDescriptor {
        ImageDescriptor {
            width: self.width,
            height: self.height,
            source_identifier: self.path.to_string_lossy().into_owned(),
        }
    }
}

/// Looks up source images by identifier.
pub trait AssetStore: Send + Sync {
    fn load_by_uuid(&self, uuid: &str) -> Option<AssetHandle>;
}

/// Asset store over a directory of `<uuid>.<ext>` files.
#[derive(Debug)]
pub struct DirectoryAssetStore {
    root: PathBuf,
    index: HashMap<String, PathBuf>,
}

impl DirectoryAssetStore {
    pub fn open(root: &Path) -> Result<Self, AssetError> {
        if !root.is_dir() {
            return Err(AssetError::MissingRoot(root.to_path_buf()));
        }

        let mut index: HashMap<String, PathBuf> = HashMap::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some((uuid, ext)) = split_file_name(path) else {
                continue;
            };
            if !SOURCE_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
                continue;
            }
            if let Some(existing) = index.get(uuid) {
                warn!(
                    uuid,
                    kept = %existing.display(),
                    ignored = %path.display(),
                    "duplicate asset identifier"
                );
                continue;
            }
            index.insert(uuid.to_string(), path.to_path_buf());
        }

        debug!(root = %root.display(), assets = index.len(), "indexed asset directory");
        Ok(Self {
            root: root.to_path_buf(),
            index,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Every indexed asset that can be identified, sorted by uuid.
    pub fn list(&self) -> Vec<AssetHandle> {
        let mut uuids: Vec<&String> = self.index.keys().collect();
        uuids.sort();
        uuids
            .into_iter()
            .filter_map(|uuid| self.load_by_uuid(uuid))
            .collect()
    }
}

impl AssetStore for DirectoryAssetStore {
    fn load_by_uuid(&self, uuid: &str) -> Option<AssetHandle> {
        let path = self.index.get(uuid)?;
        match image::image_dimensions(path) {
            Ok((width, height)) => Some(AssetHandle {
                uuid: uuid.to_string(),
                path: path.clone(),
                width,
                height,
            }),
            Err(e) => {
                warn!(uuid, path = %path.display(), error = %e, "unreadable asset");
                None
            }
        }
    }
}

/// `dir/<uuid>.<ext>` → `(uuid, ext)`.
fn split_file_name(path: &Path) -> Option<(&str, &str)> {
    let name = path.file_name()?.to_str()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some((stem, ext))
}
