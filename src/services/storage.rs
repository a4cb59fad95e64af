use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Bytes kept from the start of an upload to sniff its format.
const SNIFF_BYTES: usize = 64;

/// Local directory of uploaded images, addressed by opaque image id.
#[derive(Debug, Clone)]
pub struct UploadStorage {
    root: PathBuf,
}

/// An upload being written to disk.
pub struct PendingUpload {
    image_id: String,
    path: PathBuf,
    file: tokio::fs::File,
    head: Vec<u8>,
    size: u64,
}

/// A completed upload.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub image_id: String,
    pub path: PathBuf,
    pub size: u64,
}

impl UploadStorage {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(StorageError::Io)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the image identified by `image_ref`. Refs must be bare file
    /// names so they cannot escape the upload directory.
    pub fn resolve(&self, image_ref: &str) -> Result<PathBuf, StorageError> {
        if !is_plain_file_name(image_ref) {
            return Err(StorageError::InvalidRef(image_ref.to_string()));
        }
        Ok(self.root.join(image_ref))
    }

    /// Start a new upload. The image id is a fresh UUID carrying the original
    /// file's extension, e.g. `3f2c...e1.tif`.
    pub async fn begin(&self, original_name: Option<&str>) -> Result<PendingUpload, StorageError> {
        let image_id = match original_name.and_then(extension_of) {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };
        let path = self.root.join(&image_id);
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(StorageError::Io)?;

        Ok(PendingUpload {
            image_id,
            path,
            file,
            head: Vec::with_capacity(SNIFF_BYTES),
            size: 0,
        })
    }
}

impl PendingUpload {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        if self.head.len() < SNIFF_BYTES {
            let take = (SNIFF_BYTES - self.head.len()).min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
        }
        self.file.write_all(chunk).await.map_err(StorageError::Io)?;
        self.size += chunk.len() as u64;
        Ok(())
    }

    /// Flush the upload and check it is a raster format the worker can read.
    /// Anything else is deleted.
    pub async fn finish(mut self) -> Result<StoredImage, StorageError> {
        if self.size == 0 {
            self.discard().await;
            return Err(StorageError::Empty);
        }
        if image::guess_format(&self.head).is_err() {
            self.discard().await;
            return Err(StorageError::UnsupportedFormat);
        }

        self.file.flush().await.map_err(StorageError::Io)?;
        self.file.sync_all().await.map_err(StorageError::Io)?;

        tracing::info!(image_id = %self.image_id, size = self.size, "Stored uploaded image");
        Ok(StoredImage {
            image_id: self.image_id,
            path: self.path,
            size: self.size,
        })
    }

    pub async fn discard(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove discarded upload");
        }
    }
}

/// A single path component that is not `.` or `..`.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn extension_of(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?;
    let valid = !ext.is_empty() && ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Upload storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid image reference: {0:?}")]
    InvalidRef(String),

    #[error("Uploaded file is empty")]
    Empty,

    #[error("Uploaded file is not a supported image format")]
    UnsupportedFormat,
}
