use async_trait::async_trait;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Extensions accepted for listing images and avatars.
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif"];

/// Total multipart payload cap (images + fields) per request.
pub const UPLOAD_SIZE_LIMIT: usize = 2 * 1024 * 1024; // 2 MB

#[derive(Debug, Error)]
pub enum MediaStoreError {
    #[error("not_found")]
    NotFound,
    #[error("other: {0}")]
    Other(String),
}

/// Where a stored file lives. Listing images and avatars have separate
/// namespaces and serving routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    ListingImage,
    Avatar,
}

impl MediaKind {
    fn subdir(&self) -> &'static str {
        match self {
            MediaKind::ListingImage => "uploads",
            MediaKind::Avatar => "avatars",
        }
    }
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn save(&self, kind: MediaKind, name: &str, bytes: &[u8]) -> Result<(), MediaStoreError>;
    async fn load(&self, kind: MediaKind, name: &str) -> Result<Vec<u8>, MediaStoreError>;
    async fn delete(&self, kind: MediaKind, name: &str) -> Result<(), MediaStoreError>;
}

// ---------------- Filesystem implementation ----------------

pub struct FsMediaStore {
    root: PathBuf,
}

impl FsMediaStore {
    pub fn new() -> anyhow::Result<Self> {
        let root = std::env::var("LOPPIS_MEDIA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/media"));
        for kind in [MediaKind::ListingImage, MediaKind::Avatar] {
            std::fs::create_dir_all(root.join(kind.subdir()))?;
        }
        info!("Media store rooted at '{}'", root.display());
        Ok(Self { root })
    }

    fn path_for(&self, kind: MediaKind, name: &str) -> PathBuf {
        self.root.join(kind.subdir()).join(name)
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn save(&self, kind: MediaKind, name: &str, bytes: &[u8]) -> Result<(), MediaStoreError> {
        // Same name overwrites: re-uploading under an identical secured
        // filename replaces the previous file.
        std::fs::write(self.path_for(kind, name), bytes)
            .map_err(|e| MediaStoreError::Other(e.to_string()))
    }

    async fn load(&self, kind: MediaKind, name: &str) -> Result<Vec<u8>, MediaStoreError> {
        match std::fs::read(self.path_for(kind, name)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(MediaStoreError::NotFound),
            Err(e) => Err(MediaStoreError::Other(e.to_string())),
        }
    }

    async fn delete(&self, kind: MediaKind, name: &str) -> Result<(), MediaStoreError> {
        // Best-effort: a missing file counts as deleted.
        let _ = std::fs::remove_file(self.path_for(kind, name));
        Ok(())
    }
}

/// Factory used in main; panic early if the data dir is unusable.
pub fn build_media_store() -> Arc<dyn MediaStore> {
    match FsMediaStore::new() {
        Ok(store) => Arc::new(store),
        Err(e) => panic!("Failed to initialize media store: {e}"),
    }
}

// ---------------- Filename helpers ----------------

/// True when the filename carries an extension from the allowlist.
pub fn allowed_file(filename: &str) -> bool {
    match filename.rsplit_once('.') {
        Some((_, ext)) => ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => false,
    }
}

/// Reduce a client-supplied filename to a safe single path segment: path
/// components are stripped, anything outside `[A-Za-z0-9._-]` becomes `_`,
/// and leading dots are dropped so the result can never be hidden or
/// relative. Empty input degrades to `"file"`.
pub fn secure_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.').to_string();
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed
    }
}

/// A name is servable only if securing it is a no-op; anything else smells
/// like traversal.
pub fn is_servable_name(name: &str) -> bool {
    !name.is_empty() && secure_filename(name) == name
}
