//! Image storage for screenshots, baselines and diffs
//!
//! Images are kept as PNG files under a flat `images/` directory and are
//! addressed by generated names rather than by digest: a baseline and the
//! screenshot it was approved from must be deletable independently.
//! Writes go through `tmp/` and are renamed into place, so a reader never
//! observes a partially written image.

use crate::{Error, Result};
use async_trait::async_trait;
use image::RgbaImage;
use std::collections::HashSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What an image is used for; becomes the file name prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Screenshot,
    Baseline,
    Diff,
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Screenshot => write!(f, "screenshot"),
            Self::Baseline => write!(f, "baseline"),
            Self::Diff => write!(f, "diff"),
        }
    }
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Persist PNG bytes and return the generated name
    async fn save_image(&self, kind: ImageKind, data: &[u8]) -> Result<String>;

    /// Raw PNG bytes, `None` if the name is unknown
    async fn read_image(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Removing a missing or empty name is not an error
    async fn delete_image(&self, name: &str) -> Result<bool>;

    /// Decoded image, `None` if the name is unknown
    async fn get_image(&self, name: &str) -> Result<Option<RgbaImage>> {
        match self.read_image(name).await? {
            Some(data) => Ok(Some(decode_png(&data)?)),
            None => Ok(None),
        }
    }

    /// Encode and persist an in-memory image
    async fn save_rgba(&self, kind: ImageKind, image: &RgbaImage) -> Result<String> {
        let data = encode_png(image)?;
        self.save_image(kind, &data).await
    }
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, image::ImageFormat::Png)?;
    Ok(buf.into_inner())
}

pub fn decode_png(data: &[u8]) -> Result<RgbaImage> {
    let decoded = image::load_from_memory_with_format(data, image::ImageFormat::Png)?;
    Ok(decoded.to_rgba8())
}

/// File-system backed image store
#[derive(Debug, Clone)]
pub struct FsImageStore {
    root: PathBuf,
}

impl FsImageStore {
    /// Create the store at the given root directory
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("images")).await?;
        fs::create_dir_all(root.join("tmp")).await?;

        info!("Initialized image store at {:?}", root);

        Ok(Self { root })
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Resolve a name to its path, rejecting anything that is not a bare file name
    fn image_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.starts_with('.')
        {
            return Err(Error::Storage(format!("invalid image name: {:?}", name)));
        }
        Ok(self.images_dir().join(name))
    }

    /// Delete unreferenced images older than `min_age`.
    ///
    /// The age guard keeps images that were written but whose run row is not
    /// committed yet.
    pub async fn gc(&self, referenced: &HashSet<String>, min_age: Duration) -> Result<GcStats> {
        let mut stats = GcStats::default();
        let images_dir = self.images_dir();

        if !images_dir.exists() {
            return Ok(stats);
        }

        let now = SystemTime::now();

        for entry in walkdir::WalkDir::new(&images_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("Failed to stat image {}: {}", name, e);
                    continue;
                }
            };

            stats.total_images += 1;
            stats.total_bytes += metadata.len();

            if referenced.contains(name) {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < min_age {
                stats.skipped_young += 1;
                continue;
            }

            if let Err(e) = fs::remove_file(entry.path()).await {
                warn!("Failed to delete orphaned image {}: {}", name, e);
            } else {
                stats.deleted_images += 1;
                stats.deleted_bytes += metadata.len();
            }
        }

        info!(
            "Image GC complete: deleted {}/{} images ({} bytes freed)",
            stats.deleted_images, stats.total_images, stats.deleted_bytes
        );

        Ok(stats)
    }
}

#[async_trait]
impl ImageStore for FsImageStore {
    async fn save_image(&self, kind: ImageKind, data: &[u8]) -> Result<String> {
        let name = format!("{}-{}.png", kind, Uuid::new_v4());
        let path = self.image_path(&name)?;

        // Write atomically via temp file
        let tmp_path = self.root.join("tmp").join(format!("{}.tmp", name));
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &path).await?;

        debug!("Stored image {} ({} bytes)", name, data.len());
        Ok(name)
    }

    async fn read_image(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if name.is_empty() {
            return Ok(None);
        }
        let path = self.image_path(name)?;

        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_image(&self, name: &str) -> Result<bool> {
        if name.is_empty() {
            return Ok(false);
        }
        let path = self.image_path(name)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted image {}", name);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Garbage collection statistics
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub total_images: usize,
    pub total_bytes: u64,
    pub deleted_images: usize,
    pub deleted_bytes: u64,
    pub skipped_young: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use tempfile::TempDir;

    fn checkerboard() -> RgbaImage {
        RgbaImage::from_fn(4, 4, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([0, 0, 0, 255])
            }
        })
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let tmp = TempDir::new().unwrap();
        let store = FsImageStore::new(tmp.path()).await.unwrap();

        let name = store.save_rgba(ImageKind::Screenshot, &checkerboard()).await.unwrap();
        assert!(name.starts_with("screenshot-"));
        assert!(name.ends_with(".png"));

        let loaded = store.get_image(&name).await.unwrap().unwrap();
        assert_eq!(loaded, checkerboard());
    }

    #[tokio::test]
    async fn test_missing_image_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = FsImageStore::new(tmp.path()).await.unwrap();

        assert!(store.get_image("baseline-missing.png").await.unwrap().is_none());
        assert!(store.get_image("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = FsImageStore::new(tmp.path()).await.unwrap();

        let name = store.save_rgba(ImageKind::Diff, &checkerboard()).await.unwrap();
        assert!(store.delete_image(&name).await.unwrap());
        assert!(!store.delete_image(&name).await.unwrap());
        assert!(!store.delete_image("").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let tmp = TempDir::new().unwrap();
        let store = FsImageStore::new(tmp.path()).await.unwrap();

        assert!(store.read_image("../state.db").await.is_err());
        assert!(store.delete_image("images/x.png").await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_image_fails_to_decode() {
        let tmp = TempDir::new().unwrap();
        let store = FsImageStore::new(tmp.path()).await.unwrap();

        let name = store.save_image(ImageKind::Screenshot, b"not a png").await.unwrap();
        assert!(matches!(store.get_image(&name).await, Err(Error::Image(_))));
    }

    #[tokio::test]
    async fn test_gc_respects_references_and_age() {
        let tmp = TempDir::new().unwrap();
        let store = FsImageStore::new(tmp.path()).await.unwrap();

        let kept = store.save_rgba(ImageKind::Baseline, &checkerboard()).await.unwrap();
        let orphan = store.save_rgba(ImageKind::Screenshot, &checkerboard()).await.unwrap();

        let referenced: HashSet<String> = [kept.clone()].into_iter().collect();

        // Freshly written orphans survive a guarded pass
        let stats = store.gc(&referenced, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(stats.deleted_images, 0);
        assert_eq!(stats.skipped_young, 1);

        let stats = store.gc(&referenced, Duration::ZERO).await.unwrap();
        assert_eq!(stats.deleted_images, 1);
        assert!(store.read_image(&orphan).await.unwrap().is_none());
        assert!(store.read_image(&kept).await.unwrap().is_some());
    }
}
