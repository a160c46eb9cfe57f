//! Image persistence under the project's image directory

use super::multipart::UploadedFile;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

fn fresh_name(extension: &str) -> String {
    format!("{}.{}", uuid::Uuid::new_v4(), extension)
}

/// Write uploaded files as `<uuid>.<ext>` into `dir`, returning absolute paths
pub async fn save_uploads(dir: &Path, files: &[UploadedFile]) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Upload(format!("Failed to create {}: {}", dir.display(), e)))?;
    let dir = tokio::fs::canonicalize(dir).await?;

    let mut paths = Vec::with_capacity(files.len());
    for file in files {
        let path = dir.join(fresh_name(&file.extension));
        tokio::fs::write(&path, &file.data)
            .await
            .map_err(|e| Error::Upload(format!("Failed to write {}: {}", path.display(), e)))?;
        paths.push(path);
    }
    tracing::debug!(count = paths.len(), "Saved uploaded images");
    Ok(paths)
}

/// Copy prompt-attached images into `dir`.
///
/// Missing or unreadable sources are skipped; the copies' paths are returned.
pub async fn persist_images(sources: &[String], dir: &Path) -> Vec<String> {
    if sources.is_empty() {
        return Vec::new();
    }
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        tracing::warn!("Failed to create image directory {}: {}", dir.display(), e);
        return Vec::new();
    }

    let mut persisted = Vec::with_capacity(sources.len());
    for src in sources {
        let src_path = Path::new(src);
        if !tokio::fs::try_exists(src_path).await.unwrap_or(false) {
            tracing::warn!("Image file not found, skipping: {}", src);
            continue;
        }
        let extension = src_path
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .unwrap_or("png");
        let dest = dir.join(fresh_name(extension));
        match tokio::fs::copy(src_path, &dest).await {
            Ok(_) => persisted.push(dest.to_string_lossy().into_owned()),
            Err(e) => tracing::warn!("Failed to persist image {}: {}", src, e),
        }
    }
    persisted
}

/// Remove the image directory and everything in it
pub async fn cleanup_images(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            tracing::info!("Cleaned up session images");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_uploads() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("images");
        let files = vec![
            UploadedFile {
                extension: "png".to_string(),
                data: b"one".to_vec(),
            },
            UploadedFile {
                extension: "jpg".to_string(),
                data: b"two".to_vec(),
            },
        ];

        let paths = save_uploads(&dir, &files).await.unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.is_absolute()));
        assert_eq!(paths[0].extension().unwrap(), "png");
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"two");
        assert_ne!(paths[0].file_name(), paths[1].file_name());
    }

    #[tokio::test]
    async fn test_persist_images_skips_missing() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("shot.jpg");
        std::fs::write(&src, b"img").unwrap();
        let dir = tmp.path().join("persisted");

        let sources = vec![
            src.to_string_lossy().into_owned(),
            tmp.path().join("gone.png").to_string_lossy().into_owned(),
        ];
        let persisted = persist_images(&sources, &dir).await;

        assert_eq!(persisted.len(), 1);
        assert!(persisted[0].ends_with(".jpg"));
        assert!(persisted[0].starts_with(dir.to_string_lossy().as_ref()));
        assert_eq!(std::fs::read(&persisted[0]).unwrap(), b"img");
    }

    #[tokio::test]
    async fn test_persist_no_images_creates_nothing() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("persisted");
        assert!(persist_images(&[], &dir).await.is_empty());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_cleanup_images() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("images");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.png"), b"x").unwrap();

        cleanup_images(&dir).await.unwrap();
        assert!(!dir.exists());
        cleanup_images(&dir).await.unwrap();
    }
}
