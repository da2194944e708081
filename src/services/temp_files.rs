use std::path::{Path, PathBuf};

use crate::models::job::ImageInput;

/// An uploaded image written to disk for the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedImage {
    pub path: PathBuf,
    pub content_type: String,
}

/// Staged images for one job. Files are removed when the set is dropped,
/// on every exit path including early returns and panics.
#[derive(Debug)]
pub struct TempImageSet {
    images: Vec<StagedImage>,
}

impl TempImageSet {
    pub async fn stage(dir: &Path, prefix: &str, inputs: &[ImageInput]) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let mut set = Self {
            images: Vec::with_capacity(inputs.len()),
        };
        for (idx, input) in inputs.iter().enumerate() {
            let path = dir.join(format!(
                "{prefix}_{}.{}",
                idx + 1,
                extension_for(&input.content_type)
            ));
            // Registered before writing so a partial file is removed on drop too.
            set.images.push(StagedImage {
                path: path.clone(),
                content_type: input.content_type.clone(),
            });
            tokio::fs::write(&path, &input.bytes).await?;
            tracing::debug!(path = %path.display(), "Staged image");
        }
        Ok(set)
    }

    pub fn images(&self) -> &[StagedImage] {
        &self.images
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.images.iter().map(|i| i.path.clone()).collect()
    }
}

impl Drop for TempImageSet {
    fn drop(&mut self) {
        for image in &self.images {
            match std::fs::remove_file(&image.path) {
                Ok(()) => tracing::debug!(path = %image.path.display(), "Cleaned up staged image"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %image.path.display(),
                    error = %e,
                    "Failed to remove staged image"
                ),
            }
        }
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_files_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = vec![
            ImageInput::new("image/png", b"png-bytes".to_vec()),
            ImageInput::new("image/jpeg", b"jpeg-bytes".to_vec()),
        ];

        let set = TempImageSet::stage(dir.path(), "req-1", &inputs).await.unwrap();
        let paths = set.paths();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].to_string_lossy().ends_with("req-1_1.png"));
        assert!(paths[1].to_string_lossy().ends_with("req-1_2.jpg"));
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"jpeg-bytes");

        drop(set);
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        // The second target already exists as a directory, so writing it fails.
        std::fs::create_dir(dir.path().join("req-2_2.png")).unwrap();
        let inputs = vec![
            ImageInput::new("image/png", b"first".to_vec()),
            ImageInput::new("image/png", b"second".to_vec()),
            ImageInput::new("image/png", b"third".to_vec()),
        ];

        assert!(TempImageSet::stage(dir.path(), "req-2", &inputs).await.is_err());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["req-2_2.png".to_string()]);
    }

    #[tokio::test]
    async fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let set = TempImageSet::stage(&nested, "x", &[ImageInput::new("image/webp", vec![1])])
            .await
            .unwrap();
        assert!(set.images()[0].path.exists());
    }
}
