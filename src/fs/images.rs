//! Image inputs for multimodal steps.
//!
//! A step's `imagePath` is a glob. Matches are sorted so that iteration `i`
//! always picks the same file, wrapping around when there are fewer images
//! than iterations.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use super::FsError;

/// An image selected for one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub path: PathBuf,
    pub base64: String,
}

/// Sorted regular files matching `pattern`.
pub fn list_images(pattern: &Path) -> Result<Vec<PathBuf>, FsError> {
    let pattern_str = pattern.to_string_lossy();
    let matches = glob::glob(&pattern_str).map_err(|e| FsError::InvalidPattern {
        pattern: pattern_str.to_string(),
        message: e.to_string(),
    })?;

    let mut files: Vec<PathBuf> = matches.flatten().filter(|p| p.is_file()).collect();
    files.sort();
    Ok(files)
}

/// Number of files matching `pattern`.
pub fn count_images(pattern: &Path) -> Result<usize, FsError> {
    list_images(pattern).map(|files| files.len())
}

/// Picks image `index` (modulo the match count) and base64-encodes it.
pub async fn image_at(pattern: &Path, index: usize) -> Result<ImageInput, FsError> {
    let files = list_images(pattern)?;
    if files.is_empty() {
        return Err(FsError::NoMatches(pattern.display().to_string()));
    }
    let path = files[index % files.len()].clone();
    tracing::debug!(path = %path.display(), index = index, "Selected image");

    let data = tokio::fs::read(&path)
        .await
        .map_err(|e| FsError::io("read", &path, e))?;
    Ok(ImageInput {
        base64: BASE64.encode(data),
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_images(dir: &Path) {
        std::fs::write(dir.join("b.jpg"), b"second").unwrap();
        std::fs::write(dir.join("a.jpg"), b"first").unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();
        std::fs::create_dir(dir.join("c.jpg")).unwrap();
    }

    #[test]
    fn test_list_images_sorted_files_only() {
        let dir = TempDir::new().unwrap();
        setup_images(dir.path());

        let files = list_images(&dir.path().join("*.jpg")).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.jpg"]);
        assert_eq!(count_images(&dir.path().join("*.jpg")).unwrap(), 2);
        assert_eq!(count_images(&dir.path().join("*.png")).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_image_at_wraps_and_encodes() {
        let dir = TempDir::new().unwrap();
        setup_images(dir.path());
        let pattern = dir.path().join("*.jpg");

        let first = image_at(&pattern, 0).await.unwrap();
        assert!(first.path.ends_with("a.jpg"));
        assert_eq!(first.base64, BASE64.encode(b"first"));

        let wrapped = image_at(&pattern, 3).await.unwrap();
        assert!(wrapped.path.ends_with("b.jpg"));
    }

    #[tokio::test]
    async fn test_image_at_no_matches() {
        let dir = TempDir::new().unwrap();
        let result = image_at(&dir.path().join("*.jpg"), 0).await;
        assert!(matches!(result, Err(FsError::NoMatches(_))));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            list_images(Path::new("[unclosed")),
            Err(FsError::InvalidPattern { .. })
        ));
    }
}
