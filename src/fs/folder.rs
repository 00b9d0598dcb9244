//! Output folder versioning.
//!
//! A run never writes into a folder left by an earlier run: an existing
//! `dataset/` is moved aside to `dataset_v<N>/` (one past the highest
//! existing version) and a fresh folder is created in its place.

use std::path::{Path, PathBuf};

use regex::Regex;

use super::FsError;

/// Ensures `path` exists and is empty, moving any previous content to the
/// next free `<name>_v<N>` sibling.
///
/// # Returns
///
/// The path the previous folder was moved to, if there was one.
pub async fn create_versioned_folder(path: &Path) -> Result<Option<PathBuf>, FsError> {
    if !tokio::fs::try_exists(path)
        .await
        .map_err(|e| FsError::io("stat", path, e))?
    {
        create_folder(path).await?;
        return Ok(None);
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let base = sanitize_folder_name(
        &path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
    );

    let version = next_folder_version(&parent, &base).await?;
    let versioned = parent.join(format!("{}_v{}", base, version));

    tokio::fs::rename(path, &versioned)
        .await
        .map_err(|e| FsError::io("rename", path, e))?;
    tracing::info!(
        from = %path.display(),
        to = %versioned.display(),
        "Moved previous output folder"
    );

    create_folder(path).await?;
    Ok(Some(versioned))
}

async fn create_folder(path: &Path) -> Result<(), FsError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| FsError::io("create", path, e))
}

async fn next_folder_version(dir: &Path, base: &str) -> Result<u32, FsError> {
    let pattern = Regex::new(&format!(r"^{}_v(\d+)$", regex::escape(base))).map_err(|e| {
        FsError::InvalidPattern {
            pattern: base.to_string(),
            message: e.to_string(),
        }
    })?;

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| FsError::io("read", dir, e))?;

    let mut max_version = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FsError::io("read", dir, e))?
    {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(version) = pattern
            .captures(&name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        {
            max_version = max_version.max(version);
        }
    }
    Ok(max_version + 1)
}

fn sanitize_folder_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | '.' | ' ')
                || c.is_control()
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    let mut collapsed = String::with_capacity(replaced.len());
    for c in replaced.chars() {
        if c == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(c);
    }

    let trimmed = collapsed.trim_matches('_');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}
