//! Append-only JSONL writer and positional line reads.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::StoreError;

/// Appends one JSON document per line to a file it owns for the duration
/// of a step.
pub struct RecordWriter {
    path: PathBuf,
    file: File,
    written: usize,
}

impl RecordWriter {
    /// Opens `path` for appending, creating it and its parent directory if
    /// needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Open {
                    path: path.clone(),
                    source,
                })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| StoreError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            file,
            written: 0,
        })
    }

    /// Serializes `item` as one line and flushes it before returning.
    pub async fn append<T: Serialize>(&mut self, item: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(item)?;
        line.push(b'\n');

        self.file
            .write_all(&line)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.file.flush().await.map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;

        self.written += 1;
        Ok(())
    }

    /// Lines appended through this writer.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Counts non-empty lines in `path`.
pub async fn count_lines(path: &Path) -> Result<usize, StoreError> {
    let mut lines = open_lines(path).await?;
    let mut count = 0;
    while let Some(line) = next_line(&mut lines, path).await? {
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

/// Returns the non-empty line at `index`, wrapping around when the file has
/// fewer lines than `index + 1`.
///
/// # Errors
///
/// [`StoreError::Empty`] when the file has no non-empty line.
pub async fn read_line(path: &Path, index: usize) -> Result<String, StoreError> {
    let total = count_lines(path).await?;
    if total == 0 {
        return Err(StoreError::Empty(path.to_path_buf()));
    }
    let target = index % total;

    let mut lines = open_lines(path).await?;
    let mut seen = 0;
    while let Some(line) = next_line(&mut lines, path).await? {
        if line.trim().is_empty() {
            continue;
        }
        if seen == target {
            return Ok(line);
        }
        seen += 1;
    }
    // The file shrank between the two passes.
    Err(StoreError::Empty(path.to_path_buf()))
}

async fn open_lines(path: &Path) -> Result<tokio::io::Lines<BufReader<File>>, StoreError> {
    let file = File::open(path).await.map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file).lines())
}

async fn next_line(
    lines: &mut tokio::io::Lines<BufReader<File>>,
    path: &Path,
) -> Result<Option<String>, StoreError> {
    lines.next_line().await.map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })
}
