//! Policy-gated filesystem operations.
//!
//! Thin async wrappers over `tokio::fs` that the dispatcher exposes as
//! tools. Callers pass paths that have ALREADY been through the path guard;
//! these functions only do the I/O and shape the reply.

use serde::Serialize;
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, ServerError};

/// How a `write_file` call treats existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Rewrite,
    Append,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub total_lines: usize,
    /// True when offset/length trimmed the returned window.
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirEntrySummary {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub is_dir: bool,
    pub is_file: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub readonly: bool,
}

/// Read a UTF-8 file, optionally windowed by line offset/length.
pub async fn read_file(path: &Path, offset: Option<usize>, length: Option<usize>) -> Result<FileContent> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| io_error(path, err))?;

    let lines: Vec<&str> = raw.lines().collect();
    let total_lines = lines.len();
    let start = offset.unwrap_or(0).min(total_lines);
    let end = length.map_or(total_lines, |len| (start + len).min(total_lines));

    let truncated = start > 0 || end < total_lines;
    let content = if truncated {
        lines[start..end].join("\n")
    } else {
        raw
    };

    Ok(FileContent {
        path: path.display().to_string(),
        content,
        total_lines,
        truncated,
    })
}

/// Write or append. Parent directories are not created implicitly -- a
/// missing parent is a `PathNotFound` the caller can act on.
pub async fn write_file(path: &Path, content: &str, mode: WriteMode) -> Result<u64> {
    match mode {
        WriteMode::Rewrite => {
            tokio::fs::write(path, content)
                .await
                .map_err(|err| io_error(path, err))?;
        }
        WriteMode::Append => {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|err| io_error(path, err))?;
            file.write_all(content.as_bytes())
                .await
                .map_err(|err| io_error(path, err))?;
            file.flush().await.map_err(|err| io_error(path, err))?;
        }
    }
    Ok(content.len() as u64)
}

/// Rename; both endpoints must have passed the guard.
pub async fn move_file(source: &Path, destination: &Path) -> Result<()> {
    tokio::fs::rename(source, destination)
        .await
        .map_err(|err| io_error(source, err))
}

pub async fn list_directory(path: &Path) -> Result<Vec<DirEntrySummary>> {
    let mut reader = tokio::fs::read_dir(path)
        .await
        .map_err(|err| io_error(path, err))?;

    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await.map_err(|err| io_error(path, err))? {
        let metadata = entry.metadata().await.map_err(|err| io_error(path, err))?;
        entries.push(DirEntrySummary {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

pub async fn get_file_info(path: &Path) -> Result<FileInfo> {
    let symlink_meta = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|err| io_error(path, err))?;
    let metadata = tokio::fs::metadata(path).await.unwrap_or(symlink_meta.clone());

    Ok(FileInfo {
        path: path.display().to_string(),
        is_dir: metadata.is_dir(),
        is_file: metadata.is_file(),
        is_symlink: symlink_meta.file_type().is_symlink(),
        size: metadata.len(),
        readonly: metadata.permissions().readonly(),
    })
}

fn io_error(path: &Path, err: std::io::Error) -> ServerError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ServerError::PathNotFound(path.to_path_buf())
    } else {
        ServerError::Internal(format!("{}: {err}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");

        write_file(&path, "line one\nline two\nline three", WriteMode::Rewrite)
            .await
            .unwrap();
        let content = read_file(&path, None, None).await.unwrap();
        assert_eq!(content.total_lines, 3);
        assert!(!content.truncated);

        let window = read_file(&path, Some(1), Some(1)).await.unwrap();
        assert_eq!(window.content, "line two");
        assert!(window.truncated);
    }

    #[tokio::test]
    async fn append_extends_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        write_file(&path, "first\n", WriteMode::Rewrite).await.unwrap();
        write_file(&path, "second\n", WriteMode::Append).await.unwrap();

        let content = read_file(&path, None, None).await.unwrap();
        assert_eq!(content.content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn missing_file_is_path_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_file(&dir.path().join("ghost.txt"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::PathNotFound(_)));
    }

    #[tokio::test]
    async fn list_directory_sorts_entries() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("b.txt"), "b", WriteMode::Rewrite).await.unwrap();
        write_file(&dir.path().join("a.txt"), "a", WriteMode::Rewrite).await.unwrap();

        let entries = list_directory(dir.path()).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn move_file_renames() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("old.txt");
        let to = dir.path().join("new.txt");
        write_file(&from, "content", WriteMode::Rewrite).await.unwrap();

        move_file(&from, &to).await.unwrap();
        assert!(!from.exists());
        let info = get_file_info(&to).await.unwrap();
        assert!(info.is_file);
        assert_eq!(info.size, 7);
    }
}
