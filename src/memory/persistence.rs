//! JSON file persistence for per-user memory sets
//!
//! Directory layout:
//! ```text
//! <memory_dir>/
//! ├── 123456789.json
//! ├── alice_2Esmith.json
//! └── ...
//! ```
//!
//! File names keep ASCII letters, digits and `-`; every other byte of the
//! user id is written as `_` plus two hex digits, so distinct ids never share
//! a file. Each file holds a JSON array of `MemoryRecord`. A file that cannot be read
//! or parsed is treated as an empty set and overwritten on the next flush.

use super::record::MemoryRecord;
use crate::error::Result;
use std::path::{Path, PathBuf};

/// File-per-user persistence backend
#[derive(Debug, Clone)]
pub struct MemoryFiles {
    dir: PathBuf,
}

impl MemoryFiles {
    /// Open (and create if needed) a memory directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `user_id`
    pub fn path_for(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(user_id)))
    }

    /// Load a user's records; missing or corrupt files yield an empty set
    pub async fn load(&self, user_id: &str) -> Vec<MemoryRecord> {
        let path = self.path_for(user_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(user_id, path = %path.display(), error = %e, "Failed to read memory file, starting empty");
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<MemoryRecord>>(&data) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(user_id, path = %path.display(), error = %e, "Corrupt memory file, starting empty");
                Vec::new()
            }
        }
    }

    /// Write a user's records atomically (temp file + rename)
    pub async fn write(&self, user_id: &str, records: &[MemoryRecord]) -> Result<()> {
        let path = self.path_for(user_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(records)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Delete a user's file if present
    pub async fn remove(&self, user_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(user_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// User ids with a file on disk
    pub async fn list_users(&self) -> Result<Vec<String>> {
        let mut users = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).and_then(decode_stem) {
                Some(user_id) => users.push(user_id),
                None => tracing::debug!(path = %path.display(), "Skipping unrecognized memory file"),
            }
        }
        users.sort();
        Ok(users)
    }
}

/// Map a user id onto a file name, reversibly
fn file_stem(user_id: &str) -> String {
    let mut stem = String::with_capacity(user_id.len());
    for byte in user_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("_{:02X}", byte));
        }
    }
    stem
}

/// Inverse of `file_stem`; `None` for names it never produces
fn decode_stem(stem: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(stem.len());
    let mut rest = stem.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'_' {
            let hex = std::str::from_utf8(tail.get(..2)?).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            rest = &tail[2..];
        } else if byte.is_ascii_alphanumeric() || byte == b'-' {
            bytes.push(byte);
            rest = tail;
        } else {
            return None;
        }
    }
    String::from_utf8(bytes).ok()
}
