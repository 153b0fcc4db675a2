//! Atomic JSON persistence for cache artifacts.
//!
//! Every file the daemon owns (snapshots, history, intro cache) is written to a
//! sibling temp file, synced, and renamed over the target, so a concurrent
//! reader sees either the old document or the new one, never a torn write.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while persisting a document.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Failed to serialize the value.
    #[error("Failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Failed to create the parent directory.
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write or sync the temp file.
    #[error("Failed to write temp file {path}: {source}")]
    WriteTemp {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to move the temp file over the target.
    #[error("Failed to rename into {path}: {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors that can occur while loading a document.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Generates the temp path used while writing `target`.
///
/// The temp file lives in the same directory so the final rename never
/// crosses filesystems: `<dir>/.<name>.tmp.<uuid>`.
pub fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cache".to_string());
    let temp_name = format!(".{}.tmp.{}", name, uuid::Uuid::new_v4().simple());
    match target.parent() {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    }
}

/// Atomically replaces `target` with `bytes`.
///
/// # Arguments
/// * `target` - Final path of the document
/// * `bytes` - Full document contents
///
/// # Returns
/// * `Ok(())` once the rename has completed
/// * `Err(PersistError)` if any step failed; the previous document is untouched
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    // Step 1: Make sure the directory exists
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| PersistError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    // Step 2: Write and sync the temp file
    let temp = temp_path(target);
    let written = File::create(&temp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(source) = written {
        let _ = fs::remove_file(&temp);
        return Err(PersistError::WriteTemp { path: temp, source });
    }

    // Step 3: Rename over the target
    if let Err(source) = fs::rename(&temp, target) {
        let _ = fs::remove_file(&temp);
        return Err(PersistError::Rename {
            path: target.to_path_buf(),
            source,
        });
    }

    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically.
pub fn write_json_atomic<T: Serialize>(target: &Path, value: &T) -> Result<(), PersistError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| PersistError::Serialize {
        path: target.to_path_buf(),
        source,
    })?;
    write_atomic(target, &bytes)
}

/// Loads a JSON document.
///
/// # Returns
/// * `Ok(None)` if the file does not exist
/// * `Ok(Some(value))` on success
/// * `Err(LoadError)` if the file is unreadable or not valid JSON for `T`
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, LoadError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LoadError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
}
