//! Persistent storage
//!
//! This module handles persistence of session settings and chat transcripts.

use std::path::PathBuf;
use thiserror::Error;

pub mod conversations;
pub mod settings;

pub use conversations::{Conversation, ConversationStore};
pub use settings::SessionSettings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Invalid conversation id: {0}")]
    InvalidId(String),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\pocketchat\pocketchat`
/// - macOS: `/Users/{user}/Library/Application Support/dev.pocketchat.pocketchat`
/// - Linux: `/home/{user}/.local/share/pocketchat`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("dev", "pocketchat", "pocketchat")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}
