//! Conversation storage
//!
//! Manages saving and loading of chat transcripts.

use crate::storage::{get_data_dir, StorageError};
use crate::types::{Role, Turn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const UNTITLED: &str = "New Conversation";

/// A chat transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique identifier for the conversation
    pub id: String,
    /// Human-readable title (auto-generated from the first user turn)
    pub title: String,
    /// Turns in the order they were added, system prompt first
    pub turns: Vec<Turn>,
    /// When the conversation was created
    pub created_at: DateTime<Utc>,
    /// When the conversation was last updated
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new conversation, optionally opening with a system prompt
    pub fn new(system_prompt: Option<&str>) -> Self {
        let now = Utc::now();
        let turns = system_prompt
            .filter(|p| !p.trim().is_empty())
            .map(|p| vec![Turn::system(p)])
            .unwrap_or_default();

        Self {
            id: Uuid::new_v4().to_string(),
            title: UNTITLED.to_string(),
            turns,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a turn to the conversation
    pub fn record(&mut self, turn: Turn) {
        // The first user turn names the conversation
        if turn.role() == Role::User && !self.has_user_turn() {
            self.title = generate_title(turn.content());
        }

        self.turns.push(turn);
        self.updated_at = Utc::now();
    }

    /// Number of user and assistant turns
    pub fn exchange_len(&self) -> usize {
        self.turns
            .iter()
            .filter(|t| t.role() != Role::System)
            .count()
    }

    fn has_user_turn(&self) -> bool {
        self.turns.iter().any(|t| t.role() == Role::User)
    }
}

/// Generate a conversation title from a message
///
/// Takes the first 50 characters of the message content
fn generate_title(content: &str) -> String {
    let content = content.trim();
    let title = content.chars().take(50).collect::<String>();
    if content.chars().count() > 50 {
        format!("{}...", title)
    } else {
        title
    }
}

/// Directory of conversation JSON files, one per id
#[derive(Debug, Clone)]
pub struct ConversationStore {
    root: PathBuf,
}

impl ConversationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store under the platform data directory
    pub fn open_default() -> Result<Self, StorageError> {
        let root = get_data_dir()?.join("conversations");
        fs::create_dir_all(&root)?;
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the file path for a conversation
    fn path_for(&self, id: &str) -> Result<PathBuf, StorageError> {
        let id = Uuid::parse_str(id).map_err(|_| StorageError::InvalidId(id.to_string()))?;
        Ok(self.root.join(format!("{}.json", id)))
    }

    /// Save a conversation to disk
    pub fn save(&self, conversation: &Conversation) -> Result<(), StorageError> {
        let path = self.path_for(&conversation.id)?;
        fs::create_dir_all(&self.root)?;
        let json = serde_json::to_string_pretty(conversation)?;
        fs::write(path, json)?;
        tracing::debug!("Saved conversation: {}", conversation.id);
        Ok(())
    }

    /// Load a conversation from disk
    pub fn load(&self, id: &str) -> Result<Conversation, StorageError> {
        let path = self.path_for(id)?;

        if !path.exists() {
            return Err(StorageError::ConversationNotFound(id.to_string()));
        }

        let json = fs::read_to_string(&path)?;
        let conversation: Conversation = serde_json::from_str(&json)?;
        tracing::debug!("Loaded conversation: {}", id);
        Ok(conversation)
    }

    /// List all conversations
    ///
    /// Returns a list of conversations sorted by updated_at (most recent first)
    pub fn list(&self) -> Result<Vec<Conversation>, StorageError> {
        if !self.root.exists() {
            return Ok(vec![]);
        }

        let mut conversations = vec![];

        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();

            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(json) => match serde_json::from_str::<Conversation>(&json) {
                    Ok(conv) => conversations.push(conv),
                    Err(e) => {
                        tracing::warn!("Failed to parse conversation file {:?}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read conversation file {:?}: {}", path, e);
                }
            }
        }

        // Sort by updated_at, most recent first
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        Ok(conversations)
    }

    /// Delete a conversation
    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        let path = self.path_for(id)?;

        if !path.exists() {
            return Err(StorageError::ConversationNotFound(id.to_string()));
        }

        fs::remove_file(path)?;
        tracing::debug!("Deleted conversation: {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_conversation_creation() {
        let conv = Conversation::new(Some("Be brief."));

        assert!(Uuid::parse_str(&conv.id).is_ok());
        assert_eq!(conv.title, UNTITLED);
        assert_eq!(conv.turns, vec![Turn::system("Be brief.")]);
        assert_eq!(conv.exchange_len(), 0);
        assert!(conv.created_at <= Utc::now());

        assert!(Conversation::new(Some("  ")).turns.is_empty());
    }

    #[test]
    fn test_title_generation() {
        let long_message = "a".repeat(100);
        let title = generate_title(&long_message);
        assert_eq!(title.len(), 53); // 50 chars + "..."
        assert!(title.ends_with("..."));

        assert_eq!(generate_title("  Short \n"), "Short");
        // Counted in characters, not bytes
        assert_eq!(generate_title(&"é".repeat(50)), "é".repeat(50));
    }

    #[test]
    fn test_first_user_turn_sets_title() {
        let mut conv = Conversation::new(None);
        conv.record(Turn::user("First question"));
        conv.record(Turn::assistant("An answer"));
        conv.record(Turn::user("Second question"));

        assert_eq!(conv.title, "First question");
        assert_eq!(conv.exchange_len(), 3);
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join("conversations"));

        let mut conv = Conversation::new(Some("sys"));
        conv.record(Turn::user("Hi"));
        conv.record(Turn::assistant("Hello"));
        store.save(&conv).unwrap();

        assert_eq!(store.load(&conv.id).unwrap(), conv);
    }

    #[test]
    fn test_list_orders_by_update_and_skips_junk() {
        let dir = tempdir().unwrap();
        let store = ConversationStore::new(dir.path());

        let mut older = Conversation::new(None);
        older.record(Turn::user("older"));
        let mut newer = Conversation::new(None);
        newer.record(Turn::user("newer"));
        newer.updated_at = older.updated_at + chrono::Duration::seconds(5);

        store.save(&older).unwrap();
        store.save(&newer).unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let titles: Vec<String> = store.list().unwrap().into_iter().map(|c| c.title).collect();
        assert_eq!(titles, vec!["newer", "older"]);
    }

    #[test]
    fn test_delete_and_missing() {
        let dir = tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        let conv = Conversation::new(None);
        store.save(&conv).unwrap();

        store.delete(&conv.id).unwrap();
        assert!(matches!(
            store.load(&conv.id),
            Err(StorageError::ConversationNotFound(_))
        ));
        assert!(matches!(
            store.delete(&conv.id),
            Err(StorageError::ConversationNotFound(_))
        ));
    }

    #[test]
    fn test_rejects_non_uuid_ids() {
        let store = ConversationStore::new("/tmp");
        assert!(matches!(
            store.load("../settings"),
            Err(StorageError::InvalidId(_))
        ));
    }

    #[test]
    fn test_list_missing_root() {
        let dir = tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join("absent"));
        assert!(store.list().unwrap().is_empty());
    }
}
