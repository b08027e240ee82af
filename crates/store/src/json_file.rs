//! One JSON file per conversation under a directory.
//!
//! Writes go to a temp file that is then renamed over the target, so a crash
//! mid-write leaves the previous version intact.

use async_trait::async_trait;
use chrono::Utc;
use shared::{Conversation, ConversationId, ConversationSummary, Message};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{sort_recent_first, ConversationStore, StoreError};

/// Platform data directory, e.g. `~/.local/share/sidekick`
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "Sidekick", "Sidekick")
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./sidekick-data"))
}

pub struct JsonFileStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles so two updates cannot interleave
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `dir`
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "conversation store opened");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// `conversations/` under the platform data directory
    pub fn default_dir() -> PathBuf {
        default_data_dir().join("conversations")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ids become file names, so anything other than `[A-Za-z0-9_-]` cannot exist
    fn path_for(&self, id: &ConversationId) -> Option<PathBuf> {
        let raw = id.as_str();
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.dir.join(format!("{}.json", raw)))
    }

    async fn read(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        let Some(path) = self.path_for(id) else {
            return Ok(None);
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let path = self
            .path_for(&conversation.id)
            .ok_or_else(|| StoreError::NotFound(conversation.id.clone()))?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(conversation)?;
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn modify<F>(&self, id: &ConversationId, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Conversation) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut conversation = self
            .read(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        apply(&mut conversation);
        conversation.updated_at = Utc::now();
        self.write(&conversation).await
    }
}

#[async_trait]
impl ConversationStore for JsonFileStore {
    async fn create(&self, title: &str) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new(title);
        let _guard = self.write_lock.lock().await;
        self.write(&conversation).await?;
        Ok(conversation)
    }

    async fn get(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        self.read(id).await
    }

    async fn update_messages(&self, id: &ConversationId, messages: &[Message]) -> Result<(), StoreError> {
        let messages = messages.to_vec();
        self.modify(id, move |c| c.messages = messages).await
    }

    async fn update_title(&self, id: &ConversationId, title: &str) -> Result<(), StoreError> {
        let title = title.to_string();
        self.modify(id, move |c| c.title = title).await
    }

    async fn delete(&self, id: &ConversationId) -> Result<(), StoreError> {
        let Some(path) = self.path_for(id) else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let mut summaries = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable conversation: {}", e);
                    continue;
                }
            };
            match serde_json::from_str::<Conversation>(&content) {
                Ok(conversation) => summaries.push(conversation.summary()),
                Err(e) => warn!(path = %path.display(), "skipping malformed conversation: {}", e),
            }
        }
        sort_recent_first(&mut summaries);
        Ok(summaries)
    }
}
