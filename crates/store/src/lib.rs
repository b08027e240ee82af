//! Durable conversation storage.
//!
//! The store is plain CRUD. Deciding *when* to read or write belongs to the
//! assistant's synchronizer; every call here is atomic on its own.

pub mod json_file;
pub mod memory;
pub mod search;
pub mod title;

pub use json_file::{default_data_dir, JsonFileStore};
pub use memory::MemoryStore;
pub use search::{search, SearchHit};
pub use title::{derive_title, DEFAULT_TITLE};

use async_trait::async_trait;
use shared::{Conversation, ConversationId, ConversationSummary, Message};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(ConversationId),

    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored conversation is malformed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Keyed collection of conversations
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self, title: &str) -> Result<Conversation, StoreError>;

    async fn get(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError>;

    /// Replace the full message list
    async fn update_messages(&self, id: &ConversationId, messages: &[Message]) -> Result<(), StoreError>;

    async fn update_title(&self, id: &ConversationId, title: &str) -> Result<(), StoreError>;

    /// Deleting an unknown id is not an error
    async fn delete(&self, id: &ConversationId) -> Result<(), StoreError>;

    /// Most recently updated first
    async fn list(&self) -> Result<Vec<ConversationSummary>, StoreError>;
}

pub(crate) fn sort_recent_first(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}
