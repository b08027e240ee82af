//! In-process store for ephemeral sessions and tests.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use shared::{Conversation, ConversationId, ConversationSummary, Message};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::{sort_recent_first, ConversationStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    conversations: Mutex<HashMap<ConversationId, Conversation>>,
    message_writes: AtomicUsize,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    read_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `update_messages` calls so far
    pub fn message_writes(&self) -> usize {
        self.message_writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent write fail with `Unavailable`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `get` fail with `Unavailable`
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Delay every `get`, to widen interleavings
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock() = delay;
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes are disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create(&self, title: &str) -> Result<Conversation, StoreError> {
        self.check_writable()?;
        let conversation = Conversation::new(title);
        self.conversations
            .lock()
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads are disabled".into()));
        }
        Ok(self.conversations.lock().get(id).cloned())
    }

    async fn update_messages(&self, id: &ConversationId, messages: &[Message]) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut conversations = self.conversations.lock();
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        conversation.messages = messages.to_vec();
        conversation.updated_at = Utc::now();
        self.message_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_title(&self, id: &ConversationId, title: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut conversations = self.conversations.lock();
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        conversation.title = title.to_string();
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &ConversationId) -> Result<(), StoreError> {
        self.check_writable()?;
        self.conversations.lock().remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let mut summaries: Vec<_> = self
            .conversations
            .lock()
            .values()
            .map(Conversation::summary)
            .collect();
        sort_recent_first(&mut summaries);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_crud() {
        let store = MemoryStore::new();
        let conv = store.create("Hello").await.unwrap();

        let messages = vec![Message::user("Hello"), Message::assistant("Hi")];
        store.update_messages(&conv.id, &messages).await.unwrap();
        store.update_title(&conv.id, "Greeting").await.unwrap();

        let loaded = store.get(&conv.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Greeting");
        assert_eq!(loaded.messages, messages);
        assert_eq!(store.message_writes(), 1);

        store.delete(&conv.id).await.unwrap();
        assert!(store.get(&conv.id).await.unwrap().is_none());
        store.delete(&conv.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_messages(&ConversationId::from("missing"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_most_recent_first() {
        let store = MemoryStore::new();
        let first = store.create("first").await.unwrap();
        let second = store.create("second").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store
            .update_messages(&first.id, &[Message::user("bump")])
            .await
            .unwrap();

        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        let conv = store.create("x").await.unwrap();

        store.set_fail_writes(true);
        assert!(store.update_messages(&conv.id, &[]).await.is_err());
        store.set_fail_reads(true);
        assert!(matches!(store.get(&conv.id).await, Err(StoreError::Unavailable(_))));
    }
}
