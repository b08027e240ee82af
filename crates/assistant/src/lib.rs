//! Assistant core: conversation state, persistence timing and the streaming
//! reply cycle, behind one [`Assistant`] facade.
//!
//! Everything the presentation layer needs arrives as [`UiEvent`]s through the
//! [`Outbox`]; the presentation layer calls [`Assistant::mark_ready`] once it can
//! receive them.

pub mod commands;
pub mod orchestrator;
pub mod outbox;
pub mod prompts;
pub mod session;
pub mod synchronizer;

pub use commands::{HostCommand, PreparedRequest, Tone};
pub use orchestrator::Orchestrator;
pub use outbox::{Outbox, OutboxFull};
pub use synchronizer::{CommitGate, CommitOutcome, PersistenceSynchronizer};

use anyhow::{Context, Result};
use providers::registry::{init_registry, ProviderInfo};
use providers::StreamingTransport;
use shared::settings::AssistantSettings;
use shared::{
    AssistantError, ConversationId, ConversationSummary, Message, ProviderPreference, UiEvent,
};
use std::path::Path;
use std::sync::Arc;
use store::{ConversationStore, JsonFileStore, MemoryStore, SearchHit, StoreError, DEFAULT_TITLE};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct Assistant {
    settings: AssistantSettings,
    transport: Arc<StreamingTransport>,
    sync: Arc<PersistenceSynchronizer>,
    orchestrator: Orchestrator,
    forwarder: JoinHandle<()>,
}

impl Assistant {
    /// Wire the pieces together. Must be called inside a Tokio runtime.
    pub fn new(
        settings: AssistantSettings,
        transport: StreamingTransport,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        let outbox = Arc::new(Outbox::new(settings.outbox_capacity));
        let transport = Arc::new(transport);
        let sync = Arc::new(PersistenceSynchronizer::new(store, outbox.clone()));
        let orchestrator = Orchestrator::new(
            transport.clone(),
            sync.clone(),
            settings.history_window,
            settings.title_max_chars,
        );

        let mut provider_changes = transport.subscribe_provider_changes();
        let forwarder = tokio::spawn(async move {
            while let Some(provider) = provider_changes.recv().await {
                outbox.publish(UiEvent::ProviderChanged { provider });
            }
        });

        Self {
            settings,
            transport,
            sync,
            orchestrator,
            forwarder,
        }
    }

    /// Build the default stack: every known backend, and conversations stored as
    /// JSON under `data_dir` (or in memory)
    pub async fn open(settings: AssistantSettings, data_dir: &Path, in_memory: bool) -> Result<Self> {
        let registry = init_registry(&settings.providers, data_dir);
        let transport =
            StreamingTransport::new(registry).with_preference(settings.providers.preference);

        let store: Arc<dyn ConversationStore> = if in_memory {
            info!("conversations are kept in memory only");
            Arc::new(MemoryStore::new())
        } else {
            let dir = data_dir.join("conversations");
            let store = JsonFileStore::open(&dir)
                .await
                .with_context(|| format!("Failed to open conversation store at {}", dir.display()))?;
            info!(dir = %dir.display(), "conversation store ready");
            Arc::new(store)
        };

        Ok(Self::new(settings, transport, store))
    }

    pub fn settings(&self) -> &AssistantSettings {
        &self.settings
    }

    pub fn transport(&self) -> &Arc<StreamingTransport> {
        &self.transport
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        self.sync.outbox()
    }

    /// The presentation layer is ready: flush the backlog and deliver live from now on
    pub fn mark_ready(&self, sink: UnboundedSender<UiEvent>) -> usize {
        self.outbox().mark_ready(sink)
    }

    pub fn selected(&self) -> Option<ConversationId> {
        self.sync.selected()
    }

    /// Working buffer of the selected conversation
    pub fn messages(&self) -> Vec<Message> {
        self.sync.buffer()
    }

    pub async fn send(&self, text: &str) -> Result<ConversationId, AssistantError> {
        self.orchestrator.send(text).await
    }

    pub async fn run(&self, command: &HostCommand) -> Result<ConversationId, AssistantError> {
        self.orchestrator.run(command).await
    }

    /// Create an empty conversation and switch to it
    pub async fn new_conversation(&self, title: Option<&str>) -> Result<ConversationId, AssistantError> {
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TITLE);
        let conversation = self.sync.store().create(title).await.map_err(|e| {
            self.publish_error(AssistantError::PersistenceWriteFailed {
                id: ConversationId::from("new"),
                reason: e.to_string(),
            })
        })?;
        info!(conversation = %conversation.id, "conversation created");

        self.sync.open(Some(conversation.id.clone())).await?;
        self.outbox().publish(UiEvent::ConversationsChanged);
        Ok(conversation.id)
    }

    /// Switch to an existing conversation
    pub async fn open_conversation(&self, id: &ConversationId) -> Result<(), AssistantError> {
        match self.sync.store().get(id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(self.publish_error(AssistantError::ConversationNotFound(id.clone())))
            }
            Err(e) => return Err(self.publish_error(load_failed(id, e))),
        }
        self.sync.open(Some(id.clone())).await
    }

    pub async fn rename(&self, id: &ConversationId, title: &str) -> Result<(), AssistantError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(self.publish_error(AssistantError::EmptyPrompt));
        }
        self.sync
            .store()
            .update_title(id, title)
            .await
            .map_err(|e| self.publish_error(write_failed(id, e)))?;
        debug!(conversation = %id, %title, "conversation renamed");
        self.outbox().publish(UiEvent::ConversationsChanged);
        Ok(())
    }

    /// Delete a conversation, deselecting it if it is the current one
    pub async fn delete(&self, id: &ConversationId) -> Result<(), AssistantError> {
        self.sync
            .store()
            .delete(id)
            .await
            .map_err(|e| self.publish_error(write_failed(id, e)))?;
        self.sync.forget(id);
        info!(conversation = %id, "conversation deleted");
        self.outbox().publish(UiEvent::ConversationsChanged);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ConversationSummary>, AssistantError> {
        self.sync.store().list().await.map_err(|e| {
            self.publish_error(AssistantError::PersistenceLoadFailed {
                id: ConversationId::from("*"),
                reason: e.to_string(),
            })
        })
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, AssistantError> {
        store::search(self.sync.store().as_ref(), query, limit)
            .await
            .map_err(|e| {
                self.publish_error(AssistantError::PersistenceLoadFailed {
                    id: ConversationId::from("*"),
                    reason: e.to_string(),
                })
            })
    }

    /// Save anything the store is behind on
    pub async fn flush(&self) -> Result<(), AssistantError> {
        self.sync.reconcile().await
    }

    pub async fn providers(&self) -> Vec<ProviderInfo> {
        self.transport.describe_providers().await
    }

    /// Change provider selection for later replies and resolve it right away so
    /// observers learn about the new provider
    pub async fn set_provider(&self, preference: ProviderPreference) {
        self.transport.set_preferred_provider(preference);
        if let Err(e) = self.transport.refresh_active().await {
            debug!("no provider resolved after preference change: {}", e);
        }
    }

    fn publish_error(&self, error: AssistantError) -> AssistantError {
        self.outbox().publish(UiEvent::from_error(&error));
        error
    }
}

impl Drop for Assistant {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

fn write_failed(id: &ConversationId, e: StoreError) -> AssistantError {
    match e {
        StoreError::NotFound(id) => AssistantError::ConversationNotFound(id),
        e => AssistantError::PersistenceWriteFailed {
            id: id.clone(),
            reason: e.to_string(),
        },
    }
}

fn load_failed(id: &ConversationId, e: StoreError) -> AssistantError {
    AssistantError::PersistenceLoadFailed {
        id: id.clone(),
        reason: e.to_string(),
    }
}
