use futures::StreamExt;
use parking_lot::Mutex;
use shared::{AssistantError, LifecycleProgress, ProviderKind, ProviderPreference, StreamStatus};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::lifecycle::LifecycleTracker;
use crate::registry::{ProviderInfo, ProviderRegistry};
use crate::InferenceProvider;

/// What a submitted prompt produces, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Status(StreamStatus),
    /// Initialization progress of the provider this submit is waiting on
    Progress(LifecycleProgress),
    Token(String),
}

/// Single entry point from a prompt to a stream of generated text.
///
/// Selection: explicit preference if that provider is supported, else the first
/// supported provider in registry order, else the first one whose readiness probe
/// succeeds. Provider errors are never retried here; retrying is the caller's call.
pub struct StreamingTransport {
    registry: ProviderRegistry,
    lifecycle: LifecycleTracker,
    preference: Mutex<ProviderPreference>,
    active: Mutex<Option<ProviderKind>>,
    provider_listeners: Mutex<Vec<UnboundedSender<ProviderKind>>>,
}

impl StreamingTransport {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry,
            lifecycle: LifecycleTracker::new(),
            preference: Mutex::new(ProviderPreference::Auto),
            active: Mutex::new(None),
            provider_listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn with_preference(self, preference: ProviderPreference) -> Self {
        *self.preference.lock() = preference;
        self
    }

    /// Applies to later submits only; an in-flight stream keeps its provider
    pub fn set_preferred_provider(&self, preference: ProviderPreference) {
        info!(%preference, "provider preference changed");
        *self.preference.lock() = preference;
    }

    pub fn preference(&self) -> ProviderPreference {
        *self.preference.lock()
    }

    /// Provider used by the most recent resolution
    pub fn active_provider(&self) -> Option<ProviderKind> {
        *self.active.lock()
    }

    pub fn lifecycle(&self) -> &LifecycleTracker {
        &self.lifecycle
    }

    /// Notified once per actual change of the resolved provider
    pub fn subscribe_provider_changes(&self) -> UnboundedReceiver<ProviderKind> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.provider_listeners.lock().push(tx);
        rx
    }

    /// Forwarded initialization progress
    pub fn subscribe_download_progress(&self) -> UnboundedReceiver<LifecycleProgress> {
        self.lifecycle.subscribe()
    }

    pub async fn available_providers(&self) -> Vec<ProviderKind> {
        self.registry.list_available().await
    }

    pub async fn describe_providers(&self) -> Vec<ProviderInfo> {
        self.registry.describe().await
    }

    /// Resolve the provider the next submit would use, without submitting.
    /// Useful after a preference change so observers hear about it early.
    pub async fn refresh_active(&self) -> Result<ProviderKind, AssistantError> {
        let provider = self.resolve().await?;
        self.set_active(provider.kind());
        Ok(provider.kind())
    }

    /// Stream a reply to `prompt`, calling `on_token` for each chunk in arrival order.
    ///
    /// Chunks already delivered before a `StreamAborted` are not retracted.
    pub async fn submit<F>(&self, prompt: &str, mut on_token: F) -> Result<(), AssistantError>
    where
        F: FnMut(&str) + Send,
    {
        self.submit_observed(prompt, |event| {
            if let TransportEvent::Token(text) = event {
                on_token(&text);
            }
        })
        .await
    }

    /// Like [`submit`](Self::submit) but also reports status transitions:
    /// `Preparing`, then `Initializing` if assets are needed, then `Streaming`,
    /// then `Completed` or `Failed`.
    pub async fn submit_observed<F>(&self, prompt: &str, mut on_event: F) -> Result<(), AssistantError>
    where
        F: FnMut(TransportEvent) + Send,
    {
        if prompt.trim().is_empty() {
            return Err(AssistantError::EmptyPrompt);
        }

        on_event(TransportEvent::Status(StreamStatus::Preparing));
        let provider = match self.resolve().await {
            Ok(provider) => provider,
            Err(e) => {
                warn!("no provider available");
                on_event(TransportEvent::Status(StreamStatus::Failed));
                return Err(e);
            }
        };
        let kind = provider.kind();
        self.set_active(kind);

        if provider.needs_initialization() && !self.lifecycle.is_ready(kind) {
            on_event(TransportEvent::Status(StreamStatus::Initializing));
        }
        // Progress is relayed inline so it always lands before `Streaming`
        let mut progress = self.lifecycle.subscribe();
        let init = self.lifecycle.ensure_ready(provider.as_ref());
        tokio::pin!(init);
        let ready = loop {
            tokio::select! {
                biased;
                Some(update) = progress.recv() => on_event(TransportEvent::Progress(update)),
                result = &mut init => break result,
            }
        };
        while let Ok(update) = progress.try_recv() {
            on_event(TransportEvent::Progress(update));
        }
        drop(progress);
        if let Err(e) = ready {
            on_event(TransportEvent::Status(StreamStatus::Failed));
            return Err(e);
        }

        let mut stream = match provider.generate_stream(prompt).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(provider = %kind, "failed to open stream: {:#}", e);
                on_event(TransportEvent::Status(StreamStatus::Failed));
                return Err(AssistantError::StreamAborted {
                    provider: kind,
                    reason: format!("{:#}", e),
                });
            }
        };

        on_event(TransportEvent::Status(StreamStatus::Streaming));
        let mut chunks = 0usize;
        while let Some(item) = stream.next().await {
            match item {
                Ok(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    chunks += 1;
                    on_event(TransportEvent::Token(text));
                }
                Err(e) => {
                    warn!(provider = %kind, chunks, "stream aborted: {:#}", e);
                    on_event(TransportEvent::Status(StreamStatus::Failed));
                    return Err(AssistantError::StreamAborted {
                        provider: kind,
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        debug!(provider = %kind, chunks, "stream finished");
        on_event(TransportEvent::Status(StreamStatus::Completed));
        Ok(())
    }

    async fn resolve(&self) -> Result<Arc<dyn InferenceProvider>, AssistantError> {
        let preference = self.preference();

        if let ProviderPreference::Fixed(kind) = preference {
            if let Some(provider) = self.registry.get(kind) {
                if provider.is_supported().await {
                    return Ok(provider);
                }
            }
            warn!(provider = %kind, "preferred provider unavailable, falling back to auto");
        }

        if let Some(provider) = self.registry.first_available().await {
            return Ok(provider);
        }

        self.registry
            .detect()
            .await
            .ok_or(AssistantError::ProviderUnavailable)
    }

    fn set_active(&self, kind: ProviderKind) {
        let changed = {
            let mut active = self.active.lock();
            if *active == Some(kind) {
                false
            } else {
                *active = Some(kind);
                true
            }
        };

        if changed {
            info!(provider = %kind, "active provider changed");
            self.provider_listeners
                .lock()
                .retain(|tx| tx.send(kind).is_ok());
        }
    }
}
