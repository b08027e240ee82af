//! Capability registry for inference backends.
//!
//! Probing is never cached: host capabilities can change between calls
//! (a server started, a setting toggled), so every query probes again.

use shared::settings::ProviderSettings;
use shared::ProviderKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bundled::BundledProvider;
use crate::local_server::LocalServerProvider;
use crate::ollama::OllamaProvider;
use crate::InferenceProvider;

/// Known backends, kept in declared [`ProviderKind`] order
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn InferenceProvider>>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Register a provider, replacing any earlier one of the same kind
    pub fn register(&mut self, provider: Arc<dyn InferenceProvider>) {
        let kind = provider.kind();
        self.providers.retain(|p| p.kind() != kind);
        self.providers.push(provider);
        self.providers.sort_by_key(|p| p.kind());
    }

    pub fn with(mut self, provider: Arc<dyn InferenceProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn InferenceProvider>> {
        self.providers.iter().find(|p| p.kind() == kind).cloned()
    }

    /// Registered kinds in registry order
    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.providers.iter().map(|p| p.kind()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn InferenceProvider>> {
        self.providers.iter()
    }

    /// Kinds usable right now, in registry order
    pub async fn list_available(&self) -> Vec<ProviderKind> {
        let mut available = Vec::new();
        for provider in &self.providers {
            if provider.is_supported().await {
                available.push(provider.kind());
            }
        }
        debug!(?available, "probed providers");
        available
    }

    /// First supported provider in registry order
    pub async fn first_available(&self) -> Option<Arc<dyn InferenceProvider>> {
        for provider in &self.providers {
            if provider.is_supported().await {
                return Some(provider.clone());
            }
        }
        None
    }

    /// Run each provider's readiness probe in order; first one that comes up wins
    pub async fn detect(&self) -> Option<Arc<dyn InferenceProvider>> {
        for provider in &self.providers {
            if provider.detect().await {
                info!(provider = %provider.kind(), "detected provider");
                return Some(provider.clone());
            }
        }
        None
    }

    /// Availability of every registered provider, for display
    pub async fn describe(&self) -> Vec<ProviderInfo> {
        let mut info = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            info.push(ProviderInfo {
                kind: provider.kind(),
                name: provider.kind().display_name(),
                available: provider.is_supported().await,
                needs_initialization: provider.needs_initialization(),
            });
        }
        info
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Provider information for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub kind: ProviderKind,
    pub name: &'static str,
    pub available: bool,
    pub needs_initialization: bool,
}

/// Initialize the registry with every built-in backend
pub fn init_registry(settings: &ProviderSettings, data_dir: &Path) -> ProviderRegistry {
    ProviderRegistry::new()
        .with(Arc::new(OllamaProvider::new(&settings.ollama)))
        .with(Arc::new(LocalServerProvider::new(&settings.local_server)))
        .with(Arc::new(BundledProvider::new(
            &settings.bundled,
            data_dir.join("bundled"),
        )))
}
