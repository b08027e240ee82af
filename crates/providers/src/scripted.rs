//! Deterministic provider for tests.
//!
//! Scripts support, detection, download progress, init failure, the chunks a
//! stream yields, an abort point, and an optional pause inside the stream.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::ProviderKind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::{InferenceProvider, ProgressReporter, TokenStream};

pub struct ScriptedProvider {
    kind: ProviderKind,
    supported: AtomicBool,
    detectable: AtomicBool,
    download: Vec<u8>,
    init_failure: Mutex<Option<String>>,
    open_failure: Mutex<Option<String>>,
    chunks: Mutex<Vec<String>>,
    abort_after: Mutex<Option<usize>>,
    pause: Mutex<Option<(usize, Arc<Notify>)>>,
    init_calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    /// Supported, instant-available provider that answers "ok"
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            supported: AtomicBool::new(true),
            detectable: AtomicBool::new(false),
            download: Vec::new(),
            init_failure: Mutex::new(None),
            open_failure: Mutex::new(None),
            chunks: Mutex::new(vec!["ok".to_string()]),
            abort_after: Mutex::new(None),
            pause: Mutex::new(None),
            init_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn unsupported(self) -> Self {
        self.supported.store(false, Ordering::SeqCst);
        self
    }

    /// Unsupported until `detect()` runs
    pub fn detectable(self) -> Self {
        self.detectable.store(true, Ordering::SeqCst);
        self
    }

    /// Require initialization, reporting these download percentages then extracting
    pub fn with_download(mut self, percents: Vec<u8>) -> Self {
        self.download = percents;
        self
    }

    pub fn with_init_failure(self, reason: &str) -> Self {
        *self.init_failure.lock() = Some(reason.to_string());
        self
    }

    pub fn with_open_failure(self, reason: &str) -> Self {
        *self.open_failure.lock() = Some(reason.to_string());
        self
    }

    pub fn with_chunks(self, chunks: &[&str]) -> Self {
        self.set_chunks(chunks);
        self
    }

    /// Break the stream after `n` chunks
    pub fn with_abort_after(self, n: usize) -> Self {
        *self.abort_after.lock() = Some(n);
        self
    }

    /// Wait on `gate` after `n` chunks before continuing
    pub fn with_pause_after(self, n: usize, gate: Arc<Notify>) -> Self {
        *self.pause.lock() = Some((n, gate));
        self
    }

    pub fn set_supported(&self, supported: bool) {
        self.supported.store(supported, Ordering::SeqCst);
    }

    pub fn set_chunks(&self, chunks: &[&str]) {
        *self.chunks.lock() = chunks.iter().map(|c| c.to_string()).collect();
    }

    pub fn clear_init_failure(&self) {
        *self.init_failure.lock() = None;
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn is_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    fn needs_initialization(&self) -> bool {
        !self.download.is_empty()
    }

    async fn initialize(&self, progress: &ProgressReporter) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        for percent in &self.download {
            progress.downloading(*percent, format!("Downloading {}%", percent));
            tokio::task::yield_now().await;
        }
        if let Some(reason) = self.init_failure.lock().clone() {
            bail!(reason);
        }
        progress.extracting("Extracting");
        Ok(())
    }

    async fn detect(&self) -> bool {
        if self.detectable.load(Ordering::SeqCst) {
            self.supported.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream> {
        self.prompts.lock().push(prompt.to_string());
        if let Some(reason) = self.open_failure.lock().clone() {
            bail!(reason);
        }

        let chunks = self.chunks.lock().clone();
        let abort_after = *self.abort_after.lock();
        let pause = self.pause.lock().clone();

        Ok(Box::pin(async_stream::stream! {
            for (i, chunk) in chunks.into_iter().enumerate() {
                if abort_after == Some(i) {
                    yield Err(anyhow!("connection reset after {} chunks", i));
                    return;
                }
                if let Some((at, gate)) = &pause {
                    if *at == i {
                        gate.notified().await;
                    }
                }
                yield Ok(chunk);
            }
        }))
    }
}
