//! Readiness gate and phased progress for providers that need assets.
//!
//! Each initialization is one episode. Within an episode updates only move
//! forward: `downloading` (non-decreasing percent), then `extracting`, then
//! `complete`, after which the episode is closed and further updates are dropped.

use parking_lot::Mutex;
use shared::{AssistantError, LifecyclePhase, LifecycleProgress, ProviderKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use crate::InferenceProvider;

type Subscribers = Arc<Mutex<Vec<UnboundedSender<LifecycleProgress>>>>;

/// Tracks which providers are initialized and fans out their progress
pub struct LifecycleTracker {
    gates: Mutex<HashMap<ProviderKind, Arc<OnceCell<()>>>>,
    subscribers: Subscribers,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self {
            gates: Mutex::new(HashMap::new()),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Receive progress for every initialization episode from now on
    pub fn subscribe(&self) -> UnboundedReceiver<LifecycleProgress> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn is_ready(&self, kind: ProviderKind) -> bool {
        self.gates
            .lock()
            .get(&kind)
            .map(|gate| gate.initialized())
            .unwrap_or(false)
    }

    /// Forget that `kind` is ready, so the next use starts a new episode
    pub fn reset(&self, kind: ProviderKind) {
        self.gates.lock().remove(&kind);
    }

    /// Run the provider's initialization once. Concurrent callers share the same
    /// episode; after a failure the next caller starts a fresh one.
    pub async fn ensure_ready(&self, provider: &dyn InferenceProvider) -> Result<(), AssistantError> {
        if !provider.needs_initialization() {
            return Ok(());
        }
        let kind = provider.kind();
        let gate = self.gate(kind);

        gate.get_or_try_init(|| async {
            info!(provider = %kind, "initializing provider");
            let reporter = ProgressReporter::new(kind, self.subscribers.clone());
            match provider.initialize(&reporter).await {
                Ok(()) => {
                    reporter.complete();
                    info!(provider = %kind, "provider ready");
                    Ok(())
                }
                Err(e) => {
                    error!(provider = %kind, "initialization failed: {:#}", e);
                    Err(AssistantError::ProviderInitFailed {
                        provider: kind,
                        reason: format!("{:#}", e),
                    })
                }
            }
        })
        .await
        .map(|_| ())
    }

    fn gate(&self, kind: ProviderKind) -> Arc<OnceCell<()>> {
        self.gates
            .lock()
            .entry(kind)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }
}

impl Default for LifecycleTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct EpisodeState {
    phase: Option<LifecyclePhase>,
    percent: u8,
    closed: bool,
}

/// Handed to [`InferenceProvider::initialize`]; enforces forward-only progress.
pub struct ProgressReporter {
    provider: ProviderKind,
    state: Mutex<EpisodeState>,
    subscribers: Subscribers,
}

impl ProgressReporter {
    fn new(provider: ProviderKind, subscribers: Subscribers) -> Self {
        Self {
            provider,
            state: Mutex::new(EpisodeState::default()),
            subscribers,
        }
    }

    /// Reporter whose updates go nowhere
    pub fn detached(provider: ProviderKind) -> Self {
        Self::new(provider, Arc::new(Mutex::new(Vec::new())))
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn downloading(&self, percent: u8, message: impl Into<String>) {
        self.report(LifecycleProgress::downloading(self.provider, percent, message));
    }

    pub fn extracting(&self, message: impl Into<String>) {
        self.report(LifecycleProgress::extracting(self.provider, message));
    }

    /// Close the episode. Idempotent.
    pub fn complete(&self) {
        self.report(LifecycleProgress::complete(self.provider));
    }

    fn report(&self, mut update: LifecycleProgress) {
        // Held while sending so concurrent reports cannot reorder.
        let mut state = self.state.lock();
        if state.closed {
            return;
        }

        if let Some(current) = state.phase {
            if update.phase < current {
                debug!(provider = %self.provider, ?current, next = ?update.phase, "dropping phase regression");
                return;
            }
            if update.phase == current {
                match current {
                    LifecyclePhase::Downloading => {
                        update.percent = update.percent.max(state.percent);
                        if update.percent == state.percent {
                            return;
                        }
                    }
                    // One extracting update per episode
                    _ => return,
                }
            }
        }

        state.phase = Some(update.phase);
        state.percent = update.percent;
        state.closed = update.phase == LifecyclePhase::Complete;

        self.subscribers
            .lock()
            .retain(|tx| tx.send(update.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedProvider;

    fn drain(rx: &mut UnboundedReceiver<LifecycleProgress>) -> Vec<LifecycleProgress> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    #[test]
    fn test_reporter_enforces_forward_progress() {
        let tracker = LifecycleTracker::new();
        let mut rx = tracker.subscribe();
        let reporter = ProgressReporter::new(ProviderKind::Bundled, tracker.subscribers.clone());

        reporter.downloading(10, "a");
        reporter.downloading(5, "b"); // lower percent is raised, then deduplicated
        reporter.downloading(60, "c");
        reporter.extracting("unpacking");
        reporter.downloading(90, "late"); // regression
        reporter.extracting("again");
        reporter.complete();
        reporter.downloading(100, "after complete");
        reporter.complete();

        let phases: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(|p| (p.phase, p.percent))
            .collect();
        assert_eq!(
            phases,
            vec![
                (LifecyclePhase::Downloading, 10),
                (LifecyclePhase::Downloading, 60),
                (LifecyclePhase::Extracting, 100),
                (LifecyclePhase::Complete, 100),
            ]
        );
    }

    #[tokio::test]
    async fn test_ensure_ready_runs_once() {
        let tracker = LifecycleTracker::new();
        let provider = ScriptedProvider::new(ProviderKind::Bundled).with_download(vec![50, 100]);

        assert!(!tracker.is_ready(ProviderKind::Bundled));
        tracker.ensure_ready(&provider).await.unwrap();
        tracker.ensure_ready(&provider).await.unwrap();

        assert!(tracker.is_ready(ProviderKind::Bundled));
        assert_eq!(provider.init_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_init_can_be_retried() {
        let tracker = LifecycleTracker::new();
        let mut rx = tracker.subscribe();
        let provider = ScriptedProvider::new(ProviderKind::Bundled)
            .with_download(vec![30])
            .with_init_failure("checksum mismatch");

        let err = tracker.ensure_ready(&provider).await.unwrap_err();
        assert!(matches!(
            err,
            AssistantError::ProviderInitFailed {
                provider: ProviderKind::Bundled,
                ..
            }
        ));
        assert!(!tracker.is_ready(ProviderKind::Bundled));

        // Failure is a rejection, not a progress update
        let updates = drain(&mut rx);
        assert!(updates.iter().all(|p| p.phase != LifecyclePhase::Complete));

        provider.clear_init_failure();
        tracker.ensure_ready(&provider).await.unwrap();
        assert_eq!(provider.init_calls(), 2);
    }

    #[tokio::test]
    async fn test_instant_provider_skips_gate() {
        let tracker = LifecycleTracker::new();
        let provider = ScriptedProvider::new(ProviderKind::LocalServer);
        tracker.ensure_ready(&provider).await.unwrap();
        assert_eq!(provider.init_calls(), 0);
    }
}
