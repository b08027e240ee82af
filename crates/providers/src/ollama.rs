//! Ollama backend.
//!
//! Supported when the local Ollama server accepts connections. The model is
//! pulled on first use, and the pull's NDJSON status lines drive the lifecycle
//! phases. If the server is not running, detection tries `ollama serve` from PATH.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::settings::OllamaSettings;
use shared::ProviderKind;
use std::collections::HashMap;
use std::env;
use std::process::Stdio;
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::{endpoint_reachable, InferenceProvider, ProgressReporter, TokenStream, SHARED_HTTP};

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);
const SERVE_WAIT_SECS: u64 = 5;

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

/// Streaming response: each line is one of these JSON objects.
#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Debug, Serialize)]
struct PullRequest<'a> {
    model: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct PullStatus {
    #[serde(default)]
    status: String,
    digest: Option<String>,
    total: Option<u64>,
    completed: Option<u64>,
    error: Option<String>,
}

pub struct OllamaProvider {
    http: Client,
    base: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(settings: &OllamaSettings) -> Self {
        let base = env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| settings.base_url.clone());
        let model = if settings.model.trim().is_empty() {
            let (model, description) = recommended_model();
            debug!(model, description, "no Ollama model configured, using recommendation");
            model.to_string()
        } else {
            settings.model.clone()
        };
        Self {
            http: SHARED_HTTP.clone(),
            base: base.trim_end_matches('/').to_string(),
            model,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether the configured model is already pulled
    pub async fn model_available(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.base);
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            bail!("ollama error: {}", resp.status());
        }
        let tags: TagsResponse = resp.json().await?;
        Ok(tags.models.iter().any(|m| model_matches(&self.model, &m.name)))
    }

    async fn pull(&self, progress: &ProgressReporter) -> Result<()> {
        info!(model = %self.model, "pulling Ollama model");
        let url = format!("{}/api/pull", self.base);
        let req = PullRequest {
            model: &self.model,
            stream: true,
        };
        let resp = self.http.post(url).json(&req).send().await?;
        if !resp.status().is_success() {
            bail!("ollama pull failed: {}", resp.status());
        }

        let mut body = resp.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut tracker = PullTracker::default();

        while let Some(chunk) = body.next().await {
            let bytes = chunk.map_err(|e| anyhow!("pull stream read error: {}", e))?;
            for line in lines.push(&bytes) {
                let status: PullStatus = serde_json::from_str(&line)
                    .with_context(|| format!("Failed to parse Ollama pull status: {}", line))?;
                match tracker.apply(status)? {
                    PullStep::Downloading(percent) => {
                        progress.downloading(percent, format!("Downloading {}", self.model))
                    }
                    PullStep::Extracting(message) => progress.extracting(message),
                    PullStep::Success => return Ok(()),
                    PullStep::Nothing => {}
                }
            }
        }

        bail!("pull for {} ended before it finished", self.model)
    }
}

#[async_trait]
impl InferenceProvider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn is_supported(&self) -> bool {
        endpoint_reachable(&self.base, PROBE_TIMEOUT).await
    }

    fn needs_initialization(&self) -> bool {
        true
    }

    async fn initialize(&self, progress: &ProgressReporter) -> Result<()> {
        if self.model_available().await? {
            debug!(model = %self.model, "model already present");
            return Ok(());
        }
        self.pull(progress).await
    }

    /// Start a system-installed `ollama serve` and wait for it to listen
    async fn detect(&self) -> bool {
        let name = if cfg!(windows) { "ollama.exe" } else { "ollama" };
        let spawned = tokio::process::Command::new(name)
            .arg("serve")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            debug!("could not start ollama serve: {}", e);
            return false;
        }

        for _ in 0..(SERVE_WAIT_SECS * 4) {
            if self.is_supported().await {
                info!("started ollama serve");
                return true;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        warn!("ollama serve started but did not become reachable");
        false
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream> {
        let url = format!("{}/api/chat", self.base);
        let req = OllamaChatRequest {
            model: &self.model,
            messages: vec![OllamaMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            stream: true,
        };
        let resp = self.http.post(url).json(&req).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("ollama error: {}", resp.status()));
        }

        // Ollama streams line-delimited JSON and marks the last line with `done`
        let mut body = resp.bytes_stream();
        Ok(Box::pin(async_stream::stream! {
            let mut lines = LineBuffer::default();
            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(anyhow!("stream read error: {}", e));
                        return;
                    }
                };
                for line in lines.push(&bytes) {
                    let parsed = match serde_json::from_str::<OllamaStreamChunk>(&line) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            yield Err(anyhow!("Failed to parse Ollama stream: {}", e));
                            return;
                        }
                    };
                    if let Some(error) = parsed.error {
                        yield Err(anyhow!("ollama error: {}", error));
                        return;
                    }
                    if let Some(msg) = parsed.message {
                        if !msg.content.is_empty() {
                            yield Ok(msg.content);
                        }
                    }
                    if parsed.done {
                        return;
                    }
                }
            }
            yield Err(anyhow!("connection closed before the reply finished"));
        }))
    }
}

/// Splits a byte stream into complete lines, keeping partial lines (and partial
/// UTF-8 sequences) until the rest arrives.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PullStep {
    Downloading(u8),
    Extracting(String),
    Success,
    Nothing,
}

/// Folds per-layer byte counts into one overall percentage
#[derive(Debug, Default)]
struct PullTracker {
    layers: HashMap<String, (u64, u64)>,
}

impl PullTracker {
    fn apply(&mut self, status: PullStatus) -> Result<PullStep> {
        if let Some(error) = status.error {
            bail!("ollama pull failed: {}", error);
        }
        if status.status == "success" {
            return Ok(PullStep::Success);
        }
        if status.status.starts_with("verifying") || status.status.starts_with("writing") {
            return Ok(PullStep::Extracting(status.status));
        }
        if let (Some(digest), Some(total)) = (status.digest, status.total) {
            let completed = status.completed.unwrap_or(0).min(total);
            self.layers.insert(digest, (completed, total));
            return Ok(PullStep::Downloading(self.percent()));
        }
        Ok(PullStep::Nothing)
    }

    fn percent(&self) -> u8 {
        let (done, total) = self
            .layers
            .values()
            .fold((0u64, 0u64), |(d, t), (c, s)| (d + c, t + s));
        if total == 0 {
            0
        } else {
            (done.saturating_mul(100) / total).min(100) as u8
        }
    }
}

/// `llama3.2` matches `llama3.2:latest`; tagged names must match exactly
fn model_matches(wanted: &str, installed: &str) -> bool {
    if wanted.contains(':') {
        installed == wanted
    } else {
        installed == wanted || installed == format!("{}:latest", wanted)
    }
}

/// How much RAM is available (approximately) for choosing a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RamTier {
    /// < 4 GB
    Tiny,
    /// 4-7 GB
    Low,
    /// 8-15 GB
    Medium,
    /// 16+ GB
    High,
}

impl RamTier {
    fn from_gb(gb: f64) -> Self {
        if gb < 4.0 {
            RamTier::Tiny
        } else if gb < 8.0 {
            RamTier::Low
        } else if gb < 16.0 {
            RamTier::Medium
        } else {
            RamTier::High
        }
    }
}

fn ram_tier() -> RamTier {
    let mut sys = System::new();
    sys.refresh_memory();
    RamTier::from_gb(sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0))
}

fn model_for_tier(tier: RamTier) -> (&'static str, &'static str) {
    match tier {
        RamTier::Tiny => ("tinyllama", "TinyLlama (1.1B), fits on low-RAM devices"),
        RamTier::Low => ("llama3.2:1b", "Llama 3.2 1B, compact but capable"),
        RamTier::Medium => ("llama3.2:3b", "Llama 3.2 3B, good balance of speed and quality"),
        RamTier::High => ("llama3.1:8b", "Llama 3.1 8B, best local quality"),
    }
}

/// Pick a default model for this machine's RAM.
///
/// Returns `(model_tag, human_description)`.
pub fn recommended_model() -> (&'static str, &'static str) {
    model_for_tier(ram_tier())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_http;
    use shared::{LifecyclePhase, LifecycleProgress};
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn provider(base: &str, model: &str) -> OllamaProvider {
        OllamaProvider {
            http: SHARED_HTTP.clone(),
            base: base.to_string(),
            model: model.to_string(),
        }
    }

    fn status(json: &str) -> PullStatus {
        serde_json::from_str(json).unwrap()
    }

    fn drain(rx: &mut UnboundedReceiver<LifecycleProgress>) -> Vec<LifecycleProgress> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    #[test]
    fn test_line_buffer_split_across_chunks() {
        let mut lines = LineBuffer::default();
        assert!(lines.push(b"{\"a\":").is_empty());
        assert_eq!(lines.push(b"1}\n\n{\"b\":2}\n{"), vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(lines.push(b"}\n"), vec!["{}"]);
    }

    #[test]
    fn test_pull_tracker_aggregates_layers() {
        let mut tracker = PullTracker::default();
        assert_eq!(
            tracker.apply(status(r#"{"status":"pulling manifest"}"#)).unwrap(),
            PullStep::Nothing
        );
        assert_eq!(
            tracker
                .apply(status(r#"{"status":"pulling a","digest":"a","total":100,"completed":50}"#))
                .unwrap(),
            PullStep::Downloading(50)
        );
        assert_eq!(
            tracker
                .apply(status(r#"{"status":"pulling b","digest":"b","total":100,"completed":0}"#))
                .unwrap(),
            PullStep::Downloading(25)
        );
        assert_eq!(
            tracker.apply(status(r#"{"status":"verifying sha256 digest"}"#)).unwrap(),
            PullStep::Extracting("verifying sha256 digest".into())
        );
        assert_eq!(
            tracker.apply(status(r#"{"status":"success"}"#)).unwrap(),
            PullStep::Success
        );
        assert!(tracker
            .apply(status(r#"{"error":"pull model manifest: file does not exist"}"#))
            .is_err());
    }

    #[test]
    fn test_model_matching() {
        assert!(model_matches("llama3.2", "llama3.2:latest"));
        assert!(model_matches("llama3.2:3b", "llama3.2:3b"));
        assert!(!model_matches("llama3.2:3b", "llama3.2:1b"));
        assert!(!model_matches("llama3", "llama3.2:latest"));
    }

    #[test]
    fn test_model_for_tier() {
        assert_eq!(model_for_tier(RamTier::from_gb(2.0)).0, "tinyllama");
        assert_eq!(model_for_tier(RamTier::from_gb(12.0)).0, "llama3.2:3b");
        assert_eq!(model_for_tier(RamTier::from_gb(64.0)).0, "llama3.1:8b");
    }

    #[tokio::test]
    async fn test_chat_stream_yields_content_until_done() {
        let body = [
            r#"{"message":{"role":"assistant","content":"Hel"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":"lo"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":""},"done":true}"#,
        ]
        .join("\n");
        let base = test_http::serve(vec![("application/x-ndjson", body)]).await;

        let stream = provider(&base, "llama3.2").generate_stream("hi").await.unwrap();
        let chunks: Vec<_> = stream.collect().await;
        let text: Vec<String> = chunks.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(text, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_chat_stream_without_done_is_an_abort() {
        let body = r#"{"message":{"role":"assistant","content":"partial"},"done":false}"#.to_string() + "\n";
        let base = test_http::serve(vec![("application/x-ndjson", body)]).await;

        let stream = provider(&base, "llama3.2").generate_stream("hi").await.unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_ref().unwrap(), "partial");
        assert!(chunks[1].is_err());
    }

    #[tokio::test]
    async fn test_initialize_pulls_missing_model() {
        let tags = r#"{"models":[{"name":"other:latest"}]}"#.to_string();
        let pull = [
            r#"{"status":"pulling manifest"}"#,
            r#"{"status":"pulling x","digest":"x","total":200,"completed":100}"#,
            r#"{"status":"pulling x","digest":"x","total":200,"completed":200}"#,
            r#"{"status":"verifying sha256 digest"}"#,
            r#"{"status":"writing manifest"}"#,
            r#"{"status":"success"}"#,
        ]
        .join("\n");
        let base = test_http::serve(vec![
            ("application/json", tags),
            ("application/x-ndjson", pull),
        ])
        .await;

        let tracker = crate::LifecycleTracker::new();
        let mut rx = tracker.subscribe();
        let ollama: Arc<dyn InferenceProvider> = Arc::new(provider(&base, "llama3.2"));
        tracker.ensure_ready(ollama.as_ref()).await.unwrap();

        let phases: Vec<_> = drain(&mut rx).into_iter().map(|p| (p.phase, p.percent)).collect();
        assert_eq!(
            phases,
            vec![
                (LifecyclePhase::Downloading, 50),
                (LifecyclePhase::Downloading, 100),
                (LifecyclePhase::Extracting, 100),
                (LifecyclePhase::Complete, 100),
            ]
        );
    }

    #[tokio::test]
    async fn test_initialize_skips_pull_when_present() {
        let tags = r#"{"models":[{"name":"llama3.2:latest"}]}"#.to_string();
        let base = test_http::serve(vec![("application/json", tags)]).await;

        let reporter = ProgressReporter::detached(ProviderKind::Ollama);
        provider(&base, "llama3.2").initialize(&reporter).await.unwrap();
    }
}
