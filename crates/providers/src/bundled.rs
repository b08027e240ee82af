//! Bundled on-device runner.
//!
//! The archive is downloaded once, checked against its digest, unpacked into the
//! data directory and then invoked per prompt as a child process whose stdout is
//! the token stream.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use shared::settings::BundledSettings;
use shared::ProviderKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{InferenceProvider, ProgressReporter, TokenStream, SHARED_HTTP};

const INSTALL_DIR: &str = "current";
const STAGING_DIR: &str = ".staging";
const PARTIAL_ARCHIVE: &str = ".download.tar.gz.part";
const READY_MARKER: &str = ".ready";

pub struct BundledProvider {
    http: Client,
    archive_url: Option<String>,
    sha256: Option<String>,
    runner: String,
    args: Vec<String>,
    root: PathBuf,
}

impl BundledProvider {
    pub fn new(settings: &BundledSettings, root: PathBuf) -> Self {
        Self {
            http: SHARED_HTTP.clone(),
            archive_url: settings.archive_url.clone(),
            sha256: settings.sha256.as_ref().map(|s| s.trim().to_lowercase()),
            runner: settings.runner.clone(),
            args: settings.args.clone(),
            root,
        }
    }

    fn install_dir(&self) -> PathBuf {
        self.root.join(INSTALL_DIR)
    }

    fn runner_path(&self) -> PathBuf {
        self.install_dir().join(&self.runner)
    }

    /// Extracted on a previous run and not tampered with since
    pub fn is_installed(&self) -> bool {
        self.install_dir().join(READY_MARKER).exists() && self.runner_path().is_file()
    }

    /// Stream the archive to disk, hashing as it arrives
    async fn download(&self, url: &str, dest: &Path, progress: &ProgressReporter) -> Result<String> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;
        if !resp.status().is_success() {
            bail!("download failed: {}", resp.status());
        }
        let total = resp.content_length().filter(|t| *t > 0);

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let mut hasher = Sha256::new();
        let mut received: u64 = 0;
        let mut body = resp.bytes_stream();

        progress.downloading(0, "Downloading on-device model");
        while let Some(chunk) = body.next().await {
            let bytes = chunk.context("download interrupted")?;
            hasher.update(&bytes);
            file.write_all(&bytes).await?;
            received += bytes.len() as u64;
            if let Some(total) = total {
                let percent = (received.saturating_mul(100) / total).min(100) as u8;
                progress.downloading(
                    percent,
                    format!("Downloading on-device model ({} of {} MB)", received >> 20, total >> 20),
                );
            }
        }
        file.flush().await?;
        progress.downloading(100, "Download finished");

        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[async_trait]
impl InferenceProvider for BundledProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Bundled
    }

    async fn is_supported(&self) -> bool {
        self.archive_url.is_some() || self.is_installed()
    }

    fn needs_initialization(&self) -> bool {
        true
    }

    async fn initialize(&self, progress: &ProgressReporter) -> Result<()> {
        if self.is_installed() {
            debug!("bundled runner already extracted at {}", self.install_dir().display());
            return Ok(());
        }
        let url = self
            .archive_url
            .as_deref()
            .ok_or_else(|| anyhow!("no archive configured for the bundled model"))?;

        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create {}", self.root.display()))?;
        let archive = self.root.join(PARTIAL_ARCHIVE);

        info!("downloading bundled model from {}", url);
        let digest = match self.download(url, &archive, progress).await {
            Ok(digest) => digest,
            Err(e) => {
                let _ = tokio::fs::remove_file(&archive).await;
                return Err(e);
            }
        };
        if let Some(expected) = &self.sha256 {
            if &digest != expected {
                let _ = tokio::fs::remove_file(&archive).await;
                bail!("checksum mismatch: expected {}, got {}", expected, digest);
            }
        }

        progress.extracting("Unpacking on-device model");
        let root = self.root.clone();
        let archive_path = archive.clone();
        tokio::task::spawn_blocking(move || unpack(&archive_path, &root))
            .await
            .map_err(|e| anyhow!("extraction task failed: {}", e))??;
        let _ = tokio::fs::remove_file(&archive).await;

        if !self.runner_path().is_file() {
            bail!("archive does not contain `{}`", self.runner);
        }
        tokio::fs::write(self.install_dir().join(READY_MARKER), digest).await?;
        info!("bundled model ready at {}", self.install_dir().display());
        Ok(())
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream> {
        let runner = self.runner_path();
        let mut child = Command::new(&runner)
            .args(&self.args)
            .arg("--prompt")
            .arg(prompt)
            .current_dir(self.install_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", runner.display()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("runner stdout unavailable"))?;

        Ok(Box::pin(async_stream::stream! {
            let mut decoder = Utf8Decoder::default();
            let mut buf = [0u8; 4096];
            loop {
                let n = match stdout.read(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        yield Err(anyhow!("runner output error: {}", e));
                        return;
                    }
                };
                if n == 0 {
                    break;
                }
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() {
                    yield Ok(text);
                }
            }
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    warn!("bundled runner exited with {}", status);
                    yield Err(anyhow!("runner exited with {}", status));
                }
                Err(e) => {
                    yield Err(anyhow!("runner wait failed: {}", e));
                }
            }
        }))
    }
}

/// Unpack into a staging directory, then swap it into place so a crash
/// mid-extraction never leaves a half-populated install
fn unpack(archive: &Path, root: &Path) -> Result<()> {
    let staging = root.join(STAGING_DIR);
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    let file = std::fs::File::open(archive)
        .with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
    tar.unpack(&staging).context("Failed to unpack archive")?;

    let install = root.join(INSTALL_DIR);
    if install.exists() {
        std::fs::remove_dir_all(&install)?;
    }
    std::fs::rename(&staging, &install)?;
    Ok(())
}

/// Decodes UTF-8 across read boundaries, holding back an incomplete trailing sequence
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let out = s.to_string();
                self.pending.clear();
                out
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let out = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                out
            }
            Err(_) => {
                let out = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_http;
    use shared::LifecyclePhase;

    fn settings(url: Option<String>, sha256: Option<String>) -> BundledSettings {
        BundledSettings {
            archive_url: url,
            sha256,
            runner: "runner.sh".into(),
            args: vec![],
        }
    }

    fn archive_with_runner(script: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let mut header = tar::Header::new_gnu();
        header.set_size(script.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "runner.sh", script.as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_utf8_decoder_holds_partial_sequence() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "né".as_bytes();
        assert_eq!(decoder.decode(&bytes[..2]), "n");
        assert_eq!(decoder.decode(&bytes[2..]), "é");
    }

    #[tokio::test]
    async fn test_unconfigured_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let provider = BundledProvider::new(&settings(None, None), dir.path().to_path_buf());
        assert!(!provider.is_supported().await);
        assert!(provider.needs_initialization());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let base = test_http::serve(vec![(
            "application/gzip",
            archive_with_runner("#!/bin/sh\necho hi\n"),
        )])
        .await;
        let provider = BundledProvider::new(
            &settings(Some(format!("{}/model.tar.gz", base)), Some("00".repeat(32))),
            dir.path().to_path_buf(),
        );

        let err = provider
            .initialize(&ProgressReporter::detached(ProviderKind::Bundled))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(!provider.is_installed());
        assert!(!dir.path().join(PARTIAL_ARCHIVE).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_download_extract_and_run() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive_with_runner("#!/bin/sh\nprintf 'echo: %s' \"$2\"\n");
        let digest = format!("{:x}", Sha256::digest(&archive));
        let base = test_http::serve(vec![("application/gzip", archive)]).await;
        let provider = BundledProvider::new(
            &settings(Some(format!("{}/model.tar.gz", base)), Some(digest)),
            dir.path().to_path_buf(),
        );
        assert!(provider.is_supported().await);

        let tracker = crate::LifecycleTracker::new();
        let mut rx = tracker.subscribe();
        tracker.ensure_ready(&provider).await.unwrap();
        assert!(provider.is_installed());

        let mut phases = Vec::new();
        while let Ok(p) = rx.try_recv() {
            phases.push(p.phase);
        }
        assert_eq!(phases.first(), Some(&LifecyclePhase::Downloading));
        assert_eq!(
            phases.iter().filter(|p| **p == LifecyclePhase::Extracting).count(),
            1
        );
        assert_eq!(phases.last(), Some(&LifecyclePhase::Complete));

        let stream = provider.generate_stream("hello").await.unwrap();
        let text: String = stream.map(|c| c.unwrap()).collect::<Vec<_>>().await.concat();
        assert_eq!(text, "echo: hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_installed_runner_skips_download_and_reports_exit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let install = dir.path().join(INSTALL_DIR);
        std::fs::create_dir_all(&install).unwrap();
        let runner = install.join("runner.sh");
        std::fs::write(&runner, "#!/bin/sh\nprintf partial\nexit 3\n").unwrap();
        std::fs::set_permissions(&runner, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(install.join(READY_MARKER), "").unwrap();

        let provider = BundledProvider::new(&settings(None, None), dir.path().to_path_buf());
        assert!(provider.is_supported().await);
        provider
            .initialize(&ProgressReporter::detached(ProviderKind::Bundled))
            .await
            .unwrap();

        let chunks: Vec<_> = provider.generate_stream("x").await.unwrap().collect().await;
        assert_eq!(chunks[0].as_ref().unwrap(), "partial");
        assert!(chunks.last().unwrap().is_err());
    }
}
