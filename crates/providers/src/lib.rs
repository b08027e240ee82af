//! Inference providers and the streaming transport in front of them.
//!
//! Every backend implements [`InferenceProvider`]. The [`ProviderRegistry`] knows
//! which backends exist, the [`LifecycleTracker`] gates the ones that need assets
//! before first use, and the [`StreamingTransport`] is the single entry point that
//! turns a prompt into a stream of text chunks.

pub mod bundled;
pub mod lifecycle;
pub mod local_server;
pub mod ollama;
pub mod registry;
#[cfg(any(test, feature = "test-support"))]
pub mod scripted;
pub mod sse;
#[cfg(test)]
mod test_http;
pub mod transport;

pub use lifecycle::{LifecycleTracker, ProgressReporter};
pub use registry::ProviderRegistry;
pub use transport::{StreamingTransport, TransportEvent};

use anyhow::Result;
use futures::stream::BoxStream;
use reqwest::Client;
use shared::ProviderKind;
use std::sync::LazyLock;
use std::time::Duration;

/// Connection pool shared by the HTTP backends. No overall timeout: generations
/// and model pulls legitimately run for minutes.
pub(crate) static SHARED_HTTP: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(2)
        .build()
        .expect("failed to build HTTP client")
});

/// Incremental text chunks in arrival order. An `Err` item means the channel broke.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Uniform contract over every inference backend
#[async_trait::async_trait]
pub trait InferenceProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Cheap probe of whether the backend can be used in this environment right now
    async fn is_supported(&self) -> bool;

    /// Backends that download or unpack assets before first use return true
    fn needs_initialization(&self) -> bool {
        false
    }

    /// Fetch and prepare assets, reporting phased progress.
    /// A failure is returned here, never as a progress update.
    async fn initialize(&self, _progress: &ProgressReporter) -> Result<()> {
        Ok(())
    }

    /// Last-resort readiness probe used when nothing is supported. May start a
    /// local service. Returns whether the backend became usable.
    async fn detect(&self) -> bool {
        false
    }

    /// Open a token stream for `prompt`. Errors before the first chunk are returned
    /// directly; errors after it arrive as stream items.
    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream>;
}

/// Whether something accepts TCP connections at the host and port of `base_url`
pub(crate) async fn endpoint_reachable(base_url: &str, timeout: Duration) -> bool {
    let Ok(url) = reqwest::Url::parse(base_url) else {
        return false;
    };
    let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) else {
        return false;
    };
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{}/v1", port);

        assert!(endpoint_reachable(&url, Duration::from_millis(500)).await);
        assert!(!endpoint_reachable("not a url", Duration::from_millis(50)).await);
    }
}
