//! OpenAI-compatible local server backend (LM Studio, llama.cpp server, vLLM).
//!
//! Instant-available: nothing to download, usable as soon as the port answers.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::settings::LocalServerSettings;
use shared::ProviderKind;
use std::time::Duration;

use crate::sse::{SseFrame, SseParser};
use crate::{endpoint_reachable, InferenceProvider, TokenStream, SHARED_HTTP};

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

pub struct LocalServerProvider {
    http: Client,
    base_url: String,
    model: String,
}

impl LocalServerProvider {
    pub fn new(settings: &LocalServerSettings) -> Self {
        Self {
            http: SHARED_HTTP.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
        }
    }
}

#[async_trait]
impl InferenceProvider for LocalServerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::LocalServer
    }

    async fn is_supported(&self) -> bool {
        endpoint_reachable(&self.base_url, PROBE_TIMEOUT).await
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let req = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: true,
        };
        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&req)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let detail: String = body.chars().take(800).collect();
            if detail.trim().is_empty() {
                return Err(anyhow!("local server error: {}", status));
            }
            return Err(anyhow!("local server error: {}\n{}", status, detail));
        }

        let mut body = resp.bytes_stream();
        Ok(Box::pin(async_stream::stream! {
            let mut parser = SseParser::new();
            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(anyhow!("stream read error: {}", e));
                        return;
                    }
                };
                for frame in parser.feed(&bytes) {
                    let data = match frame {
                        SseFrame::Done => return,
                        SseFrame::Data { data, .. } => data,
                    };
                    match serde_json::from_str::<StreamResponse>(&data) {
                        Ok(resp) => {
                            if let Some(content) = resp.choices.into_iter().next().and_then(|c| c.delta.content) {
                                if !content.is_empty() {
                                    yield Ok(content);
                                }
                            }
                        }
                        Err(e) => {
                            yield Err(anyhow!("Failed to parse server event: {}", e));
                            return;
                        }
                    }
                }
            }
            yield Err(anyhow!("connection closed before [DONE]"));
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_http;

    fn provider(base: &str) -> LocalServerProvider {
        LocalServerProvider::new(&LocalServerSettings {
            base_url: format!("{}/v1/", base),
            model: "test".into(),
        })
    }

    #[tokio::test]
    async fn test_stream_reads_deltas_until_done() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: [DONE]\n\n",
        )
        .to_string();
        let base = test_http::serve(vec![("text/event-stream", body)]).await;

        let stream = provider(&base).generate_stream("hello").await.unwrap();
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec!["Hi", " there"]);
    }

    #[tokio::test]
    async fn test_missing_done_is_an_abort() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n".to_string();
        let base = test_http::serve(vec![("text/event-stream", body)]).await;

        let stream = provider(&base).generate_stream("hello").await.unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_err());
    }

    #[tokio::test]
    async fn test_supported_only_when_listening() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        assert!(provider(&base).is_supported().await);

        drop(listener);
        assert!(!provider(&base).is_supported().await);
    }
}
