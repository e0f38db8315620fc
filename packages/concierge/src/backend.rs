//! Chat-completions client speaking the streaming OpenAI wire format.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::ACCEPT;
use serde_json::json;
use tracing::{debug, warn};
use turn_relay::{ByteStream, ChatMessage, GenerationBackend, RelayError};

use crate::config::BackendConfig;

/// Longest upstream error body kept for the log line.
const MAX_ERROR_BODY_CHARS: usize = 300;

pub struct OpenAiBackend {
    client: reqwest::Client,
    config: BackendConfig,
}

impl OpenAiBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    fn request_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true,
        })
    }
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    async fn open_stream(&self, messages: &[ChatMessage]) -> Result<ByteStream, RelayError> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header(ACCEPT, "text/event-stream")
            .json(&self.request_body(messages));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        debug!(url = %self.config.url, model = %self.config.model, messages = messages.len(), "Opening generation stream");

        let response = request
            .send()
            .await
            .map_err(|e| RelayError::UpstreamDisconnect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            warn!(%status, body = %body, "Generation backend rejected the request");
            return Err(RelayError::UpstreamRejected(format!("HTTP {}", status)));
        }

        Ok(response
            .bytes_stream()
            .map_err(|e| RelayError::UpstreamDisconnect(e.to_string()))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use turn_relay::Role;

    fn backend(url: String, api_key: Option<&str>) -> OpenAiBackend {
        OpenAiBackend::new(BackendConfig {
            url,
            model: "test-model".to_string(),
            api_key: api_key.map(str::to_string),
        })
        .unwrap()
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/v1/chat/completions", addr)
    }

    #[test]
    fn request_body_asks_for_a_stream() {
        let b = backend("http://unused".to_string(), None);
        let body = b.request_body(&[
            ChatMessage::new(Role::System, "sé breve"),
            ChatMessage::new(Role::User, "hola"),
        ]);

        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hola");
    }

    #[tokio::test]
    async fn streams_body_bytes_and_sends_bearer() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|headers: axum::http::HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if auth != "Bearer sk-test" {
                    return (StatusCode::UNAUTHORIZED, String::new());
                }
                (StatusCode::OK, "data: {\"choices\":[]}\n\ndata: [DONE]\n\n".to_string())
            }),
        );
        let url = serve(router).await;

        let stream = backend(url, Some("sk-test"))
            .open_stream(&[ChatMessage::new(Role::User, "hola")])
            .await
            .unwrap();
        let chunks: Vec<_> = stream.try_collect().await.unwrap();
        let body: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert!(String::from_utf8(body).unwrap().ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn error_status_is_rejection() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let url = serve(router).await;

        let err = backend(url, None).open_stream(&[]).await.err().unwrap();
        assert_eq!(err.error_code(), "upstream_rejected");
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn unreachable_host_is_disconnect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = backend(format!("http://{}/", addr), None)
            .open_stream(&[])
            .await
            .err()
            .unwrap();
        assert_eq!(err.error_code(), "upstream_disconnect");
    }
}
