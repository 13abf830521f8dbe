//! OpenAI-compatible backend.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ProxyError, ProxyResult, map_backend_status};
use crate::messages::openai::{ChatChunk, ChatRequest, ChatResponse};
use crate::streaming::ChunkStream;
use crate::upstream::{Backend, http_client};

const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1";

pub(crate) struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl OpenAiBackend {
    pub fn new(config: &config::UpstreamConfig) -> ProxyResult<Self> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_API_URL.to_string()),
            api_key: config.api_key.clone(),
        })
    }

    async fn post_completions(&self, request: &ChatRequest) -> ProxyResult<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);

        let body = sonic_rs::to_vec(request)
            .map_err(|error| ProxyError::InvalidRequest(format!("failed to serialize request: {error}")))?;

        let mut builder = self.client.post(&url).header("Content-Type", "application/json").body(body);

        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|error| ProxyError::Connection(format!("failed to send request to backend: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("backend API error ({status}): {error_text}");
            return Err(map_backend_status(status.as_u16(), error_text));
        }

        Ok(response)
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn complete(&self, mut request: ChatRequest) -> ProxyResult<ChatResponse> {
        request.stream = None;
        let response = self.post_completions(&request).await?;

        let response_text = response.text().await.map_err(|error| {
            log::error!("failed to read backend response body: {error}");
            ProxyError::Internal(None)
        })?;

        sonic_rs::from_str(&response_text).map_err(|error| {
            log::error!("failed to parse backend chat completion response: {error}");
            log::debug!("response parsing failed, length: {} bytes", response_text.len());
            ProxyError::Internal(None)
        })
    }

    async fn stream(&self, mut request: ChatRequest) -> ProxyResult<ChunkStream> {
        request.stream = Some(true);
        let response = self.post_completions(&request).await?;

        let event_stream = response.bytes_stream().eventsource();

        let chunk_stream = event_stream.filter_map(|event| async move {
            let Ok(event) = event else {
                log::warn!("SSE parsing error in backend stream");
                return None;
            };

            if event.data == "[DONE]" {
                return None;
            }

            match sonic_rs::from_str::<ChatChunk>(&event.data) {
                Ok(chunk) => Some(Ok(chunk)),
                Err(error) => {
                    log::warn!("failed to parse backend streaming chunk: {error}");
                    None
                }
            }
        });

        Ok(Box::pin(chunk_stream))
    }

    fn name(&self) -> &str {
        "openai"
    }
}
