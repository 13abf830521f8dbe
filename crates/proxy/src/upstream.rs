//! Upstream LLM backends.
//!
//! Both flavors implement [`Backend`]: non-streaming completion plus a
//! streaming chunk stream in the normalized dialect. The Anthropic backend
//! converts at its edges so the rest of the pipeline never sees its dialect.

pub(crate) mod anthropic;
pub(crate) mod openai;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ProxyError, ProxyResult};
use crate::messages::openai::{ChatRequest, ChatResponse};
use crate::streaming::ChunkStream;

/// One backend LLM provider.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Non-streaming completion.
    async fn complete(&self, request: ChatRequest) -> ProxyResult<ChatResponse>;

    /// Streaming completion. The returned stream yields normalized chunks
    /// in upstream order.
    async fn stream(&self, request: ChatRequest) -> ProxyResult<ChunkStream>;

    fn name(&self) -> &str;
}

/// Construct the backend selected by configuration.
pub fn backend_from_config(config: &config::UpstreamConfig) -> ProxyResult<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match config.kind {
        config::UpstreamKind::OpenAi => Arc::new(openai::OpenAiBackend::new(config)?),
        config::UpstreamKind::Anthropic => Arc::new(anthropic::AnthropicBackend::new(config)?),
    };

    Ok(backend)
}

/// Shared reqwest client construction with the configured timeout.
fn http_client(config: &config::UpstreamConfig) -> ProxyResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.timeout_seconds))
        .build()
        .map_err(|error| {
            log::error!("failed to build upstream HTTP client: {error}");
            ProxyError::Internal(None)
        })
}
