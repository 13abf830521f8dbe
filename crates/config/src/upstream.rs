//! Backend LLM provider configuration.

use secrecy::SecretString;
use serde::Deserialize;

/// Dialect spoken by the configured backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamKind {
    /// Any OpenAI-compatible chat completions endpoint.
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    /// An Anthropic-native messages endpoint.
    Anthropic,
}

/// Backend LLM provider the proxy forwards traffic to.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Which wire dialect the backend speaks.
    pub kind: UpstreamKind,
    /// Base URL of the backend API, e.g. `https://api.openai.com/v1`.
    pub base_url: Option<String>,
    /// API key sent to the backend.
    pub api_key: Option<SecretString>,
    /// Request timeout for upstream calls, in seconds.
    pub timeout_seconds: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            kind: UpstreamKind::OpenAi,
            base_url: None,
            api_key: None,
            timeout_seconds: 600,
        }
    }
}
