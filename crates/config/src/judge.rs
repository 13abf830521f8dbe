//! Judge LLM configuration for tool-call evaluating policies.

use secrecy::SecretString;
use serde::Deserialize;

/// Judge LLM used by policies that evaluate tool calls.
///
/// The judge is any OpenAI-compatible chat completions endpoint. It is
/// deliberately separate from the upstream block so a cheap local model can
/// judge traffic destined for a frontier backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JudgeConfig {
    /// Model identifier sent to the judge endpoint.
    pub model: String,
    /// Base URL of the judge endpoint.
    pub base_url: Option<String>,
    /// API key for the judge endpoint.
    pub api_key: Option<SecretString>,
    /// Harm probability at or above which a tool call is blocked.
    pub probability_threshold: f64,
    /// Sampling temperature for the judge call.
    pub temperature: f32,
    /// Token budget for the judge response.
    pub max_tokens: u32,
    /// Request timeout for judge calls, in seconds.
    pub timeout_seconds: u64,
    /// Allow the tool call through when the judge itself fails.
    /// Defaults to false: an unreachable judge blocks the call.
    pub fail_open: bool,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            model: "claude-3-5-sonnet-20241022".to_string(),
            base_url: None,
            api_key: None,
            probability_threshold: 0.7,
            temperature: 0.0,
            max_tokens: 1024,
            timeout_seconds: 30,
            fail_open: false,
        }
    }
}
