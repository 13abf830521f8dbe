//! Luthien configuration structures to map the luthien.yaml configuration.

#![deny(missing_docs)]

mod judge;
mod loader;
mod policy;
mod server;
mod storage;
mod stream;
mod upstream;

use std::path::Path;

pub use judge::JudgeConfig;
pub use policy::{PolicyConfig, PolicySource};
use serde::Deserialize;
pub use server::ServerConfig;
pub use storage::StorageConfig;
pub use stream::StreamConfig;
pub use upstream::{UpstreamConfig, UpstreamKind};

/// Main configuration structure for the Luthien control plane.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    pub server: ServerConfig,
    /// Backend LLM provider the proxy forwards traffic to.
    pub upstream: UpstreamConfig,
    /// Durable store and pub/sub bus settings.
    pub storage: StorageConfig,
    /// Streaming pipeline tunables.
    pub stream: StreamConfig,
    /// Active policy reference and its configuration payload.
    pub policy: Option<PolicyConfig>,
    /// Where the active policy record is resolved from.
    pub policy_source: PolicySource,
    /// Judge LLM used by policies that evaluate tool calls.
    pub judge: Option<JudgeConfig>,
}

impl Config {
    /// Load configuration from a YAML file path.
    ///
    /// `{{ env.VAR }}` placeholders in string values are expanded before
    /// deserialization, and well-known environment variables override their
    /// file counterparts afterwards.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Load configuration from a YAML string, applying the same expansion
    /// and environment overrides as [`Config::load`].
    pub fn from_yaml(content: &str) -> anyhow::Result<Config> {
        loader::load_str(content)
    }
}
