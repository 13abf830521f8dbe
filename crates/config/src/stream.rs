//! Streaming pipeline tunables.

use serde::Deserialize;

/// Default cap on recorded ingress/egress chunks per transaction.
const DEFAULT_CHUNK_BUFFER_CAP: usize = 512;

/// Streaming pipeline tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    /// Maximum seconds between policy keepalives before a streaming
    /// transaction is aborted with a policy timeout. Unset disables the
    /// timeout monitor entirely.
    pub policy_timeout_seconds: Option<f64>,
    /// Maximum ingress/egress chunks recorded per transaction before the
    /// recorder truncates.
    pub chunk_buffer_cap: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            policy_timeout_seconds: None,
            chunk_buffer_cap: DEFAULT_CHUNK_BUFFER_CAP,
        }
    }
}
