//! HTTP server configuration settings.

use std::net::SocketAddr;

use secrecy::SecretString;
use serde::Deserialize;

/// Default cap on ingress request bodies (2 MiB).
const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// HTTP server configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the server should listen on.
    pub listen_address: Option<SocketAddr>,
    /// Maximum accepted request body size in bytes. Over-limit requests
    /// are rejected with 413 before reaching the pipeline.
    pub max_body_bytes: usize,
    /// API key clients must present. Consumed by the authentication
    /// collaborator; the pipeline itself never reads it.
    pub api_key: Option<SecretString>,
    /// Admin key for management endpoints, same caveat.
    pub admin_key: Option<SecretString>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            api_key: None,
            admin_key: None,
        }
    }
}
