//! Durable store and pub/sub bus settings.

use serde::Deserialize;

/// Durable store and pub/sub bus settings.
///
/// Both URLs are optional: without a database the control plane still proxies
/// traffic but records nothing, and without a bus no live events are
/// published. Storage failures are never client-visible either way.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// PostgreSQL connection URL for the durable event store.
    pub database_url: Option<String>,
    /// Redis connection URL for the pub/sub bus.
    pub redis_url: Option<String>,
}
