//! Active policy reference and resolution settings.

use serde::Deserialize;

/// A policy record: class reference plus its configuration payload.
///
/// The same shape lives in the `policy_config` table when policies are
/// resolved from the durable store.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// Class reference in `module:Class` form,
    /// e.g. `luthien.policies:ToolCallJudgePolicy`.
    pub class: String,
    /// Free-form configuration passed to the policy constructor.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Where the active policy record is resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PolicySource {
    /// Only the `policy_config` table.
    Db,
    /// Only the configuration file.
    #[default]
    File,
    /// The table first, falling back to the file when no active row exists.
    DbFallbackFile,
    /// The file first, falling back to the table when the file has no policy.
    FileFallbackDb,
}

impl PolicySource {
    /// Parse the `LUTHIEN_POLICY_SOURCE` environment value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "db" => Some(Self::Db),
            "file" => Some(Self::File),
            "db-fallback-file" => Some(Self::DbFallbackFile),
            "file-fallback-db" => Some(Self::FileFallbackDb),
            _ => None,
        }
    }
}
