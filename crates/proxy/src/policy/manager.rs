//! The active-policy handle and hot swap.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, bail};
use config::{Config, JudgeConfig, PolicyConfig, PolicySource};
use serde_json::Value;
use storage::{Database, EventBus};

use crate::policy::Policy;
use crate::policy::registry;

/// How long a policy swap may hold the distributed lock.
const POLICY_LOCK_TTL: Duration = Duration::from_secs(30);

/// Summary of the active policy, for introspection.
#[derive(Debug, Clone)]
pub struct PolicyInfo {
    pub class_ref: String,
    pub config: Value,
}

/// Holds the single atomic reference to the active policy and performs
/// validated hot swaps under the distributed bus lock.
pub struct PolicyManager {
    active: RwLock<ActivePolicy>,
    source: PolicySource,
    judge: Option<JudgeConfig>,
    db: Option<Database>,
    bus: Option<EventBus>,
}

struct ActivePolicy {
    policy: Arc<dyn Policy>,
    info: PolicyInfo,
}

impl PolicyManager {
    /// Resolve and construct the initial policy per the configured source
    /// mode. With no policy configured anywhere, traffic passes through a
    /// no-op policy.
    pub async fn initialize(
        config: &Config,
        db: Option<Database>,
        bus: Option<EventBus>,
    ) -> anyhow::Result<Self> {
        let record = resolve_policy_record(config, db.as_ref()).await?;

        let (class_ref, payload) = match record {
            Some(record) => (record.class, record.config),
            None => ("luthien.policies:NoOpPolicy".to_string(), Value::Null),
        };

        let policy = registry::build_policy(&class_ref, &payload, config.judge.as_ref())
            .with_context(|| format!("failed to construct policy '{class_ref}'"))?;

        log::info!("active policy: {} ({class_ref})", policy.name());

        Ok(Self {
            active: RwLock::new(ActivePolicy {
                policy,
                info: PolicyInfo {
                    class_ref,
                    config: payload,
                },
            }),
            source: config.policy_source,
            judge: config.judge.clone(),
            db,
            bus,
        })
    }

    /// Snapshot of the active policy for one transaction. The snapshot stays
    /// valid for the whole transaction even if a swap lands mid-stream.
    pub fn current(&self) -> Arc<dyn Policy> {
        Arc::clone(&self.active.read().unwrap_or_else(PoisonError::into_inner).policy)
    }

    /// Description of the active policy.
    pub fn current_info(&self) -> PolicyInfo {
        self.active.read().unwrap_or_else(PoisonError::into_inner).info.clone()
    }

    /// Validate, persist, and atomically activate a new policy.
    ///
    /// At most one change is in flight across all instances: the bus lock is
    /// taken first and released last. The outgoing policy's session-end hook
    /// runs even when persistence fails.
    pub async fn enable_policy(
        &self,
        class_ref: &str,
        config_payload: Value,
        enabled_by: &str,
    ) -> anyhow::Result<PolicyInfo> {
        let lock = match &self.bus {
            Some(bus) => match bus.acquire_policy_lock(POLICY_LOCK_TTL).await? {
                Some(guard) => Some(guard),
                None => bail!("another policy change is already in flight"),
            },
            None => None,
        };

        let result = self.swap_policy(class_ref, config_payload, enabled_by).await;

        if let Some(guard) = lock
            && let Err(error) = guard.release().await
        {
            log::error!("failed to release policy lock: {error:#}");
        }

        result
    }

    async fn swap_policy(
        &self,
        class_ref: &str,
        config_payload: Value,
        enabled_by: &str,
    ) -> anyhow::Result<PolicyInfo> {
        let policy = registry::build_policy(class_ref, &config_payload, self.judge.as_ref())
            .with_context(|| format!("failed to construct policy '{class_ref}'"))?;

        let persist_result = match (&self.db, self.source) {
            (Some(db), PolicySource::Db | PolicySource::DbFallbackFile | PolicySource::FileFallbackDb) => db
                .activate_policy_config(class_ref, &config_payload, enabled_by)
                .await
                .context("failed to persist policy record"),
            _ => Ok(()),
        };

        let info = PolicyInfo {
            class_ref: class_ref.to_string(),
            config: config_payload,
        };

        let outgoing = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            let outgoing = Arc::clone(&active.policy);
            active.policy = policy;
            active.info = info.clone();
            outgoing
        };

        // Session-end hook on the replaced policy, whatever else happened.
        outgoing.on_deactivate().await;

        persist_result?;
        log::info!("policy swapped to {class_ref} by {enabled_by}");

        Ok(info)
    }
}

async fn resolve_policy_record(config: &Config, db: Option<&Database>) -> anyhow::Result<Option<PolicyConfig>> {
    let from_file = || config.policy.clone();

    let from_db = || async {
        let Some(db) = db else {
            return anyhow::Ok(None);
        };

        Ok(db.active_policy_config().await?.map(|row| PolicyConfig {
            class: row.policy_class_ref,
            config: row.config,
        }))
    };

    match config.policy_source {
        PolicySource::File => Ok(from_file()),
        PolicySource::Db => {
            let record = from_db().await?;
            if record.is_none() {
                bail!("policy_source is 'db' but no active policy_config row exists");
            }
            Ok(record)
        }
        PolicySource::DbFallbackFile => match from_db().await? {
            Some(record) => Ok(Some(record)),
            None => Ok(from_file()),
        },
        PolicySource::FileFallbackDb => match from_file() {
            Some(record) => Ok(Some(record)),
            None => from_db().await,
        },
    }
}
