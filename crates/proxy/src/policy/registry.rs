//! Resolves policy class references to constructed instances.

use std::sync::Arc;

use anyhow::{Context, bail};
use config::JudgeConfig;
use serde_json::Value;

use crate::policies::{
    AllCapsPolicy, DogfoodSafetyConfig, DogfoodSafetyPolicy, NoOpPolicy, StringReplacementConfig,
    StringReplacementPolicy, ToolCallJudgePolicy,
};
use crate::policy::Policy;

/// Known policy class names, for error messages.
const KNOWN_POLICIES: &[&str] = &[
    "NoOpPolicy",
    "AllCapsPolicy",
    "StringReplacementPolicy",
    "ToolCallJudgePolicy",
    "DogfoodSafetyPolicy",
];

/// Build a policy from a `module:Class` reference and its config payload.
///
/// Only the class segment selects the implementation; the module path is
/// carried for config compatibility and ignored.
pub fn build_policy(class_ref: &str, config: &Value, judge: Option<&JudgeConfig>) -> anyhow::Result<Arc<dyn Policy>> {
    let class = class_ref
        .rsplit([':', '.'])
        .next()
        .filter(|segment| !segment.is_empty())
        .with_context(|| format!("invalid policy class reference '{class_ref}'"))?;

    let policy: Arc<dyn Policy> = match class {
        "NoOpPolicy" => Arc::new(NoOpPolicy),
        "AllCapsPolicy" => Arc::new(AllCapsPolicy),
        "StringReplacementPolicy" => {
            let config: StringReplacementConfig = serde_json::from_value(config.clone())
                .context("invalid StringReplacementPolicy config")?;
            Arc::new(StringReplacementPolicy::new(config))
        }
        "ToolCallJudgePolicy" => {
            let mut judge = judge
                .cloned()
                .context("ToolCallJudgePolicy requires a [judge] configuration block")?;

            // The policy record may override judge tunables.
            if let Some(threshold) = config.get("probability_threshold").and_then(Value::as_f64) {
                judge.probability_threshold = threshold;
            }
            if let Some(fail_open) = config.get("fail_open").and_then(Value::as_bool) {
                judge.fail_open = fail_open;
            }

            Arc::new(ToolCallJudgePolicy::new(judge).map_err(|error| anyhow::anyhow!("{error}"))?)
        }
        "DogfoodSafetyPolicy" => {
            let config: DogfoodSafetyConfig =
                serde_json::from_value(config.clone()).context("invalid DogfoodSafetyPolicy config")?;
            Arc::new(DogfoodSafetyPolicy::new(config).map_err(|error| anyhow::anyhow!("{error}"))?)
        }
        other => bail!(
            "unknown policy class '{other}'. Known policies: {}. \
             Check that the policy class reference is correct and that the \
             policy's crate is compiled into this build.",
            KNOWN_POLICIES.join(", ")
        ),
    };

    Ok(policy)
}
