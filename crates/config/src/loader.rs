use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, bail};
use regex::Regex;
use secrecy::SecretString;
use serde::Deserialize;
use serde_yaml::Value;

use crate::{Config, PolicySource};

fn env_placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*env\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder regex is valid")
    })
}

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;

    load_str(&content)
}

pub fn load_str(content: &str) -> anyhow::Result<Config> {
    let mut raw: Value = serde_yaml::from_str(content).context("configuration is not valid YAML")?;

    expand_dynamic_strings(&mut Vec::new(), &mut raw)?;

    let mut config = Config::deserialize(raw).context("configuration does not match the expected schema")?;
    apply_env_overrides(&mut config)?;

    Ok(config)
}

/// Replace `{{ env.VAR }}` placeholders inside string values, keeping a path
/// trail so errors point at the offending key.
fn expand_dynamic_strings(path: &mut Vec<String>, value: &mut Value) -> anyhow::Result<()> {
    match value {
        Value::String(s) => {
            if env_placeholder().is_match(s) {
                *s = expand_string(s).with_context(|| format!("in configuration key `{}`", path.join(".")))?;
            }
        }
        Value::Mapping(mapping) => {
            for (key, inner) in mapping.iter_mut() {
                let segment = key.as_str().unwrap_or("?").to_string();
                path.push(segment);
                expand_dynamic_strings(path, inner)?;
                path.pop();
            }
        }
        Value::Sequence(items) => {
            for (index, inner) in items.iter_mut().enumerate() {
                path.push(index.to_string());
                expand_dynamic_strings(path, inner)?;
                path.pop();
            }
        }
        _ => {}
    }

    Ok(())
}

fn expand_string(input: &str) -> anyhow::Result<String> {
    let mut output = String::with_capacity(input.len());
    let mut last_end = 0;

    for capture in env_placeholder().captures_iter(input) {
        let full = capture.get(0).expect("capture group 0 always exists");
        let name = &capture[1];

        let Ok(value) = std::env::var(name) else {
            bail!("environment variable `{name}` referenced in configuration is not set");
        };

        output.push_str(&input[last_end..full.start()]);
        output.push_str(&value);
        last_end = full.end();
    }

    output.push_str(&input[last_end..]);
    Ok(output)
}

/// Well-known environment variables override their file counterparts.
fn apply_env_overrides(config: &mut Config) -> anyhow::Result<()> {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.storage.database_url = Some(url);
    }

    if let Ok(url) = std::env::var("REDIS_URL") {
        config.storage.redis_url = Some(url);
    }

    if let Ok(key) = std::env::var("LUTHIEN_API_KEY") {
        config.server.api_key = Some(SecretString::from(key));
    }

    if let Ok(key) = std::env::var("LUTHIEN_ADMIN_KEY") {
        config.server.admin_key = Some(SecretString::from(key));
    }

    if let Ok(url) = std::env::var("LUTHIEN_UPSTREAM_BASE_URL") {
        config.upstream.base_url = Some(url);
    }

    if let Ok(key) = std::env::var("LUTHIEN_UPSTREAM_API_KEY") {
        config.upstream.api_key = Some(SecretString::from(key));
    }

    if let Ok(source) = std::env::var("LUTHIEN_POLICY_SOURCE") {
        config.policy_source = PolicySource::parse(&source)
            .with_context(|| format!("invalid LUTHIEN_POLICY_SOURCE value `{source}`"))?;
    }

    if let Ok(seconds) = std::env::var("LUTHIEN_STREAM_TIMEOUT_SECONDS") {
        let parsed: f64 = seconds
            .parse()
            .with_context(|| format!("invalid LUTHIEN_STREAM_TIMEOUT_SECONDS value `{seconds}`"))?;
        config.stream.policy_timeout_seconds = Some(parsed);
    }

    if let Ok(cap) = std::env::var("LUTHIEN_CHUNK_BUFFER_CAP") {
        config.stream.chunk_buffer_cap = cap
            .parse()
            .with_context(|| format!("invalid LUTHIEN_CHUNK_BUFFER_CAP value `{cap}`"))?;
    }

    Ok(())
}
