//! Profile configuration.
//!
//! A profile is a YAML document providing engine options, connector
//! defaults, variable defaults and resilience overrides. The pipeline DSL
//! itself never carries environment-specific settings; those live here.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Engine-level execution knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Rows per batch when bridging connector streams into the engine.
    pub batch_size: usize,
    /// Row count above which mode handlers switch to the bulk columnar path.
    pub bulk_threshold: usize,
    /// Abort the whole run on the first failed operation. When false, only
    /// dependents of the failed operation are skipped.
    pub fail_fast: bool,
    /// Optional wall-clock budget per operation, in milliseconds.
    pub operation_timeout_ms: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            bulk_threshold: 10_000,
            fail_fast: true,
            operation_timeout_ms: None,
        }
    }
}

/// How substitution reacts to a variable that cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingVarPolicy {
    /// Raise a substitution error.
    Fail,
    /// Log a warning and use the context's fallback rendering.
    #[default]
    Warn,
    /// Silently use the fallback rendering.
    Ignore,
}

/// Simple-tier resilience knobs; each maps onto the full policy.
/// Absent fields keep the smart default for the connector kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceOverrides {
    pub retry_attempts: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub rate_limit_per_minute: Option<u32>,
    /// Full-tier policy; wins over the simple knobs above where set.
    pub full: Option<FullPolicyOverrides>,
}

/// Full-tier resilience configuration. Every parameter addressable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FullPolicyOverrides {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub max_delay_ms: Option<u64>,
    pub jitter: Option<bool>,
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub recovery_timeout_ms: Option<u64>,
    pub burst_size: Option<u32>,
    pub backpressure: Option<String>,
    pub max_queue_size: Option<usize>,
    pub max_recovery_attempts: Option<u32>,
}

/// Per-connector defaults from the profile: connection params merged under
/// the pipeline's `PARAMS { ... }`, plus resilience overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorDefaults {
    pub params: IndexMap<String, String>,
    pub resilience: Option<ResilienceOverrides>,
}

/// Parsed profile. The core consumes this structure; YAML parsing is the
/// only I/O this module does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub engine: EngineOptions,
    /// Directory holding durable state (watermarks). Created on demand.
    pub state_dir: PathBuf,
    /// Lowest-priority variable layer.
    pub variables: IndexMap<String, String>,
    /// Keyed by connector type name (`postgres`, `http`, ...).
    pub connectors: IndexMap<String, ConnectorDefaults>,
    /// Process-wide resilience overrides; per-connector entries win.
    pub resilience: Option<ResilienceOverrides>,
    pub on_missing_var: MissingVarPolicy,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            engine: EngineOptions::default(),
            state_dir: PathBuf::from(".sqlflow"),
            variables: IndexMap::new(),
            connectors: IndexMap::new(),
            resilience: None,
            on_missing_var: MissingVarPolicy::default(),
        }
    }
}

impl Profile {
    /// Resilience overrides for a connector type: the per-connector entry
    /// if present, else the profile-wide one.
    pub fn resilience_for(&self, connector_type: &str) -> Option<&ResilienceOverrides> {
        self.connectors
            .get(connector_type)
            .and_then(|c| c.resilience.as_ref())
            .or(self.resilience.as_ref())
    }
}

/// Loads a profile from a YAML file.
pub fn load_profile_from_path(path: impl AsRef<Path>) -> Result<Profile> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let profile: Profile = serde_yaml::from_str(&raw)?;
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_defaults() {
        let p = Profile::default();
        assert_eq!(p.engine.bulk_threshold, 10_000);
        assert!(p.engine.fail_fast);
        assert_eq!(p.on_missing_var, MissingVarPolicy::Warn);
    }

    #[test]
    fn test_profile_yaml_roundtrip() {
        let yaml = r#"
engine:
  batch_size: 500
  fail_fast: false
state_dir: /tmp/state
variables:
  region: eu
connectors:
  postgres:
    params:
      host: localhost
    resilience:
      retry_attempts: 5
"#;
        let p: Profile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(p.engine.batch_size, 500);
        assert!(!p.engine.fail_fast);
        assert_eq!(p.variables.get("region").unwrap(), "eu");
        assert_eq!(
            p.resilience_for("postgres").unwrap().retry_attempts,
            Some(5)
        );
        assert!(p.resilience_for("http").is_none());
    }
}
