//! Deployment and Switchboard configuration, loadable from YAML or
//! environment variables. Follows the teacher's `config::loader` precedence
//! pattern (file, then environment overrides, then defaults) but scoped to
//! this crate's narrower surface.

use crate::error::{Result, SwitchboardError};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, warn};

/// Immutable per-deployment configuration. Corresponds to spec.md's
/// "Deployment (configuration, immutable after construction)".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentDefinition {
    /// Unique identifier; primary key within a Switchboard.
    pub name: String,
    pub api_base: String,
    pub api_key: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 0 means unlimited.
    #[serde(default)]
    pub tpm_ratelimit: u64,
    /// 0 means unlimited.
    #[serde(default)]
    pub rpm_ratelimit: u64,
    #[serde(default = "default_healthcheck_interval_secs")]
    pub healthcheck_interval_secs: u64,
    #[serde(default = "default_cooldown_period_secs")]
    pub cooldown_period_secs: u64,
}

fn default_api_version() -> String {
    "2024-02-01".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_healthcheck_interval_secs() -> u64 {
    10
}
fn default_cooldown_period_secs() -> u64 {
    10
}

impl DeploymentDefinition {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cooldown_period(&self) -> Duration {
        Duration::from_secs(self.cooldown_period_secs)
    }

    /// Override `api_key`/`api_base` from `AZURE_OPENAI_KEY`/`AZURE_API_KEY`
    /// and `AZURE_OPENAI_ENDPOINT`/`AZURE_ENDPOINT` when the config value is
    /// empty, mirroring `AzureConfig::get_effective_api_key`.
    pub fn with_env_overrides(mut self) -> Self {
        if self.api_key.is_empty() {
            if let Ok(key) = env::var("AZURE_OPENAI_KEY").or_else(|_| env::var("AZURE_API_KEY")) {
                self.api_key = key;
            }
        }
        if self.api_base.is_empty() {
            if let Ok(endpoint) =
                env::var("AZURE_OPENAI_ENDPOINT").or_else(|_| env::var("AZURE_ENDPOINT"))
            {
                self.api_base = endpoint;
            }
        }
        self
    }
}

/// Constructor parameters for [`crate::switchboard::Switchboard`]. Mirrors
/// spec.md §6's facade signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    pub deployments: Vec<DeploymentDefinition>,
    #[serde(default = "default_healthcheck_interval_secs")]
    pub healthcheck_interval_secs: u64,
    /// 0 disables the usage-reset loop; counters accumulate without reset.
    #[serde(default = "default_ratelimit_window_secs")]
    pub ratelimit_window_secs: u64,
    #[serde(default = "default_session_capacity")]
    pub session_capacity: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_ratelimit_window_secs() -> u64 {
    60
}
fn default_session_capacity() -> usize {
    1024
}
fn default_max_attempts() -> u32 {
    3
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            deployments: Vec::new(),
            healthcheck_interval_secs: default_healthcheck_interval_secs(),
            ratelimit_window_secs: default_ratelimit_window_secs(),
            session_capacity: default_session_capacity(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl SwitchboardConfig {
    /// Load from a YAML file, following the teacher's `serde_yaml`-based
    /// loader rather than the unused `config` crate.
    pub fn from_yaml_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SwitchboardError::Config(format!("failed to read {path}: {e}")))?;
        let mut config: Self = serde_yaml::from_str(&content)
            .map_err(|e| SwitchboardError::Config(format!("failed to parse {path}: {e}")))?;
        config.deployments = config
            .deployments
            .into_iter()
            .map(DeploymentDefinition::with_env_overrides)
            .collect();
        debug!(path, deployments = config.deployments.len(), "loaded switchboard config from file");
        Ok(config)
    }

    /// Load deployments from `SWITCHBOARD_DEPLOYMENT_<NAME>_<FIELD>`
    /// environment variables, following `load_providers_from_env`'s
    /// `PROVIDER_<NAME>_<FIELD>` convention.
    pub fn deployments_from_env() -> Result<Vec<DeploymentDefinition>> {
        use std::collections::HashMap;

        let mut by_name: HashMap<String, HashMap<String, String>> = HashMap::new();
        for (key, value) in env::vars() {
            let Some(rest) = key.strip_prefix("SWITCHBOARD_DEPLOYMENT_") else {
                continue;
            };
            let Some((name, field)) = rest.split_once('_') else {
                continue;
            };
            by_name
                .entry(name.to_lowercase())
                .or_default()
                .insert(field.to_lowercase(), value);
        }

        let mut deployments = Vec::new();
        for (name, fields) in by_name {
            let api_base = fields.get("api_base").cloned().unwrap_or_default();
            let api_key = fields.get("api_key").cloned().unwrap_or_default();
            deployments.push(DeploymentDefinition {
                name,
                api_base,
                api_key,
                api_version: fields
                    .get("api_version")
                    .cloned()
                    .unwrap_or_else(default_api_version),
                timeout_secs: fields
                    .get("timeout_secs")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_timeout_secs),
                tpm_ratelimit: fields.get("tpm_ratelimit").and_then(|v| v.parse().ok()).unwrap_or(0),
                rpm_ratelimit: fields.get("rpm_ratelimit").and_then(|v| v.parse().ok()).unwrap_or(0),
                healthcheck_interval_secs: fields
                    .get("healthcheck_interval_secs")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_healthcheck_interval_secs),
                cooldown_period_secs: fields
                    .get("cooldown_period_secs")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_cooldown_period_secs),
            }
            .with_env_overrides());
        }

        if deployments.is_empty() {
            warn!("no deployments configured via SWITCHBOARD_DEPLOYMENT_* environment variables");
        }

        Ok(deployments)
    }
}
