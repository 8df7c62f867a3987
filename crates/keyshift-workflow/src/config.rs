//! Engine configuration
//!
//! ```yaml
//! control_database: _vt
//! rpc_timeout_ms: ${KEYSHIFT_RPC_TIMEOUT_MS:-30000}
//! sql_mode: NO_AUTO_VALUE_ON_ZERO
//! lookup_workflow_suffix: _vdx
//! ```

use crate::error::{Result, WorkflowError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Workflow engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct EngineConfig {
    /// Database holding the `vreplication` and `resharding_journal` tables
    #[serde(default = "default_control_database")]
    #[validate(length(min = 1))]
    pub control_database: String,

    /// Deadline for each outbound topology or tablet call
    #[serde(default = "default_rpc_timeout_ms")]
    #[validate(range(min = 1, max = 3_600_000))]
    pub rpc_timeout_ms: u64,

    /// sql_mode sent with schema changes
    #[serde(default = "default_sql_mode")]
    pub sql_mode: String,

    /// Suffix of lookup backfill workflow names
    #[serde(default = "default_lookup_workflow_suffix")]
    #[validate(length(min = 1))]
    pub lookup_workflow_suffix: String,

    #[serde(default = "default_target_time_zone")]
    #[validate(length(min = 1))]
    pub default_target_time_zone: String,

    /// Datetime literal converted by the time zone check
    #[serde(default = "default_time_zone_sample")]
    pub time_zone_sample: String,

    /// Row throttle written into new streams
    #[serde(default = "default_throttle")]
    #[validate(range(min = 1))]
    pub max_stream_tps: i64,

    /// Replication lag ceiling written into new streams
    #[serde(default = "default_throttle")]
    #[validate(range(min = 1))]
    pub max_replication_lag: i64,
}

fn default_control_database() -> String {
    "_vt".to_string()
}

fn default_rpc_timeout_ms() -> u64 {
    30_000
}

fn default_sql_mode() -> String {
    "NO_AUTO_VALUE_ON_ZERO".to_string()
}

fn default_lookup_workflow_suffix() -> String {
    "_vdx".to_string()
}

fn default_target_time_zone() -> String {
    "UTC".to_string()
}

fn default_time_zone_sample() -> String {
    "2006-01-02 15:04:05".to_string()
}

fn default_throttle() -> i64 {
    i64::MAX
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_database: default_control_database(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            sql_mode: default_sql_mode(),
            lookup_workflow_suffix: default_lookup_workflow_suffix(),
            default_target_time_zone: default_target_time_zone(),
            time_zone_sample: default_time_zone_sample(),
            max_stream_tps: default_throttle(),
            max_replication_lag: default_throttle(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WorkflowError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML, expanding environment variables
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| WorkflowError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Fully qualified replication control table
    pub fn vreplication_table(&self) -> String {
        format!("{}.vreplication", self.control_database)
    }

    /// Fully qualified resharding journal table
    pub fn journal_table(&self) -> String {
        format!("{}.resharding_journal", self.control_database)
    }
}

/// Builder for [`EngineConfig`]
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn control_database(mut self, database: impl Into<String>) -> Self {
        self.config.control_database = database.into();
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn sql_mode(mut self, sql_mode: impl Into<String>) -> Self {
        self.config.sql_mode = sql_mode.into();
        self
    }

    pub fn lookup_workflow_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.lookup_workflow_suffix = suffix.into();
        self
    }

    pub fn default_target_time_zone(mut self, zone: impl Into<String>) -> Self {
        self.config.default_target_time_zone = zone.into();
        self
    }

    pub fn max_stream_tps(mut self, tps: i64) -> Self {
        self.config.max_stream_tps = tps;
        self
    }

    pub fn max_replication_lag(mut self, lag: i64) -> Self {
        self.config.max_replication_lag = lag;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
