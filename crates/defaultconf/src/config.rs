//! Configuration file support for defaultconf
//!
//! Loads and validates the daemon configuration from YAML.
//! Default location: /usr/local/etc/defaultconf.yaml

use crate::engine::EngineSettings;
use crate::error::{DefaultconfError, Result};
use crate::policy::{PriorityPolicy, PriorityRule};
use crate::selection::SelectionOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/defaultconf.yaml";

/// Tables the daemon must never manage: unspecified and local.
const RESERVED_TABLES: [u32; 2] = [0, 255];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Ordered priority rules, best first
    #[serde(default)]
    pub priority: Vec<PriorityRule>,

    /// Registration store (JSON)
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Daemon PID file, used to signal store changes
    #[serde(default = "default_pid_path")]
    pub pid_path: PathBuf,

    /// Routing table holding the managed default routes
    #[serde(default = "default_table", alias = "fib")]
    pub table: u32,

    /// Metric of installed default routes
    #[serde(default)]
    pub route_metric: u32,

    /// Interval of the full kernel resync
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Wait for a netlink reply before treating the channel as stalled
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Only select gateways that are on-link
    #[serde(default = "default_require_reachable_gateway")]
    pub require_reachable_gateway: bool,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/db/defaultconf.state")
}

fn default_pid_path() -> PathBuf {
    PathBuf::from("/var/run/defaultconf.pid")
}

fn default_table() -> u32 {
    254
}

fn default_resync_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    2000
}

fn default_require_reachable_gateway() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            priority: Vec::new(),
            state_path: default_state_path(),
            pid_path: default_pid_path(),
            table: default_table(),
            route_metric: 0,
            resync_interval_secs: default_resync_interval(),
            request_timeout_ms: default_request_timeout(),
            require_reachable_gateway: default_require_reachable_gateway(),
        }
    }
}

impl DaemonConfig {
    /// Parses and validates a YAML document. A written configuration must
    /// name at least one priority rule.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: DaemonConfig = serde_yaml::from_str(content)?;
        if config.priority.is_empty() {
            return Err(DefaultconfError::Config("priority list is empty".to_string()));
        }
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates the file at `path`, which must exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            DefaultconfError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&content).map_err(|e| {
            DefaultconfError::Config(format!(
                "Failed to load config file {}: {}",
                path.display(),
                e
            ))
        })?;
        info!(path = %path.display(), rules = config.priority.len(), "Loaded configuration");
        Ok(config)
    }

    /// Load configuration from file, falling back to defaults (no priority
    /// rules) if the file does not exist. A file that exists must validate.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Checks everything but the presence of rules, so the built-in
    /// defaults validate too.
    pub fn validate(&self) -> Result<()> {
        for (index, rule) in self.priority.iter().enumerate() {
            if let Some(link) = &rule.link {
                if link.is_empty() {
                    return Err(DefaultconfError::Config(format!(
                        "priority rule {} has an empty link name",
                        index
                    )));
                }
            }
            if let Some(earlier) = self.priority[..index]
                .iter()
                .position(|prev| rule.is_covered_by(prev))
            {
                return Err(DefaultconfError::Config(format!(
                    "priority rule {} {} can never match, rule {} {} matches first",
                    index, rule, earlier, self.priority[earlier]
                )));
            }
        }

        if RESERVED_TABLES.contains(&self.table) {
            return Err(DefaultconfError::Config(format!(
                "table {} is reserved",
                self.table
            )));
        }
        if self.resync_interval_secs == 0 {
            return Err(DefaultconfError::Config(
                "resync_interval_secs must be > 0".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(DefaultconfError::Config(
                "request_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.state_path.as_os_str().is_empty() || self.pid_path.as_os_str().is_empty() {
            return Err(DefaultconfError::Config(
                "state_path and pid_path must be set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn priority_policy(&self) -> PriorityPolicy {
        PriorityPolicy::new(self.priority.clone())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            table: self.table,
            metric: self.route_metric,
            selection: SelectionOptions {
                require_reachable_gateway: self.require_reachable_gateway,
            },
        }
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Lock file guarding the registration store
    pub fn lock_path(&self) -> PathBuf {
        let mut path = self.state_path.clone().into_os_string();
        path.push(".lock");
        PathBuf::from(path)
    }
}
