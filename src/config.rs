//! TOML configuration for a testfleet controller instance.
//!
//! A layered model: compiled-in defaults, overridden section by section by a
//! TOML file found through the `--config` flag, the `TESTFLEET_CONFIG`
//! environment variable, or the standard system location.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::nodes::SelectionStrategy;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "TESTFLEET_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/testfleet/testfleet.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the controller process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub controller: InstanceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub quotas: QuotaConfig,
    #[serde(default)]
    pub trial: TrialConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ControllerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded controller configuration");
        Ok(config)
    }

    /// Resolve the configuration from, in order:
    /// 1. An explicit path (the `--config` flag). Failure to load it is an error.
    /// 2. The path in the `TESTFLEET_CONFIG` environment variable.
    /// 3. `/etc/testfleet/testfleet.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "TESTFLEET_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Controller identity
// ---------------------------------------------------------------------------

/// Identity of this controller instance within the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Instance id as registered in service discovery. Its host prefix
    /// (everything before the first `:`) identifies this instance.
    pub instance_id: String,
    /// Host/IP under which worker nodes see this controller. Keys the node
    /// ownership map.
    pub advertise_host: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            instance_id: "127.0.0.1:8080".to_string(),
            advertise_host: "127.0.0.1".to_string(),
        }
    }
}

impl InstanceConfig {
    /// Host prefix of the instance id.
    pub fn host_prefix(&self) -> &str {
        host_prefix(&self.instance_id)
    }
}

/// Host portion of an instance id such as `10.0.0.4:8080`.
pub fn host_prefix(instance_id: &str) -> &str {
    instance_id.split(':').next().unwrap_or(instance_id)
}

// ---------------------------------------------------------------------------
// Network / storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address and port for the HTTP API (user requests and relay endpoint).
    pub listen_address: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database shared by the controller instances.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/testfleet.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Knobs for the dispatch state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// TTL of the per-execution restart lock (seconds).
    pub lock_ttl_secs: u64,
    /// Upper bound on a single agent call during dispatch (seconds).
    pub agent_timeout_secs: u64,
    /// Strategy used when the execution does not name one.
    pub default_strategy: SelectionStrategy,
    /// Whether selected nodes must have a fresh heartbeat.
    pub require_live: bool,
    /// A node is live if it sent a heartbeat within this window (seconds).
    pub node_liveness_secs: u64,
    /// Characters of agent console output kept in a failure reason.
    pub console_tail_chars: usize,
    /// Interval of the pending-execution retry sweep (seconds). 0 disables it.
    pub retry_interval_secs: u64,
    /// Pending executions stop being retried after this many attempts.
    pub max_schedule_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 120,
            agent_timeout_secs: 60,
            default_strategy: SelectionStrategy::RoundRobin,
            require_live: true,
            node_liveness_secs: 30,
            console_tail_chars: 1000,
            retry_interval_secs: 30,
            max_schedule_attempts: 10,
        }
    }
}

impl DispatchConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Quotas / trial
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Maximum executions a tenant may have RUNNING at once.
    pub max_concurrent_executions: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 10,
        }
    }
}

/// Resource caps applied to trial executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialConfig {
    pub max_nodes: u32,
    pub max_threads: u32,
    pub max_iterations: u32,
    pub max_duration_secs: u64,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            max_nodes: 1,
            max_threads: 50,
            max_iterations: 1000,
            max_duration_secs: 600,
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// A sibling controller instance known to static service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInstance {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Sibling controller instances (may include this one; it is filtered out).
    pub peers: Vec<PeerInstance>,
    /// Timeout of one relay HTTP call (seconds).
    pub relay_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            relay_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = ControllerConfig::default();

        assert_eq!(cfg.network.listen_address, "0.0.0.0:8080");
        assert_eq!(cfg.storage.db_path, PathBuf::from("data/testfleet.db"));
        assert_eq!(cfg.dispatch.lock_ttl_secs, 120);
        assert_eq!(cfg.dispatch.lock_ttl(), Duration::from_secs(120));
        assert_eq!(cfg.dispatch.default_strategy, SelectionStrategy::RoundRobin);
        assert!(cfg.dispatch.require_live);
        assert_eq!(cfg.quotas.max_concurrent_executions, 10);
        assert_eq!(cfg.trial.max_nodes, 1);
        assert!(cfg.cluster.peers.is_empty());
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[controller]
instance_id = "10.0.0.4:8080"
advertise_host = "10.0.0.4"

[dispatch]
lock_ttl_secs = 60
agent_timeout_secs = 15
default_strategy = "idle_preferred"
require_live = false

[quotas]
max_concurrent_executions = 3

[trial]
max_threads = 20

[[cluster.peers]]
instance_id = "10.0.0.5:8080"
host = "10.0.0.5"
port = 8080

[logging]
level = "debug"
json = true
"#;

        let cfg: ControllerConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.controller.instance_id, "10.0.0.4:8080");
        assert_eq!(cfg.controller.host_prefix(), "10.0.0.4");
        assert_eq!(cfg.dispatch.lock_ttl_secs, 60);
        assert_eq!(cfg.dispatch.agent_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.dispatch.default_strategy, SelectionStrategy::IdlePreferred);
        assert!(!cfg.dispatch.require_live);
        // Unset keys in a present section keep their defaults.
        assert_eq!(cfg.dispatch.node_liveness_secs, 30);
        assert_eq!(cfg.quotas.max_concurrent_executions, 3);
        assert_eq!(cfg.trial.max_threads, 20);
        assert_eq!(cfg.trial.max_nodes, 1);
        assert_eq!(cfg.cluster.peers.len(), 1);
        assert_eq!(cfg.cluster.peers[0].port, 8080);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: ControllerConfig = toml::from_str("").unwrap();
        let defaults = ControllerConfig::default();

        assert_eq!(cfg.network.listen_address, defaults.network.listen_address);
        assert_eq!(cfg.dispatch.lock_ttl_secs, defaults.dispatch.lock_ttl_secs);
        assert_eq!(
            cfg.trial.max_duration_secs,
            defaults.trial.max_duration_secs
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("testfleet.toml");
        std::fs::write(
            &path,
            r#"
[network]
listen_address = "127.0.0.1:9999"
"#,
        )
        .unwrap();

        let cfg = ControllerConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.network.listen_address, "127.0.0.1:9999");
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        let result = ControllerConfig::resolve(Some(Path::new("/nonexistent/testfleet.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_host_prefix() {
        assert_eq!(host_prefix("10.1.2.3:8080"), "10.1.2.3");
        assert_eq!(host_prefix("controller-a"), "controller-a");
    }
}
