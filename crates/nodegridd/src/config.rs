//! nodegridd.toml configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_LOG_FILTER: &str = "info,nodegridd=debug,nodegrid=debug";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Directory holding the state database.
    pub data_dir: PathBuf,
    pub replica_id: String,
    /// Enables the pending-event relay on non-leader replicas.
    pub distributed: bool,
    /// Static leadership verdict for runs without an external election.
    pub leader: bool,
    /// Event-dispatch shards.
    pub workers: usize,
    pub sweep_interval_ms: u64,
    pub excluded_hosts: Vec<String>,
    pub log_filter: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/nodegrid"),
            replica_id: "rm-1".to_string(),
            distributed: false,
            leader: true,
            workers: 8,
            sweep_interval_ms: 1000,
            excluded_hosts: Vec::new(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub data_dir: Option<PathBuf>,
    pub replica_id: Option<String>,
    pub distributed: Option<bool>,
    pub leader: Option<bool>,
    pub workers: Option<usize>,
    pub excluded_hosts: Vec<String>,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(data_dir) = overrides.data_dir {
            self.data_dir = data_dir;
        }
        if let Some(replica_id) = overrides.replica_id {
            self.replica_id = replica_id;
        }
        if let Some(distributed) = overrides.distributed {
            self.distributed = distributed;
        }
        if let Some(leader) = overrides.leader {
            self.leader = leader;
        }
        if let Some(workers) = overrides.workers {
            self.workers = workers;
        }
        for host in overrides.excluded_hosts {
            if !self.excluded_hosts.contains(&host) {
                self.excluded_hosts.push(host);
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.sweep_interval_ms == 0 {
            anyhow::bail!("sweep_interval_ms must be positive");
        }
        if self.replica_id.trim().is_empty() {
            anyhow::bail!("replica_id must not be empty");
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("nodegrid.redb")
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
