use catalog_lib::{CatalogError, CatalogResult, ShardSpec};
use replica_store::CatalogConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::PassPolicy;

pub const DEFAULT_CATALOG_DAEMON_CONFIG_PATH: &str = "/opt/replica_catalog/etc/catalog_daemon.json";
pub const DEFAULT_RSE_CONFIG_PATH: &str = "/opt/replica_catalog/etc/rses.json";

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    #[serde(alias = "interval")]
    pub interval_secs: u64,
    #[serde(alias = "max_run_time")]
    pub max_run_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_run_secs: 30,
        }
    }
}

impl PolicyConfig {
    pub fn to_policy(self) -> PassPolicy {
        PassPolicy::new(
            Duration::from_secs(self.interval_secs),
            Duration::from_secs(self.max_run_secs),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogDaemonConfig {
    pub catalog: CatalogConfig,
    #[serde(alias = "rses", alias = "rse_config")]
    pub rse_config_path: PathBuf,
    /// 1-based; 0 disables sharding.
    #[serde(alias = "worker")]
    pub worker_number: u32,
    #[serde(alias = "workers")]
    pub total_workers: u32,
    pub poll_interval_ms: u64,
    pub necromancer: PolicyConfig,
    /// Bad declarations reconciled per necromancer pass.
    #[serde(alias = "bulk")]
    pub necromancer_limit: usize,
    pub capacity_report: PolicyConfig,
    /// Sites covered by the capacity report pass.
    #[serde(alias = "report_sites")]
    pub report_rses: Vec<String>,
    /// Candidate listing cap used when counting deletable replicas.
    pub report_candidate_limit: usize,
}

impl Default for CatalogDaemonConfig {
    fn default() -> Self {
        Self {
            catalog: CatalogConfig::default(),
            rse_config_path: PathBuf::from(DEFAULT_RSE_CONFIG_PATH),
            worker_number: 0,
            total_workers: 0,
            poll_interval_ms: 1000,
            necromancer: PolicyConfig::default(),
            necromancer_limit: 1000,
            capacity_report: PolicyConfig {
                interval_secs: 300,
                max_run_secs: 60,
            },
            report_rses: Vec::new(),
            report_candidate_limit: 10000,
        }
    }
}

impl CatalogDaemonConfig {
    pub fn load_from_file(path: &Path) -> CatalogResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CatalogError::IoError(format!("read {} failed: {}", path.display(), e))
        })?;
        Self::from_json(&content)
            .map_err(|e| CatalogError::InvalidInput(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(content: &str) -> CatalogResult<Self> {
        let config: CatalogDaemonConfig = serde_json::from_str(content)
            .map_err(|e| CatalogError::InvalidInput(format!("parse config failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CatalogResult<()> {
        self.catalog.validate()?;
        if self.worker_number > self.total_workers {
            return Err(CatalogError::InvalidInput(format!(
                "worker_number {} exceeds total_workers {}",
                self.worker_number, self.total_workers
            )));
        }
        if self.necromancer_limit == 0 {
            return Err(CatalogError::InvalidInput(
                "necromancer_limit must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shard(&self) -> ShardSpec {
        ShardSpec::new(self.worker_number, self.total_workers)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
