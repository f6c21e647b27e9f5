use crate::BackendProfile;
use catalog_lib::{CatalogError, CatalogResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CATALOG_DB_PATH: &str = "/opt/replica_catalog/var/replica_catalog.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    #[serde(alias = "db", alias = "database")]
    pub db_path: String,
    pub backend: BackendProfile,
    pub busy_timeout_ms: u64,
    /// Rows fetched per query when scanning large result sets.
    pub page_size: usize,
    /// Files per replica lookup query in list_replicas.
    pub predicate_chunk_size: usize,
    /// Files per delete statement batch.
    pub delete_chunk_size: usize,
    /// Cap on OBSOLETE rows returned by one candidate listing.
    pub obsolete_scan_limit: usize,
    /// BEING_DELETED rows become candidates again after this many seconds.
    #[serde(alias = "delay_seconds")]
    pub being_deleted_grace_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_CATALOG_DB_PATH.to_string(),
            backend: BackendProfile::default(),
            busy_timeout_ms: 5000,
            page_size: 1000,
            predicate_chunk_size: 50,
            delete_chunk_size: 10,
            obsolete_scan_limit: 10000,
            being_deleted_grace_secs: 0,
        }
    }
}

impl CatalogConfig {
    pub fn in_memory() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            ..Default::default()
        }
    }

    pub fn load_from_file(path: &Path) -> CatalogResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CatalogError::IoError(format!("read {} failed: {}", path.display(), e))
        })?;
        let config: CatalogConfig = serde_json::from_str(&content).map_err(|e| {
            CatalogError::InvalidInput(format!("parse {} failed: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CatalogResult<()> {
        if self.db_path.is_empty() {
            return Err(CatalogError::InvalidInput("db_path is empty".to_string()));
        }
        for (name, value) in [
            ("page_size", self.page_size),
            ("predicate_chunk_size", self.predicate_chunk_size),
            ("delete_chunk_size", self.delete_chunk_size),
        ] {
            if value == 0 {
                return Err(CatalogError::InvalidInput(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }
}
