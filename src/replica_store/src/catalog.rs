use crate::{CatalogConfig, LockCallbacks, NoopLockCallbacks, ReplicaCatalogDB};
use catalog_lib::{
    CatalogResult, ProtocolFactory, RseInfo, RseRegistry, StandardProtocolFactory,
};
use log::info;
use std::collections::HashMap;
use std::sync::Arc;

/// Entry point of the replica catalog. Operations are grouped by concern in
/// the sibling modules and all run against one [`ReplicaCatalogDB`].
pub struct ReplicaCatalog {
    pub(crate) db: Arc<ReplicaCatalogDB>,
    pub(crate) rses: Arc<dyn RseRegistry>,
    pub(crate) protocols: Arc<dyn ProtocolFactory>,
    pub(crate) locks: Arc<dyn LockCallbacks>,
    pub(crate) config: CatalogConfig,
}

impl ReplicaCatalog {
    pub fn open(config: CatalogConfig, rses: Arc<dyn RseRegistry>) -> CatalogResult<Self> {
        config.validate()?;
        if config.db_path != ":memory:" {
            if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let db = ReplicaCatalogDB::new(
            config.db_path.clone(),
            config.backend,
            config.busy_timeout_ms,
        )?;
        info!(
            "ReplicaCatalog: opened catalog at {} ({:?})",
            config.db_path, config.backend.dialect
        );
        Ok(Self {
            db: Arc::new(db),
            rses,
            protocols: Arc::new(StandardProtocolFactory),
            locks: Arc::new(NoopLockCallbacks),
            config,
        })
    }

    pub fn with_protocol_factory(mut self, protocols: Arc<dyn ProtocolFactory>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn with_lock_callbacks(mut self, locks: Arc<dyn LockCallbacks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<ReplicaCatalogDB> {
        &self.db
    }

    pub fn rse_registry(&self) -> &Arc<dyn RseRegistry> {
        &self.rses
    }

    pub(crate) fn rse_info(&self, rse: &str) -> CatalogResult<RseInfo> {
        self.rses.get_rse_info(rse)
    }

    pub(crate) fn rse_id(&self, rse: &str) -> CatalogResult<String> {
        Ok(self.rses.get_rse_info(rse)?.id)
    }

    /// Resolves site names, keyed by name, failing on the first unknown one.
    pub(crate) fn rse_ids<'a, I>(&self, names: I) -> CatalogResult<HashMap<String, String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut ids = HashMap::new();
        for name in names {
            if !ids.contains_key(name) {
                ids.insert(name.to_string(), self.rse_id(name)?);
            }
        }
        Ok(ids)
    }

    /// Site name for an id, memoized in `cache` for the duration of one call.
    pub(crate) fn rse_name_cached(
        &self,
        cache: &mut HashMap<String, Option<String>>,
        rse_id: &str,
    ) -> Option<String> {
        cache
            .entry(rse_id.to_string())
            .or_insert_with(|| self.rses.get_rse_info_by_id(rse_id).ok().map(|r| r.name))
            .clone()
    }
}
