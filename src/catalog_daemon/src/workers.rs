use async_trait::async_trait;
use catalog_lib::{CatalogError, CatalogResult, ShardSpec};
use log::{debug, info};
use replica_store::{BeingDeletedSummary, CandidateQuery, ReplicaCatalog};
use std::sync::Arc;

use crate::scheduler::{PassExecutor, PassKind, PassTask, ALL_RSES};
use crate::config::CatalogDaemonConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NecromancerStats {
    pub rses: usize,
    pub declarations: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapacityReport {
    pub being_deleted: BeingDeletedSummary,
    pub candidates: usize,
    pub candidate_bytes: u64,
}

/// Runs the periodic catalog passes against one [`ReplicaCatalog`].
pub struct CatalogWorkers {
    catalog: Arc<ReplicaCatalog>,
    necromancer_limit: usize,
    report_candidate_limit: usize,
    shard: ShardSpec,
}

impl CatalogWorkers {
    pub fn new(catalog: Arc<ReplicaCatalog>, config: &CatalogDaemonConfig) -> Self {
        Self {
            catalog,
            necromancer_limit: config.necromancer_limit,
            report_candidate_limit: config.report_candidate_limit,
            shard: config.shard(),
        }
    }

    /// Reconciles open BAD declarations with the current replica states.
    pub fn run_necromancer(&self) -> CatalogResult<NecromancerStats> {
        let history = self
            .catalog
            .list_bad_replicas_history(self.necromancer_limit, &self.shard)?;
        let mut stats = NecromancerStats::default();
        for (rse_id, dids) in history.iter() {
            debug!(
                "CatalogWorkers: reconciling {} bad declarations at {}",
                dids.len(),
                rse_id
            );
            self.catalog.update_bad_replicas_history(dids, rse_id)?;
            stats.rses += 1;
            stats.declarations += dids.len();
        }
        info!(
            "CatalogWorkers: necromancer pass reconciled {} declarations over {} rses",
            stats.declarations, stats.rses
        );
        Ok(stats)
    }

    pub fn report_capacity(&self, rse: &str) -> CatalogResult<CapacityReport> {
        let being_deleted = self.catalog.get_sum_count_being_deleted(rse)?;
        let query = CandidateQuery {
            shard: self.shard,
            ..CandidateQuery::new(self.report_candidate_limit)
        };
        let candidates = self.catalog.list_unlocked_replicas(rse, &query)?;
        let report = CapacityReport {
            being_deleted,
            candidates: candidates.len(),
            candidate_bytes: candidates.iter().map(|c| c.bytes).sum(),
        };
        info!(
            "CatalogWorkers: {} has {} replicas being deleted ({} bytes), {} candidates ({} bytes)",
            rse,
            report.being_deleted.total,
            report.being_deleted.bytes,
            report.candidates,
            report.candidate_bytes
        );
        Ok(report)
    }

    fn run_task(&self, task: &PassTask) -> CatalogResult<()> {
        match task.kind {
            PassKind::Necromancer => self.run_necromancer().map(|_| ()),
            PassKind::CapacityReport => {
                if task.target == ALL_RSES {
                    return Err(CatalogError::InvalidInput(
                        "capacity report needs a site".to_string(),
                    ));
                }
                self.report_capacity(&task.target).map(|_| ())
            }
        }
    }
}

/// Store calls block on the sqlite connection, so every task is moved off
/// the async workers.
pub struct BlockingExecutor {
    workers: Arc<CatalogWorkers>,
}

impl BlockingExecutor {
    pub fn new(workers: Arc<CatalogWorkers>) -> Self {
        Self { workers }
    }
}

#[async_trait]
impl PassExecutor for BlockingExecutor {
    async fn execute(&self, task: PassTask) -> Result<(), String> {
        let workers = self.workers.clone();
        tokio::task::spawn_blocking(move || workers.run_task(&task))
            .await
            .map_err(|e| format!("join task failed: {}", e))?
            .map_err(|e| e.to_string())
    }
}
