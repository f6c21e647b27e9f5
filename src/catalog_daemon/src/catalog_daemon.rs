use catalog_lib::{CatalogError, CatalogResult, RseRegistry, StaticRseRegistry};
use log::{info, warn};
use replica_store::ReplicaCatalog;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;

use crate::config::CatalogDaemonConfig;
use crate::scheduler::{PassKind, PassScheduler, SweepStats, ALL_RSES};
use crate::workers::{BlockingExecutor, CatalogWorkers};

#[derive(Debug, Clone)]
pub struct CatalogDaemonRunOptions {
    pub config_path: PathBuf,
    /// Run every pass once and exit.
    pub once: bool,
}

pub fn open_catalog(config: &CatalogDaemonConfig) -> CatalogResult<Arc<ReplicaCatalog>> {
    let registry = StaticRseRegistry::load_from_file(&config.rse_config_path)?;
    for rse in config.report_rses.iter() {
        if registry.get_rse_info(rse).is_err() {
            warn!("catalog_daemon: report site {} is not registered", rse);
        }
    }
    let catalog = ReplicaCatalog::open(config.catalog.clone(), Arc::new(registry))?;
    Ok(Arc::new(catalog))
}

/// Every pass starts on the first sweep and then follows its configured interval.
pub fn build_scheduler(config: &CatalogDaemonConfig) -> PassScheduler {
    let mut scheduler = PassScheduler::new();
    scheduler.set_policy(PassKind::Necromancer, config.necromancer.to_policy());
    scheduler.set_policy(PassKind::CapacityReport, config.capacity_report.to_policy());
    scheduler.add_target(PassKind::Necromancer, ALL_RSES);
    for rse in config.report_rses.iter() {
        scheduler.add_target(PassKind::CapacityReport, rse.clone());
    }
    scheduler
}

/// One sweep over every pass, whatever the configured intervals.
pub async fn run_single_pass(
    scheduler: &Arc<Mutex<PassScheduler>>,
    executor: &BlockingExecutor,
) -> SweepStats {
    if let Ok(mut guard) = scheduler.lock() {
        guard.mark_all_due();
    }
    PassScheduler::run_once(scheduler, executor).await
}

pub fn run_catalog_daemon(options: CatalogDaemonRunOptions) -> CatalogResult<()> {
    let config = CatalogDaemonConfig::load_from_file(&options.config_path)?;
    info!(
        "catalog_daemon: config {} loaded, catalog db {}, shard {}/{}",
        options.config_path.display(),
        config.catalog.db_path,
        config.worker_number,
        config.total_workers
    );
    let catalog = open_catalog(&config)?;
    let workers = Arc::new(CatalogWorkers::new(catalog, &config));
    let executor = Arc::new(BlockingExecutor::new(workers));
    let scheduler = Arc::new(Mutex::new(build_scheduler(&config)));

    let runtime = Runtime::new()
        .map_err(|e| CatalogError::Internal(format!("create tokio runtime failed: {}", e)))?;

    if options.once {
        let stats = runtime.block_on(run_single_pass(&scheduler, executor.as_ref()));
        info!(
            "catalog_daemon: single pass done, executed={}, failed={}, skipped={}",
            stats.executed, stats.failed, stats.skipped_due_to_budget
        );
        if stats.failed > 0 {
            return Err(CatalogError::Internal(format!(
                "{} pass targets failed",
                stats.failed
            )));
        }
        return Ok(());
    }

    runtime.block_on(async move {
        let handle = PassScheduler::spawn_worker(scheduler, executor, config.poll_interval());
        info!("catalog_daemon: pass scheduler started");
        let result = tokio::signal::ctrl_c().await;
        handle.abort();
        result.map_err(|e| CatalogError::IoError(format!("wait for ctrl-c failed: {}", e)))?;
        info!("catalog_daemon: stopped");
        Ok(())
    })
}
