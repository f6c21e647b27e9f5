use catalog_lib::{CatalogResult, DidKey};
use rusqlite::Transaction;

/// Hooks into the lock/rule subsystem, invoked inside the state update
/// transaction before a replica becomes AVAILABLE or UNAVAILABLE.
pub trait LockCallbacks: Send + Sync {
    fn on_transfer_succeeded(
        &self,
        tx: &Transaction<'_>,
        file: &DidKey,
        rse_id: &str,
        nowait: bool,
    ) -> CatalogResult<()>;

    fn on_transfer_failed(
        &self,
        tx: &Transaction<'_>,
        file: &DidKey,
        rse_id: &str,
        nowait: bool,
    ) -> CatalogResult<()>;
}

#[derive(Debug, Clone, Default)]
pub struct NoopLockCallbacks;

impl LockCallbacks for NoopLockCallbacks {
    fn on_transfer_succeeded(
        &self,
        _tx: &Transaction<'_>,
        _file: &DidKey,
        _rse_id: &str,
        _nowait: bool,
    ) -> CatalogResult<()> {
        Ok(())
    }

    fn on_transfer_failed(
        &self,
        _tx: &Transaction<'_>,
        _file: &DidKey,
        _rse_id: &str,
        _nowait: bool,
    ) -> CatalogResult<()> {
        Ok(())
    }
}
