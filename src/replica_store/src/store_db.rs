use crate::BackendProfile;
use catalog_lib::{name_hash, CatalogError, CatalogResult, ShardSpec};
use log::{debug, warn};
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use std::sync::{Mutex, TryLockError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLockMode {
    Wait,
    /// Fail with `RowLocked` instead of waiting for a concurrent writer.
    NoWait,
}

impl RowLockMode {
    pub fn from_nowait(nowait: bool) -> Self {
        if nowait {
            RowLockMode::NoWait
        } else {
            RowLockMode::Wait
        }
    }
}

pub(crate) fn map_db_err(err: rusqlite::Error) -> CatalogError {
    if let rusqlite::Error::SqliteFailure(ref e, _) = err {
        match e.code {
            ErrorCode::ConstraintViolation
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                return CatalogError::Duplicate(err.to_string());
            }
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                return CatalogError::RowLocked(err.to_string());
            }
            _ => {}
        }
    }
    warn!("ReplicaCatalogDB: db error: {}", err);
    CatalogError::DbError(err.to_string())
}

/// `AND <hash(column) mod n == r>` when the shard is active, empty otherwise.
pub(crate) fn shard_clause(shard: &ShardSpec, column: &str) -> String {
    if !shard.is_active() {
        return String::new();
    }
    format!(
        " AND name_hash({}) % {} = {}",
        column,
        shard.modulus(),
        shard.residue()
    )
}

/// `?s, ?s+1, ...` placeholder list for an IN clause.
pub(crate) fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct ReplicaCatalogDB {
    pub db_path: String,
    profile: BackendProfile,
    busy_timeout: Duration,
    conn: Mutex<Connection>,
}

impl ReplicaCatalogDB {
    pub fn new(db_path: String, profile: BackendProfile, busy_timeout_ms: u64) -> CatalogResult<Self> {
        let conn = if db_path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(&db_path)
        }
        .map_err(|e| {
            warn!("ReplicaCatalogDB: open db {} failed! {}", db_path, e);
            CatalogError::DbError(e.to_string())
        })?;

        let busy_timeout = Duration::from_millis(busy_timeout_ms);
        Self::init_connection(&conn, busy_timeout)?;
        Self::register_functions(&conn)?;
        Self::create_schema(&conn)?;
        debug!("ReplicaCatalogDB: opened {}", db_path);

        Ok(Self {
            db_path,
            profile,
            busy_timeout,
            conn: Mutex::new(conn),
        })
    }

    fn init_connection(conn: &Connection, busy_timeout: Duration) -> CatalogResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = OFF;",
        )
        .map_err(|e| CatalogError::DbError(format!("pragma failed: {}", e)))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| CatalogError::DbError(format!("set busy timeout failed: {}", e)))?;
        Ok(())
    }

    fn register_functions(conn: &Connection) -> CatalogResult<()> {
        conn.create_scalar_function(
            "name_hash",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let name: String = ctx.get(0)?;
                Ok(name_hash(&name) as i64)
            },
        )
        .map_err(|e| CatalogError::DbError(format!("register name_hash failed: {}", e)))
    }

    fn create_schema(conn: &Connection) -> CatalogResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS dids (
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                did_type TEXT NOT NULL,
                account TEXT NOT NULL,
                is_open INTEGER NOT NULL DEFAULT 0,
                availability TEXT NOT NULL DEFAULT 'A',
                bytes INTEGER,
                md5 TEXT,
                adler32 TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                accessed_at INTEGER,
                PRIMARY KEY (scope, name)
            ) WITHOUT ROWID;

            CREATE TABLE IF NOT EXISTS contents (
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                child_scope TEXT NOT NULL,
                child_name TEXT NOT NULL,
                did_type TEXT NOT NULL,
                child_type TEXT NOT NULL,
                bytes INTEGER,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (scope, name, child_scope, child_name)
            ) WITHOUT ROWID;

            CREATE INDEX IF NOT EXISTS idx_contents_child ON contents(child_scope, child_name);

            CREATE TABLE IF NOT EXISTS replicas (
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                rse_id TEXT NOT NULL,
                bytes INTEGER NOT NULL,
                md5 TEXT,
                adler32 TEXT,
                path TEXT,
                state TEXT NOT NULL,
                lock_cnt INTEGER NOT NULL DEFAULT 0,
                tombstone INTEGER,
                accessed_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (scope, name, rse_id),
                CHECK (lock_cnt >= 0),
                CHECK (lock_cnt = 0 OR tombstone IS NULL)
            ) WITHOUT ROWID;

            CREATE INDEX IF NOT EXISTS idx_replicas_gc ON replicas(rse_id, tombstone);
            CREATE INDEX IF NOT EXISTS idx_replicas_path ON replicas(rse_id, path);
            CREATE INDEX IF NOT EXISTS idx_replicas_state ON replicas(state);

            CREATE TABLE IF NOT EXISTS bad_replicas (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                rse_id TEXT NOT NULL,
                reason TEXT,
                state TEXT NOT NULL,
                account TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_bad_replicas_key ON bad_replicas(scope, name, rse_id);
            CREATE INDEX IF NOT EXISTS idx_bad_replicas_state ON bad_replicas(state, created_at);

            CREATE TABLE IF NOT EXISTS collection_replicas (
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                rse_id TEXT NOT NULL,
                did_type TEXT NOT NULL,
                bytes INTEGER NOT NULL DEFAULT 0,
                length INTEGER NOT NULL DEFAULT 0,
                available_bytes INTEGER NOT NULL DEFAULT 0,
                available_replicas_cnt INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                accessed_at INTEGER,
                PRIMARY KEY (scope, name, rse_id)
            ) WITHOUT ROWID;

            CREATE INDEX IF NOT EXISTS idx_collection_replicas_rse ON collection_replicas(rse_id);

            CREATE TABLE IF NOT EXISTS rse_usage (
                rse_id TEXT PRIMARY KEY,
                files INTEGER NOT NULL DEFAULT 0,
                bytes INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            ) WITHOUT ROWID;",
        )
        .map_err(|e| {
            warn!("ReplicaCatalogDB: create schema failed! {}", e);
            CatalogError::DbError(format!("create schema failed: {}", e))
        })
    }

    pub fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    /// Runs `f` against the shared connection outside of any explicit transaction.
    pub fn read<T, F>(&self, f: F) -> CatalogResult<T>
    where
        F: FnOnce(&Connection) -> CatalogResult<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CatalogError::Internal(format!("catalog db lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Runs `f` inside one write transaction. The transaction commits when `f`
    /// returns Ok and rolls back otherwise.
    pub fn write<T, F>(&self, mode: RowLockMode, f: F) -> CatalogResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> CatalogResult<T>,
    {
        let mode = if mode == RowLockMode::NoWait && !self.profile.supports_nowait {
            debug!("ReplicaCatalogDB: backend has no nowait locking, waiting instead");
            RowLockMode::Wait
        } else {
            mode
        };

        let mut conn = match mode {
            RowLockMode::Wait => self
                .conn
                .lock()
                .map_err(|e| CatalogError::Internal(format!("catalog db lock poisoned: {}", e)))?,
            RowLockMode::NoWait => match self.conn.try_lock() {
                Ok(conn) => conn,
                Err(TryLockError::WouldBlock) => {
                    return Err(CatalogError::RowLocked(
                        "catalog rows are locked by another writer".to_string(),
                    ));
                }
                Err(TryLockError::Poisoned(e)) => {
                    return Err(CatalogError::Internal(format!(
                        "catalog db lock poisoned: {}",
                        e
                    )));
                }
            },
        };

        if mode == RowLockMode::NoWait {
            conn.busy_timeout(Duration::ZERO).map_err(map_db_err)?;
        }
        let result = Self::run_in_transaction(&mut conn, f);
        if mode == RowLockMode::NoWait {
            if let Err(e) = conn.busy_timeout(self.busy_timeout) {
                warn!("ReplicaCatalogDB: restore busy timeout failed! {}", e);
            }
        }
        result
    }

    fn run_in_transaction<T, F>(conn: &mut Connection, f: F) -> CatalogResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> CatalogResult<T>,
    {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_db_err)?;
        let value = f(&tx)?;
        tx.commit().map_err(map_db_err)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn create_test_db() -> ReplicaCatalogDB {
        ReplicaCatalogDB::new(":memory:".to_string(), BackendProfile::default(), 1000).unwrap()
    }

    #[test]
    fn test_write_rolls_back_on_error() {
        let db = create_test_db();
        let result: CatalogResult<()> = db.write(RowLockMode::Wait, |tx| {
            tx.execute(
                "INSERT INTO rse_usage (rse_id, files, bytes, updated_at) VALUES ('r1', 1, 10, 0)",
                [],
            )
            .map_err(map_db_err)?;
            Err(CatalogError::Internal("abort".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM rse_usage", [], |row| row.get(0))
                    .map_err(map_db_err)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_duplicate_key_maps_to_duplicate() {
        let db = create_test_db();
        let insert = |db: &ReplicaCatalogDB| {
            db.write(RowLockMode::Wait, |tx| {
                tx.execute(
                    "INSERT INTO rse_usage (rse_id, files, bytes, updated_at) VALUES (?1, 0, 0, 0)",
                    params!["r1"],
                )
                .map_err(map_db_err)?;
                Ok(())
            })
        };
        insert(&db).unwrap();
        assert!(matches!(insert(&db), Err(CatalogError::Duplicate(_))));
    }

    #[test]
    fn test_nowait_fails_while_connection_is_held() {
        let db = create_test_db();
        let result = db.write(RowLockMode::Wait, |_tx| {
            Ok(db.write(RowLockMode::NoWait, |_inner| Ok(())))
        });
        let inner = result.unwrap();
        assert!(matches!(inner, Err(CatalogError::RowLocked(_))));
    }

    #[test]
    fn test_name_hash_function_and_shard_clause() {
        let db = create_test_db();
        let hashed: i64 = db
            .read(|conn| {
                conn.query_row("SELECT name_hash('file_1')", [], |row| row.get(0))
                    .map_err(map_db_err)
            })
            .unwrap();
        assert_eq!(hashed, name_hash("file_1") as i64);

        assert_eq!(shard_clause(&ShardSpec::unsharded(), "name"), "");
        assert_eq!(
            shard_clause(&ShardSpec::new(2, 4), "name"),
            " AND name_hash(name) % 3 = 1"
        );
        assert_eq!(placeholders(3, 2), "?3, ?4");
    }
}
