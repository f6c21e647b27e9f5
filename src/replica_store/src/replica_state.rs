use crate::collection;
use crate::did_catalog::{list_children, require_did};
use crate::records::{now_ms, ReplicaRecord, ReplicaState, OBSOLETE_MS};
use crate::store_db::{map_db_err, placeholders, RowLockMode};
use crate::{LockCallbacks, ReplicaCatalog};
use catalog_lib::{CatalogError, CatalogResult, DidKey, DidType, ReplicaKey};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaStateUpdate {
    pub scope: String,
    pub name: String,
    pub rse: String,
    pub state: ReplicaState,
    pub path: Option<String>,
}

impl ReplicaStateUpdate {
    pub fn new(rse: &str, did: &DidKey, state: ReplicaState) -> Self {
        Self {
            scope: did.scope.clone(),
            name: did.name.clone(),
            rse: rse.to_string(),
            state,
            path: None,
        }
    }
}

/// Access to record on a replica; `accessed_at` defaults to now.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaTouch {
    pub scope: String,
    pub name: String,
    pub rse: String,
    pub accessed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaPathUpdate {
    pub scope: String,
    pub name: String,
    pub rse: String,
    pub path: String,
}

/// Lookup of a replica at one site, by logical name or by stored path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaLookup {
    Key(DidKey),
    Path(String),
}

pub(crate) fn load_replica(conn: &Connection, key: &ReplicaKey) -> CatalogResult<Option<ReplicaRecord>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM replicas WHERE scope = ?1 AND name = ?2 AND rse_id = ?3",
            ReplicaRecord::COLUMNS
        ),
        params![key.scope, key.name, key.rse_id],
        ReplicaRecord::from_row,
    )
    .optional()
    .map_err(map_db_err)
}

pub(crate) fn find_replica(
    conn: &Connection,
    rse_id: &str,
    lookup: &ReplicaLookup,
) -> CatalogResult<Option<DidKey>> {
    let row = match lookup {
        ReplicaLookup::Key(did) => conn.query_row(
            "SELECT scope, name FROM replicas WHERE rse_id = ?1 AND scope = ?2 AND name = ?3",
            params![rse_id, did.scope, did.name],
            |row| Ok(DidKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        ),
        ReplicaLookup::Path(path) => conn.query_row(
            "SELECT scope, name FROM replicas WHERE rse_id = ?1 AND path = ?2 LIMIT 1",
            params![rse_id, path],
            |row| Ok(DidKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        ),
    };
    row.optional().map_err(map_db_err)
}

/// Moves one replica to `state` inside an open transaction.
pub(crate) fn apply_state_transition(
    tx: &Transaction<'_>,
    locks: &dyn LockCallbacks,
    key: &ReplicaKey,
    state: ReplicaState,
    path: Option<&str>,
    nowait: bool,
) -> CatalogResult<()> {
    let current = load_replica(tx, key)?.ok_or_else(|| {
        CatalogError::ReplicaNotFound(format!(
            "No row found for scope: {} name: {} rse_id: {}",
            key.scope, key.name, key.rse_id
        ))
    })?;

    let did = key.did();
    match state {
        ReplicaState::Available => locks.on_transfer_succeeded(tx, &did, &key.rse_id, nowait)?,
        ReplicaState::Unavailable => locks.on_transfer_failed(tx, &did, &key.rse_id, nowait)?,
        _ => {}
    }

    let path = path.filter(|p| !p.is_empty());
    let now = now_ms();
    let updated = if state == ReplicaState::BeingDeleted {
        tx.execute(
            "UPDATE replicas SET state = ?1, tombstone = ?2, path = COALESCE(?3, path), updated_at = ?4
             WHERE scope = ?5 AND name = ?6 AND rse_id = ?7 AND lock_cnt = 0",
            params![state, OBSOLETE_MS, path, now, key.scope, key.name, key.rse_id],
        )
    } else {
        tx.execute(
            "UPDATE replicas SET state = ?1, path = COALESCE(?2, path), updated_at = ?3
             WHERE scope = ?4 AND name = ?5 AND rse_id = ?6",
            params![state, path, now, key.scope, key.name, key.rse_id],
        )
    }
    .map_err(map_db_err)?;

    if updated == 0 {
        return Err(CatalogError::UnsupportedOperation(format!(
            "State {} for replica {} cannot be updated (lock_cnt {})",
            state, key, current.lock_cnt
        )));
    }
    let was_available = current.state == ReplicaState::Available;
    if was_available != (state == ReplicaState::Available) {
        collection::adjust_available(tx, &did, &key.rse_id, current.bytes, !was_available)?;
    }
    debug!(
        "ReplicaCatalog: replica {} {} -> {}",
        key, current.state, state
    );
    Ok(())
}

impl ReplicaCatalog {
    /// Applies all updates atomically; any failure leaves every replica untouched.
    pub fn update_replicas_states(
        &self,
        updates: &[ReplicaStateUpdate],
        nowait: bool,
    ) -> CatalogResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let rse_ids = self.rse_ids(updates.iter().map(|u| u.rse.as_str()))?;
        let locks = self.locks.clone();
        self.db.write(RowLockMode::from_nowait(nowait), |tx| {
            for update in updates {
                let key = ReplicaKey {
                    scope: update.scope.clone(),
                    name: update.name.clone(),
                    rse_id: rse_ids[&update.rse].clone(),
                };
                apply_state_transition(
                    tx,
                    locks.as_ref(),
                    &key,
                    update.state,
                    update.path.as_deref(),
                    nowait,
                )?;
            }
            Ok(())
        })?;
        info!("ReplicaCatalog: updated state of {} replicas", updates.len());
        Ok(())
    }

    pub fn update_replica_state(
        &self,
        rse: &str,
        did: &DidKey,
        state: ReplicaState,
    ) -> CatalogResult<()> {
        self.update_replicas_states(&[ReplicaStateUpdate::new(rse, did, state)], false)
    }

    /// Adds `delta` to the lock count. Returns false when the replica does not exist.
    pub fn update_replica_lock_counter(
        &self,
        rse: &str,
        did: &DidKey,
        delta: i64,
    ) -> CatalogResult<bool> {
        let key = ReplicaKey::new(did, self.rse_id(rse)?);
        let sql = self.db.profile().lock_counter_update_sql();
        self.db.write(RowLockMode::Wait, |tx| {
            let updated = tx
                .execute(
                    sql,
                    params![delta, now_ms(), key.scope, key.name, key.rse_id],
                )
                .map_err(map_db_err)?;
            if updated > 0 {
                return Ok(true);
            }
            match load_replica(tx, &key)? {
                None => Ok(false),
                Some(current) => Err(CatalogError::UnsupportedOperation(format!(
                    "lock count of {} would drop below zero ({} {:+})",
                    key, current.lock_cnt, delta
                ))),
            }
        })
    }

    pub fn get_replica(&self, rse: &str, did: &DidKey) -> CatalogResult<ReplicaRecord> {
        let key = ReplicaKey::new(did, self.rse_id(rse)?);
        self.db.read(|conn| {
            load_replica(conn, &key)?
                .ok_or_else(|| CatalogError::ReplicaNotFound(key.to_string()))
        })
    }

    /// Returns the file identity of a replica found by name or stored path.
    pub fn exists_replica(&self, rse: &str, lookup: &ReplicaLookup) -> CatalogResult<Option<DidKey>> {
        let rse_id = self.rse_id(rse)?;
        self.db.read(|conn| find_replica(conn, &rse_id, lookup))
    }

    /// Records access times on replicas and their files. Store failures and
    /// unknown sites are reported as `Ok(false)`.
    pub fn touch_replicas(&self, replicas: &[ReplicaTouch]) -> CatalogResult<bool> {
        let result = self
            .rse_ids(replicas.iter().map(|r| r.rse.as_str()))
            .and_then(|rse_ids| {
                self.db.write(RowLockMode::Wait, |tx| {
                    for touch in replicas {
                        touch_one(tx, touch, &rse_ids[&touch.rse])?;
                    }
                    Ok(())
                })
            });
        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("ReplicaCatalog: touch_replicas failed! {}", e);
                Ok(false)
            }
        }
    }

    /// Like [`Self::touch_replicas`] for one replica, giving up immediately when
    /// the rows are locked.
    pub fn touch_replica_no_wait(&self, touch: &ReplicaTouch) -> bool {
        let rse_id = match self.rse_id(&touch.rse) {
            Ok(id) => id,
            Err(e) => {
                debug!("ReplicaCatalog: touch {}:{} skipped: {}", touch.scope, touch.name, e);
                return false;
            }
        };
        let result = self.db.write(RowLockMode::NoWait, |tx| {
            let updated = touch_one(tx, touch, &rse_id)?;
            if updated == 0 {
                return Err(CatalogError::ReplicaNotFound(format!(
                    "{}:{}@{}",
                    touch.scope, touch.name, rse_id
                )));
            }
            Ok(())
        });
        if let Err(e) = &result {
            debug!("ReplicaCatalog: touch {}:{} not applied: {}", touch.scope, touch.name, e);
        }
        result.is_ok()
    }

    pub fn get_replica_atime(&self, rse: &str, did: &DidKey) -> CatalogResult<Option<DateTime<Utc>>> {
        Ok(self.get_replica(rse, did)?.accessed_at)
    }

    pub fn update_replicas_paths(&self, updates: &[ReplicaPathUpdate]) -> CatalogResult<()> {
        let rse_ids = self.rse_ids(updates.iter().map(|u| u.rse.as_str()))?;
        let now = now_ms();
        self.db.write(RowLockMode::Wait, |tx| {
            for update in updates {
                let updated = tx
                    .execute(
                        "UPDATE replicas SET path = ?1, updated_at = ?2 WHERE scope = ?3 AND name = ?4 AND rse_id = ?5",
                        params![update.path, now, update.scope, update.name, rse_ids[&update.rse]],
                    )
                    .map_err(map_db_err)?;
                if updated == 0 {
                    return Err(CatalogError::ReplicaNotFound(format!(
                        "{}:{} at {}",
                        update.scope, update.name, update.rse
                    )));
                }
            }
            Ok(())
        })
    }

    /// Live replicas of a file, read under the write lock so that a caller
    /// can act on them without interference.
    pub fn get_and_lock_file_replicas(
        &self,
        did: &DidKey,
        nowait: bool,
        restrict_rses: Option<&[String]>,
    ) -> CatalogResult<Vec<ReplicaRecord>> {
        let rse_ids = self.restrict_ids(restrict_rses)?;
        self.db.write(RowLockMode::from_nowait(nowait), |tx| {
            live_replicas(tx, did, rse_ids.as_deref())
        })
    }

    /// Files of a dataset with their live replicas, keyed by file.
    pub fn get_and_lock_file_replicas_for_dataset(
        &self,
        dataset: &DidKey,
        nowait: bool,
        restrict_rses: Option<&[String]>,
    ) -> CatalogResult<BTreeMap<DidKey, Vec<ReplicaRecord>>> {
        let rse_ids = self.restrict_ids(restrict_rses)?;
        self.db.write(RowLockMode::from_nowait(nowait), |tx| {
            let record = require_did(tx, dataset)?;
            if record.did_type != DidType::Dataset {
                return Err(CatalogError::InvalidInput(format!(
                    "{} is a {}, not a dataset",
                    dataset, record.did_type
                )));
            }
            let mut result = BTreeMap::new();
            for entry in list_children(tx, dataset)? {
                let file = entry.child();
                let replicas = live_replicas(tx, &file, rse_ids.as_deref())?;
                result.insert(file, replicas);
            }
            Ok(result)
        })
    }

    fn restrict_ids(&self, rses: Option<&[String]>) -> CatalogResult<Option<Vec<String>>> {
        match rses {
            None => Ok(None),
            Some(names) => {
                let ids = self.rse_ids(names.iter().map(|n| n.as_str()))?;
                Ok(Some(names.iter().map(|n| ids[n].clone()).collect()))
            }
        }
    }
}

fn touch_one(tx: &Transaction<'_>, touch: &ReplicaTouch, rse_id: &str) -> CatalogResult<usize> {
    let accessed_at = touch
        .accessed_at
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(now_ms);
    let updated = tx
        .execute(
            "UPDATE replicas SET accessed_at = ?1 WHERE scope = ?2 AND name = ?3 AND rse_id = ?4",
            params![accessed_at, touch.scope, touch.name, rse_id],
        )
        .map_err(map_db_err)?;
    tx.execute(
        "UPDATE dids SET accessed_at = ?1 WHERE scope = ?2 AND name = ?3",
        params![accessed_at, touch.scope, touch.name],
    )
    .map_err(map_db_err)?;
    Ok(updated)
}

fn live_replicas(
    conn: &Connection,
    did: &DidKey,
    rse_ids: Option<&[String]>,
) -> CatalogResult<Vec<ReplicaRecord>> {
    let mut sql = format!(
        "SELECT {} FROM replicas WHERE scope = ?1 AND name = ?2 AND state != 'D'",
        ReplicaRecord::COLUMNS
    );
    let mut values: Vec<Value> = vec![
        Value::Text(did.scope.clone()),
        Value::Text(did.name.clone()),
    ];
    if let Some(ids) = rse_ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sql.push_str(&format!(" AND rse_id IN ({})", placeholders(3, ids.len())));
        values.extend(ids.iter().map(|id| Value::Text(id.clone())));
    }
    sql.push_str(" ORDER BY rse_id");
    let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
    let rows = stmt
        .query_map(params_from_iter(values), ReplicaRecord::from_row)
        .map_err(map_db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
}
