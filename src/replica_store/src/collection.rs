use crate::did_catalog::require_did;
use crate::records::{now_ms, CollectionReplica, ReplicaState};
use crate::store_db::{map_db_err, RowLockMode};
use crate::ReplicaCatalog;
use catalog_lib::{CatalogError, CatalogResult, DidKey, DidType};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionTouch {
    pub scope: String,
    pub name: String,
    pub rse: String,
    pub accessed_at: Option<DateTime<Utc>>,
}

/// Scope and name accept `*` wildcards.
#[derive(Debug, Clone, Default)]
pub struct DatasetReplicaFilter {
    pub scope: Option<String>,
    pub name: Option<String>,
    pub state: Option<ReplicaState>,
    pub created_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
}

/// `*` is the only wildcard; literal `%` and `_` are escaped for LIKE.
fn like_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '\\' | '%' | '_' => {
                out.push('\\');
                out.push(c);
            }
            '*' => out.push('%'),
            _ => out.push(c),
        }
    }
    out
}

fn push_pattern(sql: &mut String, values: &mut Vec<Value>, column: &str, pattern: &str) {
    if pattern.contains('*') {
        values.push(Value::Text(like_pattern(pattern)));
        sql.push_str(&format!(" AND {} LIKE ?{} ESCAPE '\\'", column, values.len()));
    } else {
        values.push(Value::Text(pattern.to_string()));
        sql.push_str(&format!(" AND {} = ?{}", column, values.len()));
    }
}

/// Aggregate state follows the available count: complete means AVAILABLE.
fn refresh_state(conn: &Connection, dataset: &DidKey, rse_id: Option<&str>) -> CatalogResult<()> {
    let sql = "UPDATE collection_replicas
               SET state = CASE WHEN available_replicas_cnt >= length THEN 'A' ELSE 'U' END
               WHERE scope = ?1 AND name = ?2 AND (?3 IS NULL OR rse_id = ?3)";
    conn.execute(sql, params![dataset.scope, dataset.name, rse_id])
        .map_err(map_db_err)?;
    Ok(())
}

/// A replica of `file` at `rse_id` entered or left the AVAILABLE state:
/// move the available counters of every dataset holding the file there.
pub(crate) fn adjust_available(
    conn: &Connection,
    file: &DidKey,
    rse_id: &str,
    bytes: u64,
    became_available: bool,
) -> CatalogResult<()> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT scope, name FROM contents WHERE child_scope = ?1 AND child_name = ?2 AND did_type = 'D'",
        )
        .map_err(map_db_err)?;
    let datasets = stmt
        .query_map(params![file.scope, file.name], |row| {
            Ok(DidKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(map_db_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(map_db_err)?;

    let sign: i64 = if became_available { 1 } else { -1 };
    let now = now_ms();
    for dataset in datasets {
        conn.execute(
            "UPDATE collection_replicas
             SET available_bytes = MAX(available_bytes + ?1, 0),
                 available_replicas_cnt = MAX(available_replicas_cnt + ?2, 0),
                 updated_at = ?3
             WHERE scope = ?4 AND name = ?5 AND rse_id = ?6",
            params![sign * bytes as i64, sign, now, dataset.scope, dataset.name, rse_id],
        )
        .map_err(map_db_err)?;
        refresh_state(conn, &dataset, Some(rse_id))?;
    }
    Ok(())
}

/// A file left `dataset` altogether: shrink its totals at every site.
pub(crate) fn on_constituent_detached(
    conn: &Connection,
    dataset: &DidKey,
    bytes: u64,
) -> CatalogResult<()> {
    conn.execute(
        "UPDATE collection_replicas
         SET bytes = MAX(bytes - ?1, 0), length = MAX(length - 1, 0), updated_at = ?2
         WHERE scope = ?3 AND name = ?4",
        params![bytes as i64, now_ms(), dataset.scope, dataset.name],
    )
    .map_err(map_db_err)?;
    refresh_state(conn, dataset, None)
}

/// Drops aggregates of a closed (or already removed) dataset: at `rse_id` once
/// none of its files has a replica there, everywhere once it has no files at all.
pub(crate) fn remove_emptied(conn: &Connection, dataset: &DidKey, rse_id: &str) -> CatalogResult<usize> {
    let at_site = conn
        .execute(
            "DELETE FROM collection_replicas
             WHERE scope = ?1 AND name = ?2 AND rse_id = ?3
               AND NOT EXISTS (SELECT 1 FROM dids d WHERE d.scope = ?1 AND d.name = ?2 AND d.is_open = 1)
               AND NOT EXISTS (
                   SELECT 1 FROM contents c JOIN replicas r
                     ON r.scope = c.child_scope AND r.name = c.child_name AND r.rse_id = ?3
                   WHERE c.scope = ?1 AND c.name = ?2)",
            params![dataset.scope, dataset.name, rse_id],
        )
        .map_err(map_db_err)?;
    let everywhere = conn
        .execute(
            "DELETE FROM collection_replicas
             WHERE scope = ?1 AND name = ?2
               AND NOT EXISTS (SELECT 1 FROM dids d WHERE d.scope = ?1 AND d.name = ?2 AND d.is_open = 1)
               AND NOT EXISTS (SELECT 1 FROM contents c WHERE c.scope = ?1 AND c.name = ?2)",
            params![dataset.scope, dataset.name],
        )
        .map_err(map_db_err)?;
    if at_site + everywhere > 0 {
        debug!(
            "ReplicaCatalog: removed {} aggregates of emptied dataset {}",
            at_site + everywhere,
            dataset
        );
    }
    Ok(at_site + everywhere)
}

fn collect_collection_replicas(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
) -> CatalogResult<Vec<CollectionReplica>> {
    let mut stmt = conn.prepare(sql).map_err(map_db_err)?;
    let rows = stmt
        .query_map(params_from_iter(values), CollectionReplica::from_row)
        .map_err(map_db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
}

impl ReplicaCatalog {
    fn fill_rse_names(&self, replicas: Vec<CollectionReplica>) -> Vec<CollectionReplica> {
        let mut names = HashMap::new();
        replicas
            .into_iter()
            .filter_map(|mut replica| match self.rse_name_cached(&mut names, &replica.rse_id) {
                Some(name) => {
                    replica.rse = name;
                    Some(replica)
                }
                None => {
                    debug!(
                        "ReplicaCatalog: skip aggregate of {}:{} at unknown rse {}",
                        replica.scope, replica.name, replica.rse_id
                    );
                    None
                }
            })
            .collect()
    }

    /// (Re)computes the aggregate of a dataset at one site from its files.
    pub fn materialize_collection_replica(
        &self,
        dataset: &DidKey,
        rse: &str,
    ) -> CatalogResult<CollectionReplica> {
        let rse_id = self.rse_id(rse)?;
        let now = now_ms();
        let replica = self.db.write(RowLockMode::Wait, |tx| {
            let record = require_did(tx, dataset)?;
            if record.did_type != DidType::Dataset {
                return Err(CatalogError::InvalidInput(format!(
                    "{} is a {}, not a dataset",
                    dataset, record.did_type
                )));
            }
            let (length, bytes): (i64, i64) = tx
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(COALESCE(d.bytes, c.bytes, 0)), 0)
                     FROM contents c LEFT JOIN dids d ON d.scope = c.child_scope AND d.name = c.child_name
                     WHERE c.scope = ?1 AND c.name = ?2 AND c.child_type = 'F'",
                    params![dataset.scope, dataset.name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(map_db_err)?;
            let (available_cnt, available_bytes): (i64, i64) = tx
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(r.bytes), 0)
                     FROM contents c JOIN replicas r ON r.scope = c.child_scope AND r.name = c.child_name
                     WHERE c.scope = ?1 AND c.name = ?2 AND r.rse_id = ?3 AND r.state = 'A'",
                    params![dataset.scope, dataset.name, rse_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(map_db_err)?;
            tx.execute(
                "INSERT INTO collection_replicas
                    (scope, name, rse_id, did_type, bytes, length, available_bytes, available_replicas_cnt, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'D', ?4, ?5, ?6, ?7, 'U', ?8, ?8)
                 ON CONFLICT(scope, name, rse_id) DO UPDATE SET
                    bytes = excluded.bytes,
                    length = excluded.length,
                    available_bytes = excluded.available_bytes,
                    available_replicas_cnt = excluded.available_replicas_cnt,
                    updated_at = excluded.updated_at",
                params![
                    dataset.scope,
                    dataset.name,
                    rse_id,
                    bytes,
                    length,
                    available_bytes,
                    available_cnt,
                    now
                ],
            )
            .map_err(map_db_err)?;
            refresh_state(tx, dataset, Some(rse_id.as_str()))?;
            let mut rows = collect_collection_replicas(
                tx,
                &format!(
                    "SELECT {} FROM collection_replicas WHERE scope = ?1 AND name = ?2 AND rse_id = ?3",
                    CollectionReplica::COLUMNS
                ),
                vec![
                    Value::Text(dataset.scope.clone()),
                    Value::Text(dataset.name.clone()),
                    Value::Text(rse_id.clone()),
                ],
            )?;
            rows.pop().ok_or_else(|| {
                CatalogError::Internal(format!("aggregate of {} vanished after upsert", dataset))
            })
        })?;
        info!(
            "ReplicaCatalog: materialized {} at {}: {}/{} files available",
            dataset, rse, replica.available_replicas_cnt, replica.length
        );
        Ok(CollectionReplica {
            rse: rse.to_string(),
            ..replica
        })
    }

    /// Records access times on dataset aggregates. Store failures and unknown
    /// sites are reported as `Ok(false)`.
    pub fn touch_collection_replicas(&self, touches: &[CollectionTouch]) -> CatalogResult<bool> {
        let now = now_ms();
        let rse_ids = match self.rse_ids(touches.iter().map(|t| t.rse.as_str())) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("ReplicaCatalog: touch_collection_replicas failed! {}", e);
                return Ok(false);
            }
        };
        let result = self.db.write(RowLockMode::Wait, |tx| {
            for touch in touches {
                let accessed_at = touch
                    .accessed_at
                    .map(|t| t.timestamp_millis())
                    .unwrap_or(now);
                tx.execute(
                    "UPDATE collection_replicas SET accessed_at = ?1 WHERE scope = ?2 AND name = ?3 AND rse_id = ?4",
                    params![accessed_at, touch.scope, touch.name, rse_ids[&touch.rse]],
                )
                .map_err(map_db_err)?;
            }
            Ok(())
        });
        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("ReplicaCatalog: touch_collection_replicas failed! {}", e);
                Ok(false)
            }
        }
    }

    pub fn list_dataset_replicas(&self, dataset: &DidKey) -> CatalogResult<Vec<CollectionReplica>> {
        let rows = self.db.read(|conn| {
            collect_collection_replicas(
                conn,
                &format!(
                    "SELECT {} FROM collection_replicas WHERE scope = ?1 AND name = ?2 AND did_type = 'D' ORDER BY rse_id",
                    CollectionReplica::COLUMNS
                ),
                vec![
                    Value::Text(dataset.scope.clone()),
                    Value::Text(dataset.name.clone()),
                ],
            )
        })?;
        Ok(self.fill_rse_names(rows))
    }

    pub fn list_datasets_per_rse(
        &self,
        rse: &str,
        filter: &DatasetReplicaFilter,
        limit: Option<usize>,
    ) -> CatalogResult<Vec<CollectionReplica>> {
        let rse_id = self.rse_id(rse)?;
        let mut sql = format!(
            "SELECT {} FROM collection_replicas WHERE rse_id = ?1 AND did_type = 'D'",
            CollectionReplica::COLUMNS
        );
        let mut values = vec![Value::Text(rse_id)];
        if let Some(scope) = filter.scope.as_deref() {
            push_pattern(&mut sql, &mut values, "scope", scope);
        }
        if let Some(name) = filter.name.as_deref() {
            push_pattern(&mut sql, &mut values, "name", name);
        }
        if let Some(state) = filter.state {
            values.push(Value::Text(state.as_str().to_string()));
            sql.push_str(&format!(" AND state = ?{}", values.len()));
        }
        if let Some(before) = filter.created_before {
            values.push(Value::Integer(before.timestamp_millis()));
            sql.push_str(&format!(" AND created_at < ?{}", values.len()));
        }
        if let Some(after) = filter.created_after {
            values.push(Value::Integer(after.timestamp_millis()));
            sql.push_str(&format!(" AND created_at > ?{}", values.len()));
        }
        sql.push_str(" ORDER BY scope, name");
        if let Some(limit) = limit {
            values.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }
        let rows = self
            .db
            .read(|conn| collect_collection_replicas(conn, &sql, values))?;
        Ok(self.fill_rse_names(rows))
    }
}
