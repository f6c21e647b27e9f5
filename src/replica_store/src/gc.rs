use crate::records::{now_ms, ReplicaState, Tombstone};
use crate::store_db::{map_db_err, shard_clause};
use crate::ReplicaCatalog;
use catalog_lib::{CatalogResult, ShardSpec};
use log::debug;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletionCandidate {
    pub scope: String,
    pub name: String,
    pub path: Option<String>,
    pub bytes: u64,
    pub tombstone: Tombstone,
    pub state: ReplicaState,
}

#[derive(Debug, Clone, Default)]
pub struct CandidateQuery {
    pub limit: usize,
    /// Cumulative size cap of the dated (non OBSOLETE) candidates.
    pub bytes: Option<u64>,
    pub shard: ShardSpec,
    /// Overrides the configured BEING_DELETED grace period.
    pub delay_seconds: Option<u64>,
}

impl CandidateQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BeingDeletedSummary {
    pub total: u64,
    pub bytes: u64,
}

struct CandidatePage<'a> {
    rse_id: &'a str,
    now: i64,
    stale_before: i64,
    shard: &'a ShardSpec,
    after: Option<&'a (i64, String, String)>,
    limit: usize,
}

fn fetch_candidate_page(
    conn: &Connection,
    page: &CandidatePage<'_>,
) -> CatalogResult<Vec<(i64, DeletionCandidate)>> {
    let mut sql = String::from(
        "SELECT scope, name, path, bytes, tombstone, state FROM replicas
         WHERE rse_id = ?1 AND tombstone IS NOT NULL AND tombstone < ?2 AND lock_cnt = 0
           AND (state IN ('A', 'U') OR (state = 'D' AND updated_at < ?3))",
    );
    let mut values: Vec<Value> = vec![
        Value::Text(page.rse_id.to_string()),
        Value::Integer(page.now),
        Value::Integer(page.stale_before),
    ];
    if let Some((tombstone, scope, name)) = page.after {
        sql.push_str(" AND (tombstone, scope, name) > (?4, ?5, ?6)");
        values.push(Value::Integer(*tombstone));
        values.push(Value::Text(scope.clone()));
        values.push(Value::Text(name.clone()));
    }
    sql.push_str(&shard_clause(page.shard, "name"));
    values.push(Value::Integer(page.limit as i64));
    sql.push_str(&format!(
        " ORDER BY tombstone, scope, name LIMIT ?{}",
        values.len()
    ));

    let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| {
            let tombstone: i64 = row.get(4)?;
            let bytes: i64 = row.get(3)?;
            Ok((
                tombstone,
                DeletionCandidate {
                    scope: row.get(0)?,
                    name: row.get(1)?,
                    path: row.get(2)?,
                    bytes: bytes.max(0) as u64,
                    tombstone: Tombstone::from_millis(tombstone),
                    state: row.get(5)?,
                },
            ))
        })
        .map_err(map_db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
}

impl ReplicaCatalog {
    /// Replicas at a site that may be deleted now, oldest tombstone first.
    ///
    /// OBSOLETE replicas sort first and are not charged against `limit` or
    /// the byte cap; the scan stops once `obsolete_scan_limit` of them were
    /// taken. Dated replicas then fill the result until `limit` files or the
    /// byte cap would be exceeded.
    pub fn list_unlocked_replicas(
        &self,
        rse: &str,
        query: &CandidateQuery,
    ) -> CatalogResult<Vec<DeletionCandidate>> {
        let rse_id = self.rse_id(rse)?;
        let now = now_ms();
        let grace_secs = query
            .delay_seconds
            .unwrap_or(self.config.being_deleted_grace_secs);
        let stale_before = now - (grace_secs as i64).saturating_mul(1000);
        let page_size = self.config.page_size.max(1);

        let mut result = Vec::new();
        let mut obsolete = 0usize;
        let mut dated = 0usize;
        let mut total_bytes = 0u64;
        let mut cursor: Option<(i64, String, String)> = None;
        'scan: loop {
            let page = self.db.read(|conn| {
                fetch_candidate_page(
                    conn,
                    &CandidatePage {
                        rse_id: &rse_id,
                        now,
                        stale_before,
                        shard: &query.shard,
                        after: cursor.as_ref(),
                        limit: page_size,
                    },
                )
            })?;
            let exhausted = page.len() < page_size;
            for (tombstone, candidate) in page {
                cursor = Some((tombstone, candidate.scope.clone(), candidate.name.clone()));
                if candidate.tombstone.is_obsolete() {
                    if obsolete >= self.config.obsolete_scan_limit {
                        break 'scan;
                    }
                    obsolete += 1;
                    result.push(candidate);
                    continue;
                }
                if dated >= query.limit {
                    break 'scan;
                }
                if let Some(cap) = query.bytes {
                    if total_bytes + candidate.bytes > cap {
                        break 'scan;
                    }
                }
                dated += 1;
                total_bytes += candidate.bytes;
                result.push(candidate);
            }
            if exhausted {
                break;
            }
        }

        debug!(
            "ReplicaCatalog: {} deletion candidates at {} ({} obsolete, {} bytes dated)",
            result.len(),
            rse,
            obsolete,
            total_bytes
        );
        Ok(result)
    }

    pub fn get_sum_count_being_deleted(&self, rse: &str) -> CatalogResult<BeingDeletedSummary> {
        let rse_id = self.rse_id(rse)?;
        self.db.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(bytes), 0) FROM replicas
                 WHERE rse_id = ?1 AND tombstone IS NOT NULL AND state = ?2",
                params![rse_id, ReplicaState::BeingDeleted],
                |row| {
                    let total: i64 = row.get(0)?;
                    let bytes: i64 = row.get(1)?;
                    Ok(BeingDeletedSummary {
                        total: total.max(0) as u64,
                        bytes: bytes.max(0) as u64,
                    })
                },
            )
            .map_err(map_db_err)
        })
    }
}
