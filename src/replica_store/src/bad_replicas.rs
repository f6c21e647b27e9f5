use crate::collection;
use crate::records::{now_ms, time_at, BadFilesStatus, BadReplicaEntry, ReplicaState};
use crate::replica_state::{find_replica, load_replica, ReplicaLookup};
use crate::resolver::{DidRef, ListReplicasOptions};
use crate::store_db::{map_db_err, placeholders, shard_clause, RowLockMode};
use crate::ReplicaCatalog;
use catalog_lib::{
    clean_surls, common_scheme, scope_from_path, url_hostname, CatalogError, CatalogResult,
    DidKey, ParsedPfn, ProtocolOperation, ReplicaKey, RseInfo, ShardSpec,
};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Key under which physical names that match no site are reported.
pub const UNKNOWN_RSE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BadReplica {
    pub scope: String,
    pub name: String,
    pub rse_id: String,
    pub rse: String,
}

#[derive(Debug, Clone, Default)]
pub struct BadReplicaFilter {
    pub state: Option<BadFilesStatus>,
    pub rse: Option<String>,
    pub younger_than: Option<DateTime<Utc>>,
    pub older_than: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BadReplicaSummary {
    pub rse: String,
    pub rse_id: String,
    /// UTC day the declarations were created on, `YYYY-MM-DD`.
    pub day: String,
    pub reason: Option<String>,
    pub counts: BTreeMap<BadFilesStatus, u64>,
}

struct SiteDeclaration {
    rse: RseInfo,
    pfns: Vec<(String, ParsedPfn)>,
}

impl ReplicaCatalog {
    /// Non-staging sites exposing `scheme` on one of `hostnames`, with their access points.
    fn candidate_sites(
        &self,
        scheme: &str,
        hostnames: &HashSet<String>,
    ) -> CatalogResult<BTreeMap<String, (RseInfo, Vec<String>)>> {
        let mut candidates = BTreeMap::new();
        for rse in self.rses.list_rses()? {
            if rse.staging_area {
                continue;
            }
            let access_points: Vec<String> = rse
                .protocols
                .iter()
                .filter(|p| p.scheme == scheme && hostnames.contains(&p.hostname))
                .map(|p| p.access_point())
                .collect();
            if !access_points.is_empty() {
                candidates.insert(rse.name.clone(), (rse, access_points));
            }
        }
        Ok(candidates)
    }

    /// Splits physical names by the site they belong to. A name matched by
    /// more than one site is an error. Names matching no site are collected
    /// separately.
    fn match_pfns_to_sites(
        &self,
        surls: &[String],
        rse_hint: Option<&str>,
    ) -> CatalogResult<(BTreeMap<String, (RseInfo, Vec<String>)>, Vec<String>)> {
        let Some(scheme) = common_scheme(surls)? else {
            return Ok((BTreeMap::new(), Vec::new()));
        };
        let hostnames: HashSet<String> = surls
            .iter()
            .filter_map(|s| url_hostname(s))
            .collect();
        let candidates = self.candidate_sites(&scheme, &hostnames)?;

        let mut matched: BTreeMap<String, (RseInfo, Vec<String>)> = BTreeMap::new();
        let mut unmatched = Vec::new();
        let mut hint = rse_hint
            .filter(|h| candidates.contains_key(*h))
            .map(|h| h.to_string());
        for surl in surls {
            if let Some(h) = hint.as_ref() {
                let (rse, aps) = &candidates[h];
                if aps.iter().any(|ap| surl.starts_with(ap.as_str())) {
                    matched
                        .entry(h.clone())
                        .or_insert_with(|| (rse.clone(), Vec::new()))
                        .1
                        .push(surl.clone());
                    continue;
                }
            }

            let sites: Vec<&String> = candidates
                .iter()
                .filter(|(_, (_, aps))| aps.iter().any(|ap| surl.starts_with(ap.as_str())))
                .map(|(name, _)| name)
                .collect();
            match sites.len() {
                0 => unmatched.push(surl.clone()),
                1 => {
                    let (rse, _) = &candidates[sites[0]];
                    matched
                        .entry(sites[0].clone())
                        .or_insert_with(|| (rse.clone(), Vec::new()))
                        .1
                        .push(surl.clone());
                    hint = Some(sites[0].clone());
                }
                _ => {
                    return Err(CatalogError::Ambiguous(format!(
                        "{} matches more than one site: {}",
                        surl,
                        sites
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )));
                }
            }
        }
        Ok((matched, unmatched))
    }

    /// Records physical names as BAD or SUSPICIOUS. Returns, per site, the
    /// names that could not be resolved to a registered replica.
    pub fn declare_bad_file_replicas(
        &self,
        pfns: &[String],
        rse_hint: Option<&str>,
        reason: &str,
        issuer: &str,
        status: BadFilesStatus,
    ) -> CatalogResult<BTreeMap<String, Vec<String>>> {
        if !matches!(status, BadFilesStatus::Bad | BadFilesStatus::Suspicious) {
            return Err(CatalogError::InvalidInput(format!(
                "replicas can only be declared BAD or SUSPICIOUS, not {}",
                status
            )));
        }
        if pfns.is_empty() {
            return Ok(BTreeMap::new());
        }

        let surls = clean_surls(pfns);
        let (matched, unmatched) = self.match_pfns_to_sites(&surls, rse_hint)?;

        let mut declarations = Vec::new();
        for (_, (rse, site_pfns)) in matched {
            let scheme = common_scheme(&site_pfns)?;
            let protocol =
                self.protocols
                    .create_protocol(&rse, ProtocolOperation::Read, scheme.as_deref())?;
            let mut parsed = protocol.parse_pfns(&site_pfns)?;
            let pfns = site_pfns
                .into_iter()
                .filter_map(|pfn| parsed.remove(&pfn).map(|p| (pfn, p)))
                .collect();
            declarations.push(SiteDeclaration { rse, pfns });
        }

        let mut unknown = self.db.write(RowLockMode::Wait, |tx| {
            let mut unknown = BTreeMap::new();
            for declaration in declarations.iter() {
                let missing = declare_at_site(tx, declaration, reason, issuer, status)?;
                if !missing.is_empty() {
                    unknown.insert(declaration.rse.name.clone(), missing);
                }
            }
            Ok(unknown)
        })?;
        if !unmatched.is_empty() {
            warn!(
                "ReplicaCatalog: {} pfns declared {} match no site",
                unmatched.len(),
                status
            );
            unknown.insert(UNKNOWN_RSE.to_string(), unmatched);
        }
        info!(
            "ReplicaCatalog: {} declared {} pfns {} ({} unknown)",
            issuer,
            pfns.len(),
            status,
            unknown.values().map(|v| v.len()).sum::<usize>()
        );
        Ok(unknown)
    }

    /// Page of BAD replicas, optionally restricted to one worker shard.
    pub fn list_bad_replicas(
        &self,
        limit: usize,
        shard: &ShardSpec,
    ) -> CatalogResult<Vec<BadReplica>> {
        let rows: Vec<(String, String, String)> = self.db.read(|conn| {
            let sql = format!(
                "SELECT scope, name, rse_id FROM replicas WHERE state = ?1{} ORDER BY scope, name, rse_id LIMIT ?2",
                shard_clause(shard, "name")
            );
            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let rows = stmt
                .query_map(params![ReplicaState::Bad, limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .map_err(map_db_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
        })?;

        let mut names = HashMap::new();
        Ok(rows
            .into_iter()
            .map(|(scope, name, rse_id)| {
                let rse = self
                    .rse_name_cached(&mut names, &rse_id)
                    .unwrap_or_else(|| rse_id.clone());
                BadReplica {
                    scope,
                    name,
                    rse_id,
                    rse,
                }
            })
            .collect())
    }

    /// Open BAD declarations grouped by site id.
    pub fn list_bad_replicas_history(
        &self,
        limit: usize,
        shard: &ShardSpec,
    ) -> CatalogResult<BTreeMap<String, Vec<DidKey>>> {
        let rows: Vec<(String, String, String)> = self.db.read(|conn| {
            let sql = format!(
                "SELECT scope, name, rse_id FROM bad_replicas WHERE state = ?1{} ORDER BY id LIMIT ?2",
                shard_clause(shard, "name")
            );
            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let rows = stmt
                .query_map(params![BadFilesStatus::Bad, limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .map_err(map_db_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
        })?;

        let mut result: BTreeMap<String, Vec<DidKey>> = BTreeMap::new();
        for (scope, name, rse_id) in rows {
            result
                .entry(rse_id)
                .or_default()
                .push(DidKey::new(scope, name));
        }
        Ok(result)
    }

    /// Reconciles BAD declarations with the replica table: declarations of a
    /// replica that is AVAILABLE again become RECOVERED, declarations of a
    /// replica that no longer exists become DELETED.
    pub fn update_bad_replicas_history(&self, dids: &[DidKey], rse_id: &str) -> CatalogResult<()> {
        let now = now_ms();
        self.db.write(RowLockMode::Wait, |tx| {
            for did in dids {
                let state: Option<ReplicaState> = tx
                    .query_row(
                        "SELECT state FROM replicas WHERE scope = ?1 AND name = ?2 AND rse_id = ?3",
                        params![did.scope, did.name, rse_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(map_db_err)?;
                let target = match state {
                    Some(ReplicaState::Available) => BadFilesStatus::Recovered,
                    Some(other) => {
                        debug!(
                            "ReplicaCatalog: bad history of {} at {} kept, replica is {}",
                            did, rse_id, other
                        );
                        continue;
                    }
                    None => BadFilesStatus::Deleted,
                };
                tx.execute(
                    "UPDATE bad_replicas SET state = ?1, updated_at = ?2
                     WHERE scope = ?3 AND name = ?4 AND rse_id = ?5 AND state = ?6",
                    params![target, now, did.scope, did.name, rse_id, BadFilesStatus::Bad],
                )
                .map_err(map_db_err)?;
            }
            Ok(())
        })
    }

    pub fn list_bad_replicas_status(
        &self,
        filter: &BadReplicaFilter,
    ) -> CatalogResult<Vec<BadReplicaEntry>> {
        let rse_id = match filter.rse.as_deref() {
            Some(rse) => Some(self.rse_id(rse)?),
            None => None,
        };
        let mut sql = String::from(
            "SELECT id, scope, name, rse_id, reason, state, account, created_at, updated_at FROM bad_replicas WHERE 1 = 1",
        );
        let mut values: Vec<Value> = Vec::new();
        if let Some(state) = filter.state {
            values.push(Value::Text(state.as_str().to_string()));
            sql.push_str(&format!(" AND state = ?{}", values.len()));
        }
        if let Some(rse_id) = rse_id {
            values.push(Value::Text(rse_id));
            sql.push_str(&format!(" AND rse_id = ?{}", values.len()));
        }
        if let Some(younger_than) = filter.younger_than {
            values.push(Value::Integer(younger_than.timestamp_millis()));
            sql.push_str(&format!(" AND created_at > ?{}", values.len()));
        }
        if let Some(older_than) = filter.older_than {
            values.push(Value::Integer(older_than.timestamp_millis()));
            sql.push_str(&format!(" AND created_at < ?{}", values.len()));
        }
        sql.push_str(" ORDER BY id");
        if let Some(limit) = filter.limit {
            values.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let rows = self.db.read(|conn| {
            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let rows = stmt
                .query_map(params_from_iter(values), |row| {
                    Ok(BadReplicaEntry {
                        id: row.get(0)?,
                        scope: row.get(1)?,
                        name: row.get(2)?,
                        rse_id: row.get(3)?,
                        rse: String::new(),
                        reason: row.get(4)?,
                        state: row.get(5)?,
                        account: row.get(6)?,
                        created_at: time_at(row, 7)?,
                        updated_at: time_at(row, 8)?,
                    })
                })
                .map_err(map_db_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
        })?;

        let mut names = HashMap::new();
        Ok(rows
            .into_iter()
            .map(|mut entry| {
                entry.rse = self
                    .rse_name_cached(&mut names, &entry.rse_id)
                    .unwrap_or_else(|| entry.rse_id.clone());
                entry
            })
            .collect())
    }

    /// Physical names of the replicas selected by `filter`.
    pub fn list_bad_replicas_pfns(&self, filter: &BadReplicaFilter) -> CatalogResult<Vec<String>> {
        let entries = self.list_bad_replicas_status(filter)?;
        let mut wanted: BTreeSet<(DidKey, String)> = BTreeSet::new();
        let mut files = Vec::new();
        for entry in entries {
            let did = DidKey::new(entry.scope, entry.name);
            files.push(DidRef::file(did.scope.clone(), did.name.clone()));
            wanted.insert((did, entry.rse));
        }
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let options = ListReplicasOptions {
            all_states: true,
            ..Default::default()
        };
        let mut pfns = Vec::new();
        let mut seen = HashSet::new();
        for file in self.list_replicas(&files, options)? {
            let file = file?;
            let did = DidKey::new(file.scope.clone(), file.name.clone());
            for (rse, rse_pfns) in file.rses.iter() {
                if !wanted.contains(&(did.clone(), rse.clone())) {
                    continue;
                }
                for pfn in rse_pfns {
                    if seen.insert(pfn.clone()) {
                        pfns.push(pfn.clone());
                    }
                }
            }
        }
        Ok(pfns)
    }

    /// Declaration counts per site, UTC day, reason and status.
    pub fn get_bad_replicas_summary(
        &self,
        rses: Option<&[String]>,
        from_date: Option<DateTime<Utc>>,
        to_date: Option<DateTime<Utc>>,
    ) -> CatalogResult<Vec<BadReplicaSummary>> {
        let rse_ids: Option<Vec<String>> = match rses {
            Some(names) => {
                let ids = self.rse_ids(names.iter().map(|n| n.as_str()))?;
                Some(names.iter().map(|n| ids[n].clone()).collect())
            }
            None => None,
        };

        let mut sql = String::from(
            "SELECT rse_id, strftime('%Y-%m-%d', created_at / 1000, 'unixepoch') AS day, reason, state, COUNT(*)
             FROM bad_replicas WHERE 1 = 1",
        );
        let mut values: Vec<Value> = Vec::new();
        if let Some(from_date) = from_date {
            values.push(Value::Integer(from_date.timestamp_millis()));
            sql.push_str(&format!(" AND created_at >= ?{}", values.len()));
        }
        if let Some(to_date) = to_date {
            values.push(Value::Integer(to_date.timestamp_millis()));
            sql.push_str(&format!(" AND created_at <= ?{}", values.len()));
        }
        if let Some(ids) = rse_ids.as_ref() {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            sql.push_str(&format!(
                " AND rse_id IN ({})",
                placeholders(values.len() + 1, ids.len())
            ));
            values.extend(ids.iter().map(|id| Value::Text(id.clone())));
        }
        sql.push_str(" GROUP BY rse_id, day, reason, state ORDER BY rse_id, day, reason");

        let rows: Vec<(String, String, Option<String>, BadFilesStatus, i64)> =
            self.db.read(|conn| {
                let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
                let rows = stmt
                    .query_map(params_from_iter(values), |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    })
                    .map_err(map_db_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
            })?;

        let mut names = HashMap::new();
        let mut grouped: BTreeMap<(String, String, Option<String>), BadReplicaSummary> =
            BTreeMap::new();
        for (rse_id, day, reason, state, count) in rows {
            let rse = self
                .rse_name_cached(&mut names, &rse_id)
                .unwrap_or_else(|| rse_id.clone());
            let summary = grouped
                .entry((rse_id.clone(), day.clone(), reason.clone()))
                .or_insert_with(|| BadReplicaSummary {
                    rse,
                    rse_id,
                    day,
                    reason,
                    counts: BTreeMap::new(),
                });
            *summary.counts.entry(state).or_insert(0) += count.max(0) as u64;
        }
        Ok(grouped.into_values().collect())
    }
}

fn declare_at_site(
    tx: &Transaction<'_>,
    declaration: &SiteDeclaration,
    reason: &str,
    issuer: &str,
    status: BadFilesStatus,
) -> CatalogResult<Vec<String>> {
    let rse = &declaration.rse;
    let now = now_ms();
    let mut unknown = Vec::new();
    let mut declared = Vec::new();
    for (pfn, parsed) in declaration.pfns.iter() {
        let lookup = if rse.deterministic {
            let scope = scope_from_path(&parsed.path).ok_or_else(|| {
                CatalogError::InvalidInput(format!("cannot derive a scope from {}", pfn))
            })?;
            ReplicaLookup::Key(DidKey::new(scope, parsed.name.clone()))
        } else {
            ReplicaLookup::Path(parsed.relative_path())
        };
        match find_replica(tx, &rse.id, &lookup)? {
            Some(did) => {
                insert_bad_entry(tx, &did, &rse.id, reason, status, issuer, now)?;
                declared.push(did);
            }
            None => unknown.push(pfn.clone()),
        }
    }

    if status == BadFilesStatus::Bad && !declared.is_empty() {
        let mut updated = 0usize;
        for did in declared.iter() {
            let previous = load_replica(tx, &ReplicaKey::new(did, rse.id.clone()))?;
            updated += tx
                .execute(
                    "UPDATE replicas SET state = ?1, updated_at = ?2 WHERE scope = ?3 AND name = ?4 AND rse_id = ?5",
                    params![ReplicaState::Bad, now, did.scope, did.name, rse.id],
                )
                .map_err(map_db_err)?;
            if let Some(previous) = previous.filter(|r| r.state == ReplicaState::Available) {
                collection::adjust_available(tx, did, &rse.id, previous.bytes, false)?;
            }
        }
        if updated != declared.len() {
            return Err(CatalogError::ReplicaNotFound(format!(
                "only {} of {} replicas at {} could be marked bad",
                updated,
                declared.len(),
                rse.name
            )));
        }
    }
    Ok(unknown)
}

fn insert_bad_entry(
    conn: &Connection,
    did: &DidKey,
    rse_id: &str,
    reason: &str,
    status: BadFilesStatus,
    issuer: &str,
    now: i64,
) -> CatalogResult<()> {
    conn.execute(
        "INSERT INTO bad_replicas (scope, name, rse_id, reason, state, account, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![did.scope, did.name, rse_id, reason, status, issuer, now],
    )
    .map_err(map_db_err)?;
    Ok(())
}
