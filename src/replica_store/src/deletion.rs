use crate::collection;
use crate::did_catalog::{has_children, list_parents, load_did};
use crate::records::ReplicaState;
use crate::rse_counter;
use crate::store_db::{map_db_err, RowLockMode};
use crate::ReplicaCatalog;
use catalog_lib::{
    CatalogError, CatalogResult, DidAvailability, DidKey, DidType, MAX_HIERARCHY_DEPTH,
};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeletionSummary {
    pub replicas: u64,
    pub bytes: u64,
    /// Logical names dropped because nothing referenced them any more.
    pub removed_dids: Vec<DidKey>,
    pub removed_collection_replicas: usize,
}

impl DeletionSummary {
    fn merge(&mut self, other: DeletionSummary) {
        self.replicas += other.replicas;
        self.bytes += other.bytes;
        self.removed_dids.extend(other.removed_dids);
        self.removed_collection_replicas += other.removed_collection_replicas;
    }
}

fn has_replicas(conn: &Connection, did: &DidKey) -> CatalogResult<bool> {
    conn.query_row(
        "SELECT 1 FROM replicas WHERE scope = ?1 AND name = ?2 LIMIT 1",
        params![did.scope, did.name],
        |_| Ok(()),
    )
    .optional()
    .map_err(map_db_err)
    .map(|row| row.is_some())
}

fn remove_if_unreferenced(tx: &Transaction<'_>, did: &DidKey) -> CatalogResult<bool> {
    let removed = tx
        .execute(
            "DELETE FROM dids
             WHERE scope = ?1 AND name = ?2
               AND availability != 'L'
               AND (did_type = 'F' OR is_open = 0)
               AND NOT EXISTS (SELECT 1 FROM replicas r WHERE r.scope = ?1 AND r.name = ?2)
               AND NOT EXISTS (SELECT 1 FROM contents c WHERE c.scope = ?1 AND c.name = ?2)
               AND NOT EXISTS (SELECT 1 FROM contents c WHERE c.child_scope = ?1 AND c.child_name = ?2)",
            params![did.scope, did.name],
        )
        .map_err(map_db_err)?;
    Ok(removed > 0)
}

/// Files without replicas and closed collections without content may be
/// dropped, unless they are flagged lost.
fn is_removable(conn: &Connection, did: &DidKey) -> CatalogResult<bool> {
    let Some(record) = load_did(conn, did)? else {
        return Ok(false);
    };
    if record.availability == DidAvailability::Lost {
        return Ok(false);
    }
    if record.did_type.is_collection() && record.is_open {
        return Ok(false);
    }
    Ok(!has_replicas(conn, did)? && !has_children(conn, did)?)
}

fn delete_chunk(tx: &Transaction<'_>, rse_id: &str, files: &[DidKey]) -> CatalogResult<DeletionSummary> {
    let mut summary = DeletionSummary::default();
    let mut missing = Vec::new();
    let mut touched_datasets: BTreeSet<DidKey> = BTreeSet::new();

    for file in files {
        let row: Option<(i64, ReplicaState)> = tx
            .query_row(
                "SELECT bytes, state FROM replicas WHERE scope = ?1 AND name = ?2 AND rse_id = ?3",
                params![file.scope, file.name, rse_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(map_db_err)?;
        let Some((bytes, state)) = row else {
            missing.push(file.to_string());
            continue;
        };
        let bytes = bytes.max(0) as u64;
        tx.execute(
            "DELETE FROM replicas WHERE scope = ?1 AND name = ?2 AND rse_id = ?3",
            params![file.scope, file.name, rse_id],
        )
        .map_err(map_db_err)?;
        if state == ReplicaState::Available {
            collection::adjust_available(tx, file, rse_id, bytes, false)?;
        }
        for edge in list_parents(tx, file)? {
            if edge.did_type == DidType::Dataset {
                touched_datasets.insert(edge.parent());
            }
        }
        summary.replicas += 1;
        summary.bytes += bytes;
    }

    if !missing.is_empty() {
        return Err(CatalogError::ReplicaNotFound(format!(
            "{} of {} replicas not found at {}: {}",
            missing.len(),
            files.len(),
            rse_id,
            missing.join(", ")
        )));
    }

    // Removable names detach from their parents; parents left empty are
    // examined on the next level up.
    let mut level: Vec<DidKey> = Vec::new();
    for file in files {
        if !level.contains(file) {
            level.push(file.clone());
        }
    }
    let mut depth = 0usize;
    while !level.is_empty() {
        if depth >= MAX_HIERARCHY_DEPTH {
            warn!(
                "ReplicaCatalog: hierarchy walk at {} stopped at depth {}",
                rse_id, depth
            );
            break;
        }
        let mut next = Vec::new();
        for did in level.iter() {
            if !is_removable(tx, did)? {
                continue;
            }
            let did_bytes = load_did(tx, did)?.and_then(|d| d.bytes).unwrap_or(0);
            for edge in list_parents(tx, did)? {
                let parent = edge.parent();
                if edge.did_type == DidType::Dataset {
                    collection::on_constituent_detached(tx, &parent, edge.bytes.unwrap_or(did_bytes))?;
                    touched_datasets.insert(parent.clone());
                }
                tx.execute(
                    "DELETE FROM contents WHERE scope = ?1 AND name = ?2 AND child_scope = ?3 AND child_name = ?4",
                    params![parent.scope, parent.name, did.scope, did.name],
                )
                .map_err(map_db_err)?;
                if !has_children(tx, &parent)? && !next.contains(&parent) {
                    next.push(parent);
                }
            }
            if remove_if_unreferenced(tx, did)? {
                summary.removed_dids.push(did.clone());
            }
        }
        level = next;
        depth += 1;
    }

    for dataset in touched_datasets.iter() {
        summary.removed_collection_replicas += collection::remove_emptied(tx, dataset, rse_id)?;
    }

    rse_counter::decrease(tx, rse_id, summary.replicas, summary.bytes)?;
    Ok(summary)
}

impl ReplicaCatalog {
    /// Removes replicas of `files` at a site and everything that becomes
    /// unreferenced because of it. Keys are processed in chunks inside one
    /// transaction; a key without a replica fails the whole call.
    pub fn delete_replicas(
        &self,
        rse: &str,
        files: &[DidKey],
        ignore_availability: bool,
    ) -> CatalogResult<DeletionSummary> {
        let info = self.rse_info(rse)?;
        if !ignore_availability && !info.can_delete() {
            return Err(CatalogError::ResourceTemporaryUnavailable(format!(
                "{} is temporarily unavailable for deletion",
                info.name
            )));
        }

        let chunk_size = self.config.delete_chunk_size.max(1);
        let summary = self.db.write(RowLockMode::Wait, |tx| {
            let mut summary = DeletionSummary::default();
            for chunk in files.chunks(chunk_size) {
                let done = delete_chunk(tx, &info.id, chunk)?;
                debug!(
                    "ReplicaCatalog: deleted chunk of {} replicas at {}",
                    done.replicas, info.name
                );
                summary.merge(done);
            }
            Ok(summary)
        })?;
        info!(
            "ReplicaCatalog: deleted {} replicas ({} bytes) at {}, dropped {} dids and {} aggregates",
            summary.replicas,
            summary.bytes,
            info.name,
            summary.removed_dids.len(),
            summary.removed_collection_replicas
        );
        Ok(summary)
    }

    pub fn delete_replica(&self, rse: &str, file: &DidKey) -> CatalogResult<DeletionSummary> {
        self.delete_replicas(rse, std::slice::from_ref(file), false)
    }
}
