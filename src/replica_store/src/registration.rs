use crate::collection;
use crate::did_catalog::load_did;
use crate::records::{now_ms, LogicalFile, ReplicaState, Tombstone};
use crate::rse_counter;
use crate::store_db::{map_db_err, RowLockMode};
use crate::ReplicaCatalog;
use catalog_lib::{
    clean_surl, common_scheme, CatalogError, CatalogResult, DidKey, DidType, ProtocolOperation,
    RseInfo,
};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A replica to register, together with the file it belongs to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewReplica {
    pub scope: String,
    pub name: String,
    pub bytes: u64,
    pub md5: Option<String>,
    pub adler32: Option<String>,
    pub pfn: Option<String>,
    /// Owner of the file DID when it does not exist yet; defaults to the issuer.
    pub account: Option<String>,
    /// Defaults to AVAILABLE.
    pub state: Option<ReplicaState>,
    pub lock_cnt: u64,
    pub tombstone: Option<Tombstone>,
}

impl NewReplica {
    pub fn new(scope: impl Into<String>, name: impl Into<String>, bytes: u64) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
            bytes,
            ..Default::default()
        }
    }

    pub fn key(&self) -> DidKey {
        DidKey::new(self.scope.clone(), self.name.clone())
    }

    fn validate(&self) -> CatalogResult<()> {
        if self.scope.is_empty() || self.name.is_empty() {
            return Err(CatalogError::InvalidInput(
                "replica scope and name must not be empty".to_string(),
            ));
        }
        if self.md5.is_none() && self.adler32.is_none() {
            return Err(CatalogError::InvalidInput(format!(
                "{} carries no checksum",
                self.key()
            )));
        }
        if self.lock_cnt > 0 && self.tombstone.is_some() {
            return Err(CatalogError::InvalidInput(format!(
                "{} is locked and cannot carry a tombstone",
                self.key()
            )));
        }
        if self.state == Some(ReplicaState::BeingDeleted) {
            return Err(CatalogError::InvalidInput(format!(
                "{} cannot be registered as {}",
                self.key(),
                ReplicaState::BeingDeleted
            )));
        }
        Ok(())
    }
}

impl ReplicaCatalog {
    /// Works out the stored path of each replica, checking supplied pfns
    /// against what the site would generate.
    fn resolve_replica_paths(
        &self,
        rse: &RseInfo,
        files: &[NewReplica],
    ) -> CatalogResult<Vec<Option<String>>> {
        let pfns: Vec<&str> = files.iter().filter_map(|f| f.pfn.as_deref()).collect();
        if !rse.deterministic {
            if let Some(missing) = files.iter().find(|f| f.pfn.is_none()) {
                return Err(CatalogError::UnsupportedOperation(format!(
                    "PFN needed for this (non deterministic) RSE {}, missing for {}",
                    rse.name,
                    missing.key()
                )));
            }
        }
        let Some(scheme) = common_scheme(&pfns)? else {
            return Ok(vec![None; files.len()]);
        };
        let protocol =
            self.protocols
                .create_protocol(rse, ProtocolOperation::Write, Some(&scheme))?;

        if rse.deterministic {
            let mut mismatched = Vec::new();
            for file in files {
                let Some(pfn) = file.pfn.as_deref() else {
                    continue;
                };
                let expected = protocol.lfn_to_pfn(&file.scope, &file.name, None);
                if clean_surl(&expected) != clean_surl(pfn) {
                    mismatched.push(format!("{} (expected {})", pfn, expected));
                }
            }
            if !mismatched.is_empty() {
                return Err(CatalogError::InvalidPath(format!(
                    "pfns do not match the deterministic layout of {}: {}",
                    rse.name,
                    mismatched.join(", ")
                )));
            }
            return Ok(vec![None; files.len()]);
        }

        let owned: Vec<String> = pfns.iter().map(|p| p.to_string()).collect();
        let parsed = protocol.parse_pfns(&owned)?;
        files
            .iter()
            .map(|file| {
                let pfn = file.pfn.as_deref().unwrap_or_default();
                parsed
                    .get(pfn)
                    .map(|p| Some(p.relative_path()))
                    .ok_or_else(|| CatalogError::InvalidInput(format!("cannot parse pfn {}", pfn)))
            })
            .collect()
    }

    /// Registers replicas at a writable site, creating the file DIDs that do
    /// not exist yet. Returns the logical files the replicas belong to.
    pub fn add_replicas(
        &self,
        rse: &str,
        files: &[NewReplica],
        account: &str,
    ) -> CatalogResult<Vec<LogicalFile>> {
        let rse_info = self.rse_info(rse)?;
        if !rse_info.can_write() {
            return Err(CatalogError::ResourceTemporaryUnavailable(format!(
                "{} is temporary unavailable for writing",
                rse
            )));
        }
        if files.is_empty() {
            return Ok(Vec::new());
        }
        for file in files {
            file.validate()?;
        }
        let paths = self.resolve_replica_paths(&rse_info, files)?;

        let logical_files = self.db.write(RowLockMode::Wait, |tx| {
            let logical_files = register_files(tx, files, account)?;
            let mut total_bytes = 0u64;
            for (file, path) in files.iter().zip(paths.iter()) {
                insert_replica(tx, &rse_info, file, path.as_deref())?;
                total_bytes += file.bytes;
            }
            rse_counter::increase(tx, &rse_info.id, files.len() as u64, total_bytes)?;
            Ok(logical_files)
        })?;

        info!(
            "ReplicaCatalog: registered {} replicas at {}",
            files.len(),
            rse
        );
        Ok(logical_files)
    }

    pub fn add_replica(
        &self,
        rse: &str,
        file: NewReplica,
        account: &str,
    ) -> CatalogResult<Vec<LogicalFile>> {
        self.add_replicas(rse, std::slice::from_ref(&file), account)
    }
}

/// Inserts missing file DIDs and checks existing ones against the new metadata.
fn register_files(
    tx: &Transaction<'_>,
    files: &[NewReplica],
    account: &str,
) -> CatalogResult<Vec<LogicalFile>> {
    let now = now_ms();
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for file in files {
        let key = file.key();
        if !seen.insert(key.clone()) {
            continue;
        }
        if let Some(existing) = load_did(tx, &key)? {
            if existing.did_type != DidType::File {
                return Err(CatalogError::InvalidInput(format!(
                    "{} is a {}, not a file",
                    key, existing.did_type
                )));
            }
            if existing.bytes.is_some() && existing.bytes != Some(file.bytes) {
                return Err(CatalogError::InvalidInput(format!(
                    "size mismatch for {}: registered {:?}, given {}",
                    key, existing.bytes, file.bytes
                )));
            }
            let checksum_conflict = |registered: &Option<String>, given: &Option<String>| {
                matches!((registered, given), (Some(r), Some(g)) if !r.eq_ignore_ascii_case(g))
            };
            if checksum_conflict(&existing.md5, &file.md5)
                || checksum_conflict(&existing.adler32, &file.adler32)
            {
                return Err(CatalogError::InvalidInput(format!(
                    "checksum mismatch for {}",
                    key
                )));
            }
            result.push(existing.into_logical_file());
            continue;
        }

        let owner = file.account.as_deref().unwrap_or(account);
        tx.execute(
            "INSERT INTO dids (scope, name, did_type, account, is_open, availability, bytes, md5, adler32, created_at, updated_at)
             VALUES (?1, ?2, 'F', ?3, 0, 'A', ?4, ?5, ?6, ?7, ?7)",
            params![
                file.scope,
                file.name,
                owner,
                file.bytes as i64,
                file.md5,
                file.adler32,
                now
            ],
        )
        .map_err(map_db_err)?;
        debug!("ReplicaCatalog: created file did {}", key);
        let created = load_did(tx, &key)?
            .ok_or_else(|| CatalogError::Internal(format!("file {} vanished after insert", key)))?;
        result.push(created.into_logical_file());
    }
    Ok(result)
}

fn replica_exists(conn: &Connection, key: &DidKey, rse_id: &str) -> CatalogResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM replicas WHERE scope = ?1 AND name = ?2 AND rse_id = ?3",
            params![key.scope, key.name, rse_id],
            |_| Ok(()),
        )
        .optional()
        .map_err(map_db_err)?;
    Ok(found.is_some())
}

fn insert_replica(
    tx: &Transaction<'_>,
    rse: &RseInfo,
    file: &NewReplica,
    path: Option<&str>,
) -> CatalogResult<()> {
    let key = file.key();
    if replica_exists(tx, &key, &rse.id)? {
        return Err(CatalogError::Duplicate(format!(
            "file replica {} already exists at {}",
            key, rse.name
        )));
    }
    let now = now_ms();
    let state = file.state.unwrap_or(ReplicaState::Available);
    tx.execute(
        "INSERT INTO replicas (scope, name, rse_id, bytes, md5, adler32, path, state, lock_cnt, tombstone, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        params![
            file.scope,
            file.name,
            rse.id,
            file.bytes as i64,
            file.md5,
            file.adler32,
            path,
            state,
            file.lock_cnt as i64,
            file.tombstone.map(|t| t.to_millis()),
            now
        ],
    )
    .map_err(|e| match map_db_err(e) {
        CatalogError::Duplicate(_) => CatalogError::Duplicate(format!(
            "file replica {} already exists at {}",
            key, rse.name
        )),
        other => other,
    })?;
    if state == ReplicaState::Available {
        collection::adjust_available(tx, &key, &rse.id, file.bytes, true)?;
    }
    Ok(())
}
