use crate::records::{did_type_at, now_ms, DidRecord};
use crate::store_db::{map_db_err, RowLockMode};
use crate::ReplicaCatalog;
use catalog_lib::{CatalogError, CatalogResult, DidAvailability, DidKey, DidType};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// One containment edge: `scope:name` contains `child_scope:child_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentEntry {
    pub scope: String,
    pub name: String,
    pub child_scope: String,
    pub child_name: String,
    pub did_type: DidType,
    pub child_type: DidType,
    pub bytes: Option<u64>,
}

impl ContentEntry {
    const COLUMNS: &'static str = "scope, name, child_scope, child_name, did_type, child_type, bytes";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let bytes: Option<i64> = row.get(6)?;
        Ok(Self {
            scope: row.get(0)?,
            name: row.get(1)?,
            child_scope: row.get(2)?,
            child_name: row.get(3)?,
            did_type: did_type_at(row, 4)?,
            child_type: did_type_at(row, 5)?,
            bytes: bytes.map(|b| b.max(0) as u64),
        })
    }

    pub fn parent(&self) -> DidKey {
        DidKey::new(self.scope.clone(), self.name.clone())
    }

    pub fn child(&self) -> DidKey {
        DidKey::new(self.child_scope.clone(), self.child_name.clone())
    }
}

pub(crate) fn load_did(conn: &Connection, key: &DidKey) -> CatalogResult<Option<DidRecord>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM dids WHERE scope = ?1 AND name = ?2",
            DidRecord::COLUMNS
        ),
        params![key.scope, key.name],
        DidRecord::from_row,
    )
    .optional()
    .map_err(map_db_err)
}

pub(crate) fn require_did(conn: &Connection, key: &DidKey) -> CatalogResult<DidRecord> {
    load_did(conn, key)?.ok_or_else(|| CatalogError::DidNotFound(key.to_string()))
}

pub(crate) fn list_children(conn: &Connection, parent: &DidKey) -> CatalogResult<Vec<ContentEntry>> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {} FROM contents WHERE scope = ?1 AND name = ?2 ORDER BY child_scope, child_name",
            ContentEntry::COLUMNS
        ))
        .map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![parent.scope, parent.name], ContentEntry::from_row)
        .map_err(map_db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
}

pub(crate) fn list_parents(conn: &Connection, child: &DidKey) -> CatalogResult<Vec<ContentEntry>> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {} FROM contents WHERE child_scope = ?1 AND child_name = ?2 ORDER BY scope, name",
            ContentEntry::COLUMNS
        ))
        .map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![child.scope, child.name], ContentEntry::from_row)
        .map_err(map_db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
}

pub(crate) fn has_children(conn: &Connection, parent: &DidKey) -> CatalogResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM contents WHERE scope = ?1 AND name = ?2 LIMIT 1",
            params![parent.scope, parent.name],
            |_| Ok(()),
        )
        .optional()
        .map_err(map_db_err)?;
    Ok(found.is_some())
}

impl ReplicaCatalog {
    /// Registers a dataset or container. Files are registered with their first replica.
    pub fn add_did(
        &self,
        did: &DidKey,
        did_type: DidType,
        account: &str,
        is_open: bool,
    ) -> CatalogResult<()> {
        if did_type == DidType::File {
            return Err(CatalogError::InvalidInput(format!(
                "file {} must be registered through add_replicas",
                did
            )));
        }
        let now = now_ms();
        self.db.write(RowLockMode::Wait, |tx| {
            tx.execute(
                "INSERT INTO dids (scope, name, did_type, account, is_open, availability, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'A', ?6, ?6)",
                params![did.scope, did.name, did_type.as_str(), account, is_open, now],
            )
            .map_err(|e| match map_db_err(e) {
                CatalogError::Duplicate(_) => CatalogError::DidAlreadyExists(did.to_string()),
                other => other,
            })?;
            Ok(())
        })?;
        info!("ReplicaCatalog: added {} {}", did_type, did);
        Ok(())
    }

    /// Attaches existing DIDs under an open collection. Datasets hold files,
    /// containers hold datasets and containers.
    pub fn attach_dids(&self, parent: &DidKey, children: &[DidKey]) -> CatalogResult<()> {
        let now = now_ms();
        self.db.write(RowLockMode::Wait, |tx| {
            let parent_did = require_did(tx, parent)?;
            if !parent_did.did_type.is_collection() {
                return Err(CatalogError::UnsupportedOperation(format!(
                    "cannot attach to file {}",
                    parent
                )));
            }
            if !parent_did.is_open {
                return Err(CatalogError::UnsupportedOperation(format!(
                    "{} is closed",
                    parent
                )));
            }

            for child in children {
                if child == parent {
                    return Err(CatalogError::InvalidInput(format!(
                        "cannot attach {} to itself",
                        child
                    )));
                }
                let child_did = require_did(tx, child)?;
                let allowed = match parent_did.did_type {
                    DidType::Dataset => child_did.did_type == DidType::File,
                    DidType::Container => child_did.did_type.is_collection(),
                    DidType::File => false,
                };
                if !allowed {
                    return Err(CatalogError::UnsupportedOperation(format!(
                        "cannot attach {} {} to {} {}",
                        child_did.did_type, child, parent_did.did_type, parent
                    )));
                }
                tx.execute(
                    "INSERT INTO contents (scope, name, child_scope, child_name, did_type, child_type, bytes, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        parent.scope,
                        parent.name,
                        child.scope,
                        child.name,
                        parent_did.did_type.as_str(),
                        child_did.did_type.as_str(),
                        child_did.bytes.map(|b| b as i64),
                        now
                    ],
                )
                .map_err(|e| match map_db_err(e) {
                    CatalogError::Duplicate(_) => CatalogError::Duplicate(format!(
                        "{} is already attached to {}",
                        child, parent
                    )),
                    other => other,
                })?;
            }
            Ok(())
        })?;
        debug!(
            "ReplicaCatalog: attached {} dids to {}",
            children.len(),
            parent
        );
        Ok(())
    }

    pub fn set_did_open(&self, did: &DidKey, is_open: bool) -> CatalogResult<()> {
        let now = now_ms();
        self.db.write(RowLockMode::Wait, |tx| {
            let record = require_did(tx, did)?;
            if record.did_type == DidType::File {
                return Err(CatalogError::UnsupportedOperation(format!(
                    "file {} cannot be opened or closed",
                    did
                )));
            }
            tx.execute(
                "UPDATE dids SET is_open = ?1, updated_at = ?2 WHERE scope = ?3 AND name = ?4",
                params![is_open, now, did.scope, did.name],
            )
            .map_err(map_db_err)?;
            Ok(())
        })
    }

    pub fn set_did_availability(
        &self,
        did: &DidKey,
        availability: DidAvailability,
    ) -> CatalogResult<()> {
        let now = now_ms();
        self.db.write(RowLockMode::Wait, |tx| {
            let updated = tx
                .execute(
                    "UPDATE dids SET availability = ?1, updated_at = ?2 WHERE scope = ?3 AND name = ?4",
                    params![availability.as_str(), now, did.scope, did.name],
                )
                .map_err(map_db_err)?;
            if updated == 0 {
                return Err(CatalogError::DidNotFound(did.to_string()));
            }
            Ok(())
        })
    }

    pub fn get_did(&self, did: &DidKey) -> CatalogResult<DidRecord> {
        self.db.read(|conn| require_did(conn, did))
    }

    pub fn list_child_dids(&self, did: &DidKey) -> CatalogResult<Vec<ContentEntry>> {
        self.db.read(|conn| {
            require_did(conn, did)?;
            list_children(conn, did)
        })
    }
}
