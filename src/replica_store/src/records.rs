use catalog_lib::{CatalogError, DidAvailability, DidKey, DidType, ReplicaKey};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stored value of the OBSOLETE tombstone (the epoch).
pub const OBSOLETE_MS: i64 = 0;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    Available,
    Unavailable,
    Copying,
    Bad,
    BeingDeleted,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaState::Available => "A",
            ReplicaState::Unavailable => "U",
            ReplicaState::Copying => "C",
            ReplicaState::Bad => "B",
            ReplicaState::BeingDeleted => "D",
        }
    }

    pub fn from_code(value: &str) -> Option<Self> {
        match value {
            "A" | "AVAILABLE" => Some(ReplicaState::Available),
            "U" | "UNAVAILABLE" => Some(ReplicaState::Unavailable),
            "C" | "COPYING" => Some(ReplicaState::Copying),
            "B" | "BAD" => Some(ReplicaState::Bad),
            "D" | "BEING_DELETED" => Some(ReplicaState::BeingDeleted),
            _ => None,
        }
    }
}

impl FromStr for ReplicaState {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ReplicaState::from_code(value)
            .ok_or_else(|| CatalogError::InvalidInput(format!("unknown replica state: {}", value)))
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicaState::Available => "AVAILABLE",
            ReplicaState::Unavailable => "UNAVAILABLE",
            ReplicaState::Copying => "COPYING",
            ReplicaState::Bad => "BAD",
            ReplicaState::BeingDeleted => "BEING_DELETED",
        };
        f.write_str(name)
    }
}

impl ToSql for ReplicaState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for ReplicaState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        ReplicaState::from_code(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BadFilesStatus {
    Bad,
    Suspicious,
    Recovered,
    Deleted,
    TemporaryUnavailable,
}

impl BadFilesStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BadFilesStatus::Bad => "B",
            BadFilesStatus::Suspicious => "S",
            BadFilesStatus::Recovered => "R",
            BadFilesStatus::Deleted => "D",
            BadFilesStatus::TemporaryUnavailable => "T",
        }
    }

    pub fn from_code(value: &str) -> Option<Self> {
        match value {
            "B" | "BAD" => Some(BadFilesStatus::Bad),
            "S" | "SUSPICIOUS" => Some(BadFilesStatus::Suspicious),
            "R" | "RECOVERED" => Some(BadFilesStatus::Recovered),
            "D" | "DELETED" => Some(BadFilesStatus::Deleted),
            "T" | "TEMPORARY_UNAVAILABLE" => Some(BadFilesStatus::TemporaryUnavailable),
            _ => None,
        }
    }
}

impl FromStr for BadFilesStatus {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        BadFilesStatus::from_code(value)
            .ok_or_else(|| CatalogError::InvalidInput(format!("unknown bad file status: {}", value)))
    }
}

impl fmt::Display for BadFilesStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BadFilesStatus::Bad => "BAD",
            BadFilesStatus::Suspicious => "SUSPICIOUS",
            BadFilesStatus::Recovered => "RECOVERED",
            BadFilesStatus::Deleted => "DELETED",
            BadFilesStatus::TemporaryUnavailable => "TEMPORARY_UNAVAILABLE",
        };
        f.write_str(name)
    }
}

impl ToSql for BadFilesStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for BadFilesStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        BadFilesStatus::from_code(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

/// Earliest moment a replica may be garbage collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tombstone {
    /// Collect as soon as possible, ahead of every dated tombstone.
    Obsolete,
    At(DateTime<Utc>),
}

impl Tombstone {
    pub fn from_millis(ms: i64) -> Self {
        if ms == OBSOLETE_MS {
            Tombstone::Obsolete
        } else {
            Tombstone::At(ms_to_datetime(ms))
        }
    }

    pub fn to_millis(&self) -> i64 {
        match self {
            Tombstone::Obsolete => OBSOLETE_MS,
            Tombstone::At(at) => at.timestamp_millis(),
        }
    }

    pub fn is_obsolete(&self) -> bool {
        matches!(self, Tombstone::Obsolete)
    }
}

fn conversion_error(index: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        Type::Text,
        Box::new(CatalogError::Internal(msg)),
    )
}

pub(crate) fn did_type_at(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<DidType> {
    let value: String = row.get(index)?;
    DidType::from_code(&value)
        .ok_or_else(|| conversion_error(index, format!("unknown did type {}", value)))
}

pub(crate) fn availability_at(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<DidAvailability> {
    let value: String = row.get(index)?;
    DidAvailability::from_code(&value)
        .ok_or_else(|| conversion_error(index, format!("unknown availability {}", value)))
}

pub(crate) fn optional_time_at(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<i64> = row.get(index)?;
    Ok(value.map(ms_to_datetime))
}

pub(crate) fn time_at(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: i64 = row.get(index)?;
    Ok(ms_to_datetime(value))
}

pub(crate) fn u64_at(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(index)?;
    Ok(value.max(0) as u64)
}

/// A file DID as registered in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalFile {
    pub scope: String,
    pub name: String,
    pub bytes: u64,
    pub md5: Option<String>,
    pub adler32: Option<String>,
    pub account: String,
    pub availability: DidAvailability,
    pub created_at: DateTime<Utc>,
    pub accessed_at: Option<DateTime<Utc>>,
}

impl LogicalFile {
    pub fn key(&self) -> DidKey {
        DidKey::new(self.scope.clone(), self.name.clone())
    }
}

/// Any DID row: file, dataset or container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidRecord {
    pub scope: String,
    pub name: String,
    pub did_type: DidType,
    pub account: String,
    pub is_open: bool,
    pub availability: DidAvailability,
    pub bytes: Option<u64>,
    pub md5: Option<String>,
    pub adler32: Option<String>,
    pub created_at: DateTime<Utc>,
    pub accessed_at: Option<DateTime<Utc>>,
}

impl DidRecord {
    pub const COLUMNS: &'static str =
        "scope, name, did_type, account, is_open, availability, bytes, md5, adler32, created_at, accessed_at";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let bytes: Option<i64> = row.get(6)?;
        Ok(Self {
            scope: row.get(0)?,
            name: row.get(1)?,
            did_type: did_type_at(row, 2)?,
            account: row.get(3)?,
            is_open: row.get(4)?,
            availability: availability_at(row, 5)?,
            bytes: bytes.map(|b| b.max(0) as u64),
            md5: row.get(7)?,
            adler32: row.get(8)?,
            created_at: time_at(row, 9)?,
            accessed_at: optional_time_at(row, 10)?,
        })
    }

    pub fn key(&self) -> DidKey {
        DidKey::new(self.scope.clone(), self.name.clone())
    }

    pub fn into_logical_file(self) -> LogicalFile {
        LogicalFile {
            scope: self.scope,
            name: self.name,
            bytes: self.bytes.unwrap_or(0),
            md5: self.md5,
            adler32: self.adler32,
            account: self.account,
            availability: self.availability,
            created_at: self.created_at,
            accessed_at: self.accessed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub scope: String,
    pub name: String,
    pub rse_id: String,
    pub bytes: u64,
    pub md5: Option<String>,
    pub adler32: Option<String>,
    pub path: Option<String>,
    pub state: ReplicaState,
    pub lock_cnt: u64,
    pub tombstone: Option<Tombstone>,
    pub accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReplicaRecord {
    pub const COLUMNS: &'static str = "scope, name, rse_id, bytes, md5, adler32, path, state, lock_cnt, tombstone, accessed_at, created_at, updated_at";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let tombstone: Option<i64> = row.get(9)?;
        Ok(Self {
            scope: row.get(0)?,
            name: row.get(1)?,
            rse_id: row.get(2)?,
            bytes: u64_at(row, 3)?,
            md5: row.get(4)?,
            adler32: row.get(5)?,
            path: row.get(6)?,
            state: row.get(7)?,
            lock_cnt: u64_at(row, 8)?,
            tombstone: tombstone.map(Tombstone::from_millis),
            accessed_at: optional_time_at(row, 10)?,
            created_at: time_at(row, 11)?,
            updated_at: time_at(row, 12)?,
        })
    }

    pub fn key(&self) -> ReplicaKey {
        ReplicaKey {
            scope: self.scope.clone(),
            name: self.name.clone(),
            rse_id: self.rse_id.clone(),
        }
    }

    pub fn did(&self) -> DidKey {
        DidKey::new(self.scope.clone(), self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadReplicaEntry {
    pub id: i64,
    pub scope: String,
    pub name: String,
    pub rse_id: String,
    pub rse: String,
    pub reason: Option<String>,
    pub state: BadFilesStatus,
    pub account: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-site aggregate for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionReplica {
    pub scope: String,
    pub name: String,
    pub rse_id: String,
    pub rse: String,
    pub did_type: DidType,
    pub bytes: u64,
    pub length: u64,
    pub available_bytes: u64,
    pub available_replicas_cnt: u64,
    pub state: ReplicaState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accessed_at: Option<DateTime<Utc>>,
}

impl CollectionReplica {
    pub const COLUMNS: &'static str = "scope, name, rse_id, did_type, bytes, length, available_bytes, available_replicas_cnt, state, created_at, updated_at, accessed_at";

    /// Maps a row selected with [`Self::COLUMNS`]; `rse` is filled in by the caller.
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            scope: row.get(0)?,
            name: row.get(1)?,
            rse_id: row.get(2)?,
            rse: String::new(),
            did_type: did_type_at(row, 3)?,
            bytes: u64_at(row, 4)?,
            length: u64_at(row, 5)?,
            available_bytes: u64_at(row, 6)?,
            available_replicas_cnt: u64_at(row, 7)?,
            state: row.get(8)?,
            created_at: time_at(row, 9)?,
            updated_at: time_at(row, 10)?,
            accessed_at: optional_time_at(row, 11)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        for state in [
            ReplicaState::Available,
            ReplicaState::Unavailable,
            ReplicaState::Copying,
            ReplicaState::Bad,
            ReplicaState::BeingDeleted,
        ] {
            assert_eq!(ReplicaState::from_code(state.as_str()), Some(state));
            assert_eq!(state.to_string().parse::<ReplicaState>().unwrap(), state);
        }
        assert_eq!(
            "TEMPORARY_UNAVAILABLE".parse::<BadFilesStatus>().unwrap(),
            BadFilesStatus::TemporaryUnavailable
        );
        assert_eq!(BadFilesStatus::from_code("S"), Some(BadFilesStatus::Suspicious));
        assert!(matches!(
            "available".parse::<ReplicaState>(),
            Err(CatalogError::InvalidInput(_))
        ));
        assert!("Q".parse::<BadFilesStatus>().is_err());
    }

    #[test]
    fn test_tombstone_millis() {
        assert!(Tombstone::from_millis(OBSOLETE_MS).is_obsolete());
        let at = ms_to_datetime(1_700_000_000_000);
        let tombstone = Tombstone::At(at);
        assert_eq!(tombstone.to_millis(), 1_700_000_000_000);
        assert_eq!(Tombstone::from_millis(tombstone.to_millis()), tombstone);
    }
}
