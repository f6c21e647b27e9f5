use crate::{CatalogError, CatalogResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a data identifier: a namespace plus a name unique inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DidKey {
    pub scope: String,
    pub name: String,
}

impl DidKey {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }

    /// Parse the `scope:name` text form.
    pub fn parse(value: &str) -> CatalogResult<Self> {
        let (scope, name) = value
            .split_once(':')
            .ok_or_else(|| CatalogError::InvalidInput(format!("invalid did: {}", value)))?;
        if scope.is_empty() || name.is_empty() {
            return Err(CatalogError::InvalidInput(format!("invalid did: {}", value)));
        }
        Ok(Self::new(scope, name))
    }
}

impl fmt::Display for DidKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

/// A physical copy slot: one file at one storage site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaKey {
    pub scope: String,
    pub name: String,
    pub rse_id: String,
}

impl ReplicaKey {
    pub fn new(did: &DidKey, rse_id: impl Into<String>) -> Self {
        Self {
            scope: did.scope.clone(),
            name: did.name.clone(),
            rse_id: rse_id.into(),
        }
    }

    pub fn did(&self) -> DidKey {
        DidKey::new(self.scope.clone(), self.name.clone())
    }
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.scope, self.name, self.rse_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DidType {
    File,
    Dataset,
    Container,
}

impl DidType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DidType::File => "F",
            DidType::Dataset => "D",
            DidType::Container => "C",
        }
    }

    pub fn from_code(value: &str) -> Option<Self> {
        match value {
            "F" | "FILE" => Some(DidType::File),
            "D" | "DATASET" => Some(DidType::Dataset),
            "C" | "CONTAINER" => Some(DidType::Container),
            _ => None,
        }
    }

    pub fn is_collection(&self) -> bool {
        !matches!(self, DidType::File)
    }
}

impl FromStr for DidType {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        DidType::from_code(value)
            .ok_or_else(|| CatalogError::InvalidInput(format!("unknown did type: {}", value)))
    }
}

impl fmt::Display for DidType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DidType::File => "FILE",
            DidType::Dataset => "DATASET",
            DidType::Container => "CONTAINER",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DidAvailability {
    Available,
    Lost,
    Deleted,
}

impl DidAvailability {
    pub fn as_str(&self) -> &'static str {
        match self {
            DidAvailability::Available => "A",
            DidAvailability::Lost => "L",
            DidAvailability::Deleted => "D",
        }
    }

    pub fn from_code(value: &str) -> Option<Self> {
        match value {
            "A" | "AVAILABLE" => Some(DidAvailability::Available),
            "L" | "LOST" => Some(DidAvailability::Lost),
            "D" | "DELETED" => Some(DidAvailability::Deleted),
            _ => None,
        }
    }
}

impl FromStr for DidAvailability {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        DidAvailability::from_code(value)
            .ok_or_else(|| CatalogError::InvalidInput(format!("unknown availability: {}", value)))
    }
}
