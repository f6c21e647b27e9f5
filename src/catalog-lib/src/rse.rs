use crate::{CatalogError, CatalogResult, ProtocolDesc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const RSE_AVAILABILITY_DELETE: u8 = 1;
pub const RSE_AVAILABILITY_WRITE: u8 = 2;
pub const RSE_AVAILABILITY_READ: u8 = 4;
pub const RSE_AVAILABILITY_ALL: u8 =
    RSE_AVAILABILITY_DELETE | RSE_AVAILABILITY_WRITE | RSE_AVAILABILITY_READ;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RseType {
    Disk,
    Tape,
}

impl Default for RseType {
    fn default() -> Self {
        RseType::Disk
    }
}

/// Storage site description as provided by the site registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RseInfo {
    pub id: String,
    #[serde(alias = "rse")]
    pub name: String,
    pub deterministic: bool,
    pub staging_area: bool,
    pub availability: u8,
    pub rse_type: RseType,
    pub protocols: Vec<ProtocolDesc>,
}

impl Default for RseInfo {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            deterministic: true,
            staging_area: false,
            availability: RSE_AVAILABILITY_ALL,
            rse_type: RseType::Disk,
            protocols: Vec::new(),
        }
    }
}

impl RseInfo {
    pub fn can_read(&self) -> bool {
        self.availability & RSE_AVAILABILITY_READ != 0
    }

    pub fn can_write(&self) -> bool {
        self.availability & RSE_AVAILABILITY_WRITE != 0
    }

    pub fn can_delete(&self) -> bool {
        self.availability & RSE_AVAILABILITY_DELETE != 0
    }
}

pub trait RseRegistry: Send + Sync {
    fn get_rse_info(&self, rse: &str) -> CatalogResult<RseInfo>;
    fn get_rse_info_by_id(&self, rse_id: &str) -> CatalogResult<RseInfo>;
    fn list_rses(&self) -> CatalogResult<Vec<RseInfo>>;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RseRegistryFile {
    #[serde(alias = "sites")]
    rses: Vec<RseInfo>,
}

/// Registry backed by a fixed list of sites, usually loaded from a json file.
#[derive(Debug, Clone, Default)]
pub struct StaticRseRegistry {
    rses: Vec<RseInfo>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<String, usize>,
}

impl StaticRseRegistry {
    pub fn new(rses: Vec<RseInfo>) -> CatalogResult<Self> {
        let rses: Vec<RseInfo> = rses
            .into_iter()
            .map(|mut rse| {
                if rse.id.is_empty() {
                    rse.id = rse.name.clone();
                }
                rse
            })
            .collect();

        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();
        let mut access_points: HashMap<String, String> = HashMap::new();
        for (index, rse) in rses.iter().enumerate() {
            if rse.name.is_empty() {
                return Err(CatalogError::InvalidInput(format!(
                    "rse #{} has no name",
                    index
                )));
            }
            if by_name.insert(rse.name.clone(), index).is_some() {
                return Err(CatalogError::InvalidInput(format!(
                    "duplicate rse name: {}",
                    rse.name
                )));
            }
            if by_id.insert(rse.id.clone(), index).is_some() {
                return Err(CatalogError::InvalidInput(format!(
                    "duplicate rse id: {}",
                    rse.id
                )));
            }
            if rse.staging_area {
                continue;
            }
            // identical access points make pfn to site matching ambiguous
            for protocol in rse.protocols.iter() {
                let ap = protocol.access_point();
                if let Some(other) = access_points.insert(ap.clone(), rse.name.clone()) {
                    if other != rse.name {
                        warn!(
                            "StaticRseRegistry: access point {} shared by {} and {}",
                            ap, other, rse.name
                        );
                    }
                }
            }
        }

        Ok(Self {
            rses,
            by_name,
            by_id,
        })
    }

    pub fn load_from_file(path: &Path) -> CatalogResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CatalogError::IoError(format!("read {} failed: {}", path.display(), e))
        })?;
        let file: RseRegistryFile = serde_json::from_str(&content).map_err(|e| {
            CatalogError::InvalidInput(format!("parse {} failed: {}", path.display(), e))
        })?;
        info!(
            "StaticRseRegistry: loaded {} rses from {}",
            file.rses.len(),
            path.display()
        );
        Self::new(file.rses)
    }

    pub fn len(&self) -> usize {
        self.rses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rses.is_empty()
    }
}

impl RseRegistry for StaticRseRegistry {
    fn get_rse_info(&self, rse: &str) -> CatalogResult<RseInfo> {
        self.by_name
            .get(rse)
            .map(|index| self.rses[*index].clone())
            .ok_or_else(|| CatalogError::RseNotFound(rse.to_string()))
    }

    fn get_rse_info_by_id(&self, rse_id: &str) -> CatalogResult<RseInfo> {
        self.by_id
            .get(rse_id)
            .map(|index| self.rses[*index].clone())
            .ok_or_else(|| CatalogError::RseNotFound(format!("rse_id {}", rse_id)))
    }

    fn list_rses(&self) -> CatalogResult<Vec<RseInfo>> {
        Ok(self.rses.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_availability_bits() {
        let mut rse = RseInfo::default();
        assert!(rse.can_read() && rse.can_write() && rse.can_delete());
        rse.availability = RSE_AVAILABILITY_READ | RSE_AVAILABILITY_DELETE;
        assert!(!rse.can_write());
        assert!(rse.can_delete());
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let a = RseInfo {
            name: "SITE_A".to_string(),
            ..Default::default()
        };
        let err = StaticRseRegistry::new(vec![a.clone(), a]).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidInput(_)));
    }

    #[test]
    fn test_load_registry_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rses.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "rses": [
                    {{"id": "a1", "rse": "SITE_A", "availability": 7,
                      "protocols": [{{"scheme": "srm", "hostname": "se-a.example.org", "port": 8443,
                                      "prefix": "/pnfs/a/", "web_service_path": "/srm/managerv2?SFN="}}]}},
                    {{"name": "SITE_ND", "deterministic": false}}
                ]
            }}"#
        )
        .unwrap();

        let registry = StaticRseRegistry::load_from_file(&path).unwrap();
        assert_eq!(registry.len(), 2);
        let a = registry.get_rse_info("SITE_A").unwrap();
        assert_eq!(a.id, "a1");
        assert_eq!(a.protocols[0].port, 8443);
        assert_eq!(registry.get_rse_info_by_id("a1").unwrap().name, "SITE_A");

        // id falls back to the name
        let nd = registry.get_rse_info_by_id("SITE_ND").unwrap();
        assert!(!nd.deterministic);
        assert!(registry.get_rse_info("SITE_X").unwrap_err().is_not_found());
    }
}
