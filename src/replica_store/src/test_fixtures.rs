use crate::{CatalogConfig, NewReplica, ReplicaCatalog};
use catalog_lib::{
    ProtocolDesc, RseInfo, StaticRseRegistry, RSE_AVAILABILITY_DELETE, RSE_AVAILABILITY_READ,
    RSE_AVAILABILITY_WRITE,
};
use std::sync::Arc;
use tempfile::TempDir;

pub const SITE_A: &str = "SITE_A";
pub const SITE_B: &str = "SITE_B";
pub const SITE_ND: &str = "SITE_ND";
pub const SITE_STAGE: &str = "SITE_STAGE";
pub const SITE_RO: &str = "SITE_RO";
pub const SITE_NODELETE: &str = "SITE_NODELETE";

pub fn srm_protocol(hostname: &str, prefix: &str) -> ProtocolDesc {
    ProtocolDesc {
        scheme: "srm".to_string(),
        hostname: hostname.to_string(),
        port: 8443,
        prefix: prefix.to_string(),
        web_service_path: Some("/srm/managerv2?SFN=".to_string()),
        ..Default::default()
    }
}

pub fn test_rses() -> Vec<RseInfo> {
    vec![
        RseInfo {
            id: "rse-a".to_string(),
            name: SITE_A.to_string(),
            protocols: vec![srm_protocol("se-a.example.org", "/pnfs/site-a/data/")],
            ..Default::default()
        },
        RseInfo {
            id: "rse-b".to_string(),
            name: SITE_B.to_string(),
            protocols: vec![ProtocolDesc {
                scheme: "root".to_string(),
                hostname: "se-b.example.org".to_string(),
                port: 1094,
                prefix: "/store/".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        },
        RseInfo {
            id: "rse-nd".to_string(),
            name: SITE_ND.to_string(),
            deterministic: false,
            protocols: vec![srm_protocol("se-nd.example.org", "/nd/")],
            ..Default::default()
        },
        RseInfo {
            id: "rse-stage".to_string(),
            name: SITE_STAGE.to_string(),
            staging_area: true,
            protocols: vec![srm_protocol("se-stage.example.org", "/stage/")],
            ..Default::default()
        },
        RseInfo {
            id: "rse-ro".to_string(),
            name: SITE_RO.to_string(),
            availability: RSE_AVAILABILITY_READ | RSE_AVAILABILITY_DELETE,
            protocols: vec![srm_protocol("se-ro.example.org", "/ro/")],
            ..Default::default()
        },
        RseInfo {
            id: "rse-nodelete".to_string(),
            name: SITE_NODELETE.to_string(),
            availability: RSE_AVAILABILITY_READ | RSE_AVAILABILITY_WRITE,
            protocols: vec![srm_protocol("se-nodelete.example.org", "/keep/")],
            ..Default::default()
        },
    ]
}

pub fn create_test_catalog_with(config: CatalogConfig) -> (ReplicaCatalog, TempDir) {
    let tmp_dir = TempDir::new().unwrap();
    let config = CatalogConfig {
        db_path: tmp_dir
            .path()
            .join("catalog.db")
            .to_string_lossy()
            .to_string(),
        ..config
    };
    let registry = StaticRseRegistry::new(test_rses()).unwrap();
    let catalog = ReplicaCatalog::open(config, Arc::new(registry)).unwrap();
    (catalog, tmp_dir)
}

pub fn create_test_catalog() -> (ReplicaCatalog, TempDir) {
    create_test_catalog_with(CatalogConfig::default())
}

pub fn new_file(scope: &str, name: &str, bytes: u64) -> NewReplica {
    NewReplica {
        adler32: Some("0cc737eb".to_string()),
        ..NewReplica::new(scope, name, bytes)
    }
}
