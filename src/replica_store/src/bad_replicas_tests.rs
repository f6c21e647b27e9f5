#[cfg(test)]
mod tests {
    use crate::test_fixtures::*;
    use crate::{
        BadFilesStatus, BadReplicaFilter, CatalogConfig, NewReplica, ReplicaCatalog, ReplicaState,
        UNKNOWN_RSE,
    };
    use catalog_lib::{
        CatalogError, DidKey, ProtocolDesc, RseInfo, RseProtocol, ShardSpec, StandardProtocol,
        StaticRseRegistry,
    };
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn pfn_at_a(name: &str) -> String {
        StandardProtocol::new(srm_protocol("se-a.example.org", "/pnfs/site-a/data/"))
            .lfn_to_pfn("data", name, None)
    }

    fn catalog_with_files() -> (ReplicaCatalog, tempfile::TempDir) {
        let (catalog, tmp) = create_test_catalog();
        catalog
            .add_replicas(SITE_A, &[new_file("data", "f1", 10), new_file("data", "f2", 20)], "root")
            .unwrap();
        (catalog, tmp)
    }

    #[test]
    fn test_declare_bad_marks_replica() {
        let (catalog, _tmp) = catalog_with_files();
        let unknown = catalog
            .declare_bad_file_replicas(&[pfn_at_a("f1")], None, "checksum mismatch", "ops", BadFilesStatus::Bad)
            .unwrap();
        assert!(unknown.is_empty());

        let replica = catalog.get_replica(SITE_A, &DidKey::new("data", "f1")).unwrap();
        assert_eq!(replica.state, ReplicaState::Bad);

        let bad = catalog.list_bad_replicas(10, &ShardSpec::unsharded()).unwrap();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].name, "f1");
        assert_eq!(bad[0].rse, SITE_A);
        assert_eq!(bad[0].rse_id, "rse-a");

        let entries = catalog
            .list_bad_replicas_status(&BadReplicaFilter::default())
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, BadFilesStatus::Bad);
        assert_eq!(entries[0].reason.as_deref(), Some("checksum mismatch"));
        assert_eq!(entries[0].account, "ops");
        assert_eq!(entries[0].rse, SITE_A);
    }

    #[test]
    fn test_declare_suspicious_keeps_replica_state() {
        let (catalog, _tmp) = catalog_with_files();
        catalog
            .declare_bad_file_replicas(&[pfn_at_a("f2")], Some(SITE_A), "slow", "ops", BadFilesStatus::Suspicious)
            .unwrap();
        let replica = catalog.get_replica(SITE_A, &DidKey::new("data", "f2")).unwrap();
        assert_eq!(replica.state, ReplicaState::Available);

        let filter = BadReplicaFilter {
            state: Some(BadFilesStatus::Suspicious),
            rse: Some(SITE_A.to_string()),
            ..Default::default()
        };
        assert_eq!(catalog.list_bad_replicas_status(&filter).unwrap().len(), 1);
        assert_eq!(
            catalog.list_bad_replicas_pfns(&filter).unwrap(),
            vec![pfn_at_a("f2")]
        );
    }

    #[test]
    fn test_unresolved_pfns_are_reported() {
        let (catalog, _tmp) = catalog_with_files();
        let not_registered = pfn_at_a("ghost");
        let foreign = "srm://elsewhere.example.org/data/x/f9".to_string();
        let unknown = catalog
            .declare_bad_file_replicas(
                &[pfn_at_a("f1"), not_registered, foreign],
                None,
                "lost",
                "ops",
                BadFilesStatus::Bad,
            )
            .unwrap();
        assert_eq!(unknown[SITE_A].len(), 1);
        assert!(unknown[SITE_A][0].ends_with("/ghost"));
        assert_eq!(
            unknown[UNKNOWN_RSE],
            vec!["srm://elsewhere.example.org/data/x/f9".to_string()]
        );
        // the resolvable one was still declared
        assert_eq!(
            catalog.get_replica(SITE_A, &DidKey::new("data", "f1")).unwrap().state,
            ReplicaState::Bad
        );
    }

    #[test]
    fn test_only_bad_or_suspicious_can_be_declared() {
        let (catalog, _tmp) = catalog_with_files();
        let err = catalog
            .declare_bad_file_replicas(&[pfn_at_a("f1")], None, "x", "ops", BadFilesStatus::Recovered)
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidInput(_)));
    }

    #[test]
    fn test_shared_access_point_is_ambiguous() {
        let tmp = tempfile::TempDir::new().unwrap();
        let twin = |name: &str| RseInfo {
            name: name.to_string(),
            protocols: vec![srm_protocol("shared.example.org", "/data/")],
            ..Default::default()
        };
        let registry = StaticRseRegistry::new(vec![twin("TWIN_1"), twin("TWIN_2")]).unwrap();
        let config = CatalogConfig {
            db_path: tmp.path().join("catalog.db").to_string_lossy().to_string(),
            ..CatalogConfig::default()
        };
        let catalog = ReplicaCatalog::open(config, Arc::new(registry)).unwrap();

        let err = catalog
            .declare_bad_file_replicas(
                &["srm://shared.example.org/data/data/aa/bb/f1".to_string()],
                None,
                "x",
                "ops",
                BadFilesStatus::Bad,
            )
            .unwrap_err();
        assert!(matches!(err, CatalogError::Ambiguous(_)));

        // the hint settles it
        let unknown = catalog
            .declare_bad_file_replicas(
                &["srm://shared.example.org/data/data/aa/bb/f1".to_string()],
                Some("TWIN_1"),
                "x",
                "ops",
                BadFilesStatus::Bad,
            )
            .unwrap();
        assert_eq!(unknown["TWIN_1"].len(), 1);
    }

    #[test]
    fn test_non_deterministic_declaration_uses_path() {
        let (catalog, _tmp) = create_test_catalog();
        let pfn = "srm://se-nd.example.org/nd/run3/f5".to_string();
        let file = NewReplica {
            pfn: Some(pfn.clone()),
            ..new_file("data", "f5", 10)
        };
        catalog.add_replica(SITE_ND, file, "root").unwrap();
        let unknown = catalog
            .declare_bad_file_replicas(&[pfn], None, "x", "ops", BadFilesStatus::Bad)
            .unwrap();
        assert!(unknown.is_empty());
        assert_eq!(
            catalog.get_replica(SITE_ND, &DidKey::new("data", "f5")).unwrap().state,
            ReplicaState::Bad
        );
    }

    #[test]
    fn test_history_reconciliation() {
        let (catalog, _tmp) = catalog_with_files();
        catalog
            .declare_bad_file_replicas(&[pfn_at_a("f1"), pfn_at_a("f2")], None, "x", "ops", BadFilesStatus::Bad)
            .unwrap();

        let history = catalog
            .list_bad_replicas_history(10, &ShardSpec::unsharded())
            .unwrap();
        assert_eq!(history["rse-a"].len(), 2);

        // f1 was recovered, f2 was deleted
        catalog
            .update_replica_state(SITE_A, &DidKey::new("data", "f1"), ReplicaState::Available)
            .unwrap();
        catalog
            .delete_replicas(SITE_A, &[DidKey::new("data", "f2")], false)
            .unwrap();
        catalog
            .update_bad_replicas_history(&history["rse-a"], "rse-a")
            .unwrap();

        let entries = catalog
            .list_bad_replicas_status(&BadReplicaFilter::default())
            .unwrap();
        let state_of = |name: &str| {
            entries
                .iter()
                .find(|e| e.name == name)
                .map(|e| e.state)
                .unwrap()
        };
        assert_eq!(state_of("f1"), BadFilesStatus::Recovered);
        assert_eq!(state_of("f2"), BadFilesStatus::Deleted);
        assert!(catalog
            .list_bad_replicas_history(10, &ShardSpec::unsharded())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_summary_groups_by_site_and_status() {
        let (catalog, _tmp) = catalog_with_files();
        catalog
            .declare_bad_file_replicas(&[pfn_at_a("f1")], None, "broken", "ops", BadFilesStatus::Bad)
            .unwrap();
        catalog
            .declare_bad_file_replicas(&[pfn_at_a("f2")], None, "broken", "ops", BadFilesStatus::Suspicious)
            .unwrap();

        let summary = catalog
            .get_bad_replicas_summary(Some(&[SITE_A.to_string()]), None, None)
            .unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].rse, SITE_A);
        assert_eq!(summary[0].reason.as_deref(), Some("broken"));
        assert_eq!(summary[0].counts[&BadFilesStatus::Bad], 1);
        assert_eq!(summary[0].counts[&BadFilesStatus::Suspicious], 1);
        assert_eq!(summary[0].day.len(), 10);

        assert!(catalog
            .get_bad_replicas_summary(Some(&[SITE_B.to_string()]), None, None)
            .unwrap()
            .is_empty());
    }

    // ==================== Physical names ====================

    #[test]
    fn test_declare_on_ipv6_site() {
        let tmp = tempfile::TempDir::new().unwrap();
        let desc = ProtocolDesc {
            scheme: "root".to_string(),
            hostname: "[2001:db8::1]".to_string(),
            port: 1094,
            prefix: "/store/".to_string(),
            ..Default::default()
        };
        let registry = StaticRseRegistry::new(vec![RseInfo {
            name: "SITE_V6".to_string(),
            protocols: vec![desc.clone()],
            ..Default::default()
        }])
        .unwrap();
        let config = CatalogConfig {
            db_path: tmp.path().join("catalog.db").to_string_lossy().to_string(),
            ..CatalogConfig::default()
        };
        let catalog = ReplicaCatalog::open(config, Arc::new(registry)).unwrap();
        catalog.add_replica("SITE_V6", new_file("data", "f1", 10), "root").unwrap();

        let pfn = StandardProtocol::new(desc).lfn_to_pfn("data", "f1", None);
        let found = catalog.get_did_from_pfns(&[pfn.clone()], "SITE_V6").unwrap();
        assert_eq!(found[&pfn], DidKey::new("data", "f1"));

        let unknown = catalog
            .declare_bad_file_replicas(&[pfn], None, "x", "ops", BadFilesStatus::Bad)
            .unwrap();
        assert!(unknown.is_empty());
        assert_eq!(
            catalog.get_replica("SITE_V6", &DidKey::new("data", "f1")).unwrap().state,
            ReplicaState::Bad
        );
    }

    // ==================== Sharding ====================

    #[test]
    fn test_sharded_bad_listings_partition_the_whole() {
        let (catalog, _tmp) = create_test_catalog();
        let files: Vec<_> = (0..30).map(|i| new_file("data", &format!("bad_{}", i), 1)).collect();
        catalog.add_replicas(SITE_A, &files, "root").unwrap();
        let pfns: Vec<String> = files.iter().map(|f| pfn_at_a(&f.name)).collect();
        let unknown = catalog
            .declare_bad_file_replicas(&pfns, None, "x", "ops", BadFilesStatus::Bad)
            .unwrap();
        assert!(unknown.is_empty());

        let all: BTreeSet<String> = catalog
            .list_bad_replicas(100, &ShardSpec::unsharded())
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(all.len(), 30);
        let all_history: BTreeSet<String> = catalog
            .list_bad_replicas_history(100, &ShardSpec::unsharded())
            .unwrap()
            .into_values()
            .flatten()
            .map(|d| d.name)
            .collect();
        assert_eq!(all_history, all);

        let total_workers = 4;
        let mut union = BTreeSet::new();
        let mut union_history = BTreeSet::new();
        let mut listed = 0;
        let mut listed_history = 0;
        for worker in 1..total_workers {
            let shard = ShardSpec::new(worker, total_workers);
            for replica in catalog.list_bad_replicas(100, &shard).unwrap() {
                assert!(shard.contains(&replica.name));
                listed += 1;
                union.insert(replica.name);
            }
            for did in catalog
                .list_bad_replicas_history(100, &shard)
                .unwrap()
                .into_values()
                .flatten()
            {
                assert!(shard.contains(&did.name));
                listed_history += 1;
                union_history.insert(did.name);
            }
        }
        // no name listed twice, none left out
        assert_eq!(listed, all.len());
        assert_eq!(union, all);
        assert_eq!(listed_history, all.len());
        assert_eq!(union_history, all);
    }
}
