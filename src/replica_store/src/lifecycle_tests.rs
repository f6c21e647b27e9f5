#[cfg(test)]
mod tests {
    use crate::test_fixtures::*;
    use crate::{
        LockCallbacks, ReplicaCatalog, ReplicaPathUpdate, ReplicaState, ReplicaStateUpdate,
        ReplicaTouch, Tombstone,
    };
    use catalog_lib::{CatalogError, CatalogResult, DidKey, DidType};
    use chrono::{TimeZone, Utc};
    use rusqlite::Transaction;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingLocks {
        calls: Mutex<Vec<(String, String, bool)>>,
    }

    impl LockCallbacks for RecordingLocks {
        fn on_transfer_succeeded(
            &self,
            _tx: &Transaction<'_>,
            file: &DidKey,
            rse_id: &str,
            _nowait: bool,
        ) -> CatalogResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push((file.to_string(), rse_id.to_string(), true));
            Ok(())
        }

        fn on_transfer_failed(
            &self,
            _tx: &Transaction<'_>,
            file: &DidKey,
            rse_id: &str,
            _nowait: bool,
        ) -> CatalogResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push((file.to_string(), rse_id.to_string(), false));
            Ok(())
        }
    }

    fn catalog_with_file(scope: &str, name: &str) -> (ReplicaCatalog, tempfile::TempDir, DidKey) {
        let (catalog, tmp) = create_test_catalog();
        catalog
            .add_replica(SITE_A, new_file(scope, name, 100), "root")
            .unwrap();
        (catalog, tmp, DidKey::new(scope, name))
    }

    // ==================== State transitions ====================

    #[test]
    fn test_state_update_invokes_lock_callbacks() {
        let (catalog, _tmp) = create_test_catalog();
        let locks = Arc::new(RecordingLocks::default());
        let catalog = catalog.with_lock_callbacks(locks.clone());
        catalog
            .add_replica(SITE_A, new_file("data", "f1", 100), "root")
            .unwrap();
        let did = DidKey::new("data", "f1");

        catalog
            .update_replica_state(SITE_A, &did, ReplicaState::Unavailable)
            .unwrap();
        catalog
            .update_replica_state(SITE_A, &did, ReplicaState::Available)
            .unwrap();
        catalog
            .update_replica_state(SITE_A, &did, ReplicaState::Copying)
            .unwrap();

        let calls = locks.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("data:f1".to_string(), "rse-a".to_string(), false),
                ("data:f1".to_string(), "rse-a".to_string(), true),
            ]
        );
        assert_eq!(
            catalog.get_replica(SITE_A, &did).unwrap().state,
            ReplicaState::Copying
        );
    }

    #[test]
    fn test_being_deleted_marks_obsolete() {
        let (catalog, _tmp, did) = catalog_with_file("data", "f1");
        catalog
            .update_replica_state(SITE_A, &did, ReplicaState::BeingDeleted)
            .unwrap();
        let replica = catalog.get_replica(SITE_A, &did).unwrap();
        assert_eq!(replica.state, ReplicaState::BeingDeleted);
        assert_eq!(replica.tombstone, Some(Tombstone::Obsolete));

        // BEING_DELETED rows are not handed out as live replicas
        assert!(catalog
            .get_and_lock_file_replicas(&did, false, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_locked_replica_cannot_be_deleted() {
        let (catalog, _tmp, did) = catalog_with_file("data", "f1");
        assert!(catalog.update_replica_lock_counter(SITE_A, &did, 1).unwrap());
        let err = catalog
            .update_replica_state(SITE_A, &did, ReplicaState::BeingDeleted)
            .unwrap_err();
        assert!(matches!(err, CatalogError::UnsupportedOperation(_)));
        let replica = catalog.get_replica(SITE_A, &did).unwrap();
        assert_eq!(replica.state, ReplicaState::Available);
        assert!(replica.tombstone.is_none());
    }

    #[test]
    fn test_batch_update_is_atomic() {
        let (catalog, _tmp, did) = catalog_with_file("data", "f1");
        let updates = vec![
            ReplicaStateUpdate::new(SITE_A, &did, ReplicaState::Unavailable),
            ReplicaStateUpdate::new(SITE_A, &DidKey::new("data", "missing"), ReplicaState::Unavailable),
        ];
        let err = catalog.update_replicas_states(&updates, false).unwrap_err();
        assert!(matches!(err, CatalogError::ReplicaNotFound(_)));
        assert_eq!(
            catalog.get_replica(SITE_A, &did).unwrap().state,
            ReplicaState::Available
        );
    }

    #[test]
    fn test_state_update_with_path() {
        let (catalog, _tmp, did) = catalog_with_file("data", "f1");
        let update = ReplicaStateUpdate {
            path: Some("moved/f1".to_string()),
            ..ReplicaStateUpdate::new(SITE_A, &did, ReplicaState::Bad)
        };
        catalog.update_replicas_states(&[update], true).unwrap();
        let replica = catalog.get_replica(SITE_A, &did).unwrap();
        assert_eq!(replica.state, ReplicaState::Bad);
        assert_eq!(replica.path.as_deref(), Some("moved/f1"));
    }

    // ==================== Lock counter ====================

    #[test]
    fn test_lock_counter_moves_tombstone() {
        let (catalog, _tmp, did) = catalog_with_file("data", "f1");
        assert!(catalog.update_replica_lock_counter(SITE_A, &did, 2).unwrap());
        let replica = catalog.get_replica(SITE_A, &did).unwrap();
        assert_eq!(replica.lock_cnt, 2);
        assert!(replica.tombstone.is_none());

        assert!(catalog.update_replica_lock_counter(SITE_A, &did, -1).unwrap());
        assert!(catalog.get_replica(SITE_A, &did).unwrap().tombstone.is_none());

        assert!(catalog.update_replica_lock_counter(SITE_A, &did, -1).unwrap());
        let replica = catalog.get_replica(SITE_A, &did).unwrap();
        assert_eq!(replica.lock_cnt, 0);
        assert!(matches!(replica.tombstone, Some(Tombstone::At(_))));
    }

    #[test]
    fn test_lock_counter_never_goes_negative() {
        let (catalog, _tmp, did) = catalog_with_file("data", "f1");
        let err = catalog
            .update_replica_lock_counter(SITE_A, &did, -1)
            .unwrap_err();
        assert!(matches!(err, CatalogError::UnsupportedOperation(_)));
        assert_eq!(catalog.get_replica(SITE_A, &did).unwrap().lock_cnt, 0);

        let missing = DidKey::new("data", "missing");
        assert!(!catalog.update_replica_lock_counter(SITE_A, &missing, 1).unwrap());
    }

    // ==================== Touch & paths ====================

    #[test]
    fn test_touch_replicas_records_access_time() {
        let (catalog, _tmp, did) = catalog_with_file("data", "f1");
        let when = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let touched = catalog
            .touch_replicas(&[ReplicaTouch {
                scope: did.scope.clone(),
                name: did.name.clone(),
                rse: SITE_A.to_string(),
                accessed_at: Some(when),
            }])
            .unwrap();
        assert!(touched);
        assert_eq!(catalog.get_replica_atime(SITE_A, &did).unwrap(), Some(when));
        assert_eq!(catalog.get_did(&did).unwrap().accessed_at, Some(when));

        // an unknown site is a failed touch, not an error
        let touched = catalog
            .touch_replicas(&[ReplicaTouch {
                scope: did.scope.clone(),
                name: did.name.clone(),
                rse: "NO_SUCH_SITE".to_string(),
                accessed_at: None,
            }])
            .unwrap();
        assert!(!touched);
        assert_eq!(catalog.get_replica_atime(SITE_A, &did).unwrap(), Some(when));
    }

    #[test]
    fn test_touch_no_wait() {
        let (catalog, _tmp, did) = catalog_with_file("data", "f1");
        let touch = ReplicaTouch {
            scope: did.scope.clone(),
            name: did.name.clone(),
            rse: SITE_A.to_string(),
            accessed_at: None,
        };
        assert!(catalog.touch_replica_no_wait(&touch));
        assert!(catalog.get_replica_atime(SITE_A, &did).unwrap().is_some());

        let missing = ReplicaTouch {
            name: "missing".to_string(),
            ..touch
        };
        assert!(!catalog.touch_replica_no_wait(&missing));
    }

    #[test]
    fn test_update_replicas_paths() {
        let (catalog, _tmp, did) = catalog_with_file("data", "f1");
        catalog
            .update_replicas_paths(&[ReplicaPathUpdate {
                scope: did.scope.clone(),
                name: did.name.clone(),
                rse: SITE_A.to_string(),
                path: "custom/f1".to_string(),
            }])
            .unwrap();
        assert_eq!(
            catalog.get_replica(SITE_A, &did).unwrap().path.as_deref(),
            Some("custom/f1")
        );

        let err = catalog
            .update_replicas_paths(&[ReplicaPathUpdate {
                scope: did.scope.clone(),
                name: "missing".to_string(),
                rse: SITE_A.to_string(),
                path: "x".to_string(),
            }])
            .unwrap_err();
        assert!(matches!(err, CatalogError::ReplicaNotFound(_)));
    }

    // ==================== Dataset replicas ====================

    #[test]
    fn test_get_and_lock_file_replicas_for_dataset() {
        let (catalog, _tmp) = create_test_catalog();
        let dataset = DidKey::new("data", "ds1");
        catalog.add_did(&dataset, DidType::Dataset, "root", true).unwrap();
        catalog
            .add_replicas(SITE_A, &[new_file("data", "f1", 10), new_file("data", "f2", 20)], "root")
            .unwrap();
        catalog
            .add_replica(SITE_B, new_file("data", "f1", 10), "root")
            .unwrap();
        catalog
            .attach_dids(&dataset, &[DidKey::new("data", "f1"), DidKey::new("data", "f2")])
            .unwrap();

        let all = catalog
            .get_and_lock_file_replicas_for_dataset(&dataset, false, None)
            .unwrap();
        assert_eq!(all[&DidKey::new("data", "f1")].len(), 2);
        assert_eq!(all[&DidKey::new("data", "f2")].len(), 1);

        let only_b = catalog
            .get_and_lock_file_replicas_for_dataset(&dataset, true, Some(&[SITE_B.to_string()]))
            .unwrap();
        assert_eq!(only_b[&DidKey::new("data", "f1")].len(), 1);
        assert!(only_b
            .get(&DidKey::new("data", "f2"))
            .map(|r| r.is_empty())
            .unwrap_or(true));
    }
}
