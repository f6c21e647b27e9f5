// replica_store keeps the replica catalog: which site holds which file, the
// lifecycle of every copy and the bookkeeping the deletion daemons rely on.

mod backend;
mod bad_replicas;
mod catalog;
mod collection;
mod config;
mod deletion;
mod did_catalog;
mod gc;
mod lock_hooks;
mod records;
mod registration;
mod replica_state;
mod resolver;
mod rse_counter;
mod store_db;

pub use backend::{BackendDialect, BackendProfile};
pub use bad_replicas::{BadReplica, BadReplicaFilter, BadReplicaSummary, UNKNOWN_RSE};
pub use catalog::ReplicaCatalog;
pub use collection::{CollectionTouch, DatasetReplicaFilter};
pub use config::{CatalogConfig, DEFAULT_CATALOG_DB_PATH};
pub use deletion::DeletionSummary;
pub use did_catalog::ContentEntry;
pub use gc::{BeingDeletedSummary, CandidateQuery, DeletionCandidate};
pub use lock_hooks::{LockCallbacks, NoopLockCallbacks};
pub use records::*;
pub use registration::NewReplica;
pub use replica_state::{ReplicaLookup, ReplicaPathUpdate, ReplicaStateUpdate, ReplicaTouch};
pub use resolver::{DidRef, FileReplicas, ListReplicasOptions, PfnInfo, ReplicaIter};
pub use rse_counter::RseUsage;
pub use store_db::{ReplicaCatalogDB, RowLockMode};

#[cfg(test)]
mod test_fixtures;


#[cfg(test)]
mod lifecycle_tests;




#[cfg(test)]
mod bad_replicas_tests;
