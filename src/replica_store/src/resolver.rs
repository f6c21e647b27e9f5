use crate::did_catalog::{list_children, load_did};
use crate::records::{u64_at, ReplicaState};
use crate::replica_state::{find_replica, ReplicaLookup};
use crate::store_db::{map_db_err, ReplicaCatalogDB};
use crate::ReplicaCatalog;
use catalog_lib::{
    common_scheme, scope_from_path, CatalogError, CatalogResult, DidKey, DidType,
    ProtocolFactory, ProtocolOperation, RseInfo, RseProtocol, RseRegistry, RseType,
    MAX_HIERARCHY_DEPTH,
};
use log::{debug, warn};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// A DID to resolve; `did_type` may be left open when the caller does not know it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DidRef {
    pub scope: String,
    pub name: String,
    pub did_type: Option<DidType>,
}

impl DidRef {
    pub fn file(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
            did_type: Some(DidType::File),
        }
    }

    pub fn any(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
            did_type: None,
        }
    }

    pub fn key(&self) -> DidKey {
        DidKey::new(self.scope.clone(), self.name.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListReplicasOptions {
    /// Only produce physical names for these schemes.
    pub schemes: Option<Vec<String>>,
    /// Also report UNAVAILABLE and COPYING replicas.
    pub include_unavailable: bool,
    /// Report replicas in every state, with per-site states attached.
    pub all_states: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PfnInfo {
    pub rse: String,
    pub rse_type: RseType,
}

/// Resolution result for one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileReplicas {
    pub scope: String,
    pub name: String,
    pub bytes: Option<u64>,
    pub md5: Option<String>,
    pub adler32: Option<String>,
    /// Physical names per site name.
    pub rses: BTreeMap<String, Vec<String>>,
    pub pfns: BTreeMap<String, PfnInfo>,
    pub states: Option<BTreeMap<String, ReplicaState>>,
    pub space_token: Option<String>,
}

impl FileReplicas {
    fn new(key: &DidKey, all_states: bool) -> Self {
        Self {
            scope: key.scope.clone(),
            name: key.name.clone(),
            bytes: None,
            md5: None,
            adler32: None,
            rses: BTreeMap::new(),
            pfns: BTreeMap::new(),
            states: if all_states { Some(BTreeMap::new()) } else { None },
            space_token: None,
        }
    }
}

struct ReplicaRow {
    key: DidKey,
    bytes: u64,
    md5: Option<String>,
    adler32: Option<String>,
    path: Option<String>,
    state: ReplicaState,
    rse_id: String,
}

/// Lazy, single pass resolution of files to physical names. Files are looked
/// up in chunks; files without any usable replica come last.
pub struct ReplicaIter {
    db: Arc<ReplicaCatalogDB>,
    rses: Arc<dyn RseRegistry>,
    protocols: Arc<dyn ProtocolFactory>,
    options: ListReplicasOptions,
    chunks: VecDeque<Vec<DidKey>>,
    pending: HashMap<DidKey, FileReplicas>,
    pending_order: Vec<DidKey>,
    ready: VecDeque<FileReplicas>,
    rse_cache: HashMap<String, Option<RseInfo>>,
    protocol_cache: HashMap<String, Vec<Arc<dyn RseProtocol>>>,
    path_cache: HashMap<(String, String, String), String>,
    drained: bool,
}

impl ReplicaIter {
    fn state_filter(&self) -> &'static str {
        if self.options.all_states {
            ""
        } else if self.options.include_unavailable {
            " AND state IN ('A', 'U', 'C')"
        } else {
            " AND state = 'A'"
        }
    }

    fn fetch_chunk(&self, chunk: &[DidKey]) -> CatalogResult<Vec<ReplicaRow>> {
        let predicate = (0..chunk.len())
            .map(|i| format!("(scope = ?{} AND name = ?{})", 2 * i + 1, 2 * i + 2))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT scope, name, bytes, md5, adler32, path, state, rse_id FROM replicas
             WHERE ({}){} ORDER BY scope, name, rse_id",
            predicate,
            self.state_filter()
        );
        let values: Vec<Value> = chunk
            .iter()
            .flat_map(|k| [Value::Text(k.scope.clone()), Value::Text(k.name.clone())])
            .collect();
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let rows = stmt
                .query_map(params_from_iter(values), |row| {
                    Ok(ReplicaRow {
                        key: DidKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                        bytes: u64_at(row, 2)?,
                        md5: row.get(3)?,
                        adler32: row.get(4)?,
                        path: row.get(5)?,
                        state: row.get(6)?,
                        rse_id: row.get(7)?,
                    })
                })
                .map_err(map_db_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
        })
    }

    fn rse(&mut self, rse_id: &str) -> Option<RseInfo> {
        let rses = &self.rses;
        self.rse_cache
            .entry(rse_id.to_string())
            .or_insert_with(|| match rses.get_rse_info_by_id(rse_id) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!("ReplicaIter: skip replicas at unknown rse {}: {}", rse_id, e);
                    None
                }
            })
            .clone()
    }

    fn site_protocols(&mut self, rse: &RseInfo) -> Vec<Arc<dyn RseProtocol>> {
        if let Some(cached) = self.protocol_cache.get(&rse.id) {
            return cached.clone();
        }
        let schemes: Vec<Option<String>> = match self.options.schemes.as_ref() {
            None => vec![None],
            Some(list) => list.iter().map(|s| Some(s.clone())).collect(),
        };
        let mut protocols = Vec::new();
        for scheme in schemes {
            match self
                .protocols
                .create_protocol(rse, ProtocolOperation::Read, scheme.as_deref())
            {
                Ok(p) => protocols.push(p),
                Err(CatalogError::ProtocolNotSupported(msg)) => {
                    debug!("ReplicaIter: {}", msg);
                }
                Err(e) => warn!("ReplicaIter: create protocol for {} failed! {}", rse.name, e),
            }
        }
        self.protocol_cache.insert(rse.id.clone(), protocols.clone());
        protocols
    }

    fn deterministic_path(&mut self, protocol: &dyn RseProtocol, key: &DidKey) -> String {
        let cache_key = (
            protocol.attributes().determinism().to_string(),
            key.scope.clone(),
            key.name.clone(),
        );
        self.path_cache
            .entry(cache_key)
            .or_insert_with(|| protocol.get_path(&key.scope, &key.name))
            .clone()
    }

    fn scan_chunk(&mut self, chunk: &[DidKey]) -> CatalogResult<()> {
        let rows = self.fetch_chunk(chunk)?;
        let mut emitted: Vec<DidKey> = Vec::new();
        for row in rows {
            let Some(rse) = self.rse(&row.rse_id) else {
                continue;
            };
            if rse.staging_area {
                continue;
            }
            let protocols = self.site_protocols(&rse);
            if protocols.is_empty() {
                continue;
            }

            let mut pfns = Vec::new();
            let mut space_token = None;
            for protocol in protocols.iter() {
                let path = if rse.deterministic {
                    self.deterministic_path(protocol.as_ref(), &row.key)
                } else {
                    match row.path.as_ref() {
                        Some(p) => p.clone(),
                        None => {
                            warn!(
                                "ReplicaIter: {} at non deterministic {} has no path",
                                row.key, rse.name
                            );
                            continue;
                        }
                    }
                };
                pfns.push(protocol.lfn_to_pfn(&row.key.scope, &row.key.name, Some(&path)));
                if protocol.attributes().scheme == "srm" {
                    space_token = protocol.attributes().space_token.clone();
                }
            }

            let all_states = self.options.all_states;
            let Some(entry) = self.pending.get_mut(&row.key) else {
                continue;
            };
            if entry.bytes.is_none() {
                entry.bytes = Some(row.bytes);
            }
            if entry.md5.is_none() {
                entry.md5 = row.md5.clone();
            }
            if entry.adler32.is_none() {
                entry.adler32 = row.adler32.clone();
            }
            if all_states {
                if let Some(states) = entry.states.as_mut() {
                    states.insert(rse.name.clone(), row.state);
                }
            }
            if space_token.is_some() {
                entry.space_token = space_token;
            }
            let site_pfns = entry.rses.entry(rse.name.clone()).or_default();
            for pfn in pfns {
                entry.pfns.insert(
                    pfn.clone(),
                    PfnInfo {
                        rse: rse.name.clone(),
                        rse_type: rse.rse_type,
                    },
                );
                site_pfns.push(pfn);
            }
            if emitted.last() != Some(&row.key) {
                emitted.push(row.key.clone());
            }
        }

        for key in emitted {
            if let Some(file) = self.pending.remove(&key) {
                self.ready.push_back(file);
            }
        }
        Ok(())
    }
}

impl Iterator for ReplicaIter {
    type Item = CatalogResult<FileReplicas>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(file) = self.ready.pop_front() {
                return Some(Ok(file));
            }
            if let Some(chunk) = self.chunks.pop_front() {
                if let Err(e) = self.scan_chunk(&chunk) {
                    self.chunks.clear();
                    self.pending.clear();
                    self.drained = true;
                    return Some(Err(e));
                }
                continue;
            }
            if !self.drained {
                self.drained = true;
                for key in std::mem::take(&mut self.pending_order) {
                    if let Some(file) = self.pending.remove(&key) {
                        self.ready.push_back(file);
                    }
                }
                continue;
            }
            return None;
        }
    }
}

impl ReplicaCatalog {
    /// Expands collections to their files, depth first with a visited set.
    fn expand_to_files(&self, dids: &[DidRef]) -> CatalogResult<Vec<DidKey>> {
        let unique: BTreeSet<&DidRef> = dids.iter().collect();
        let mut files = Vec::new();
        let mut seen_files = HashSet::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<(DidKey, usize)> = Vec::new();

        self.db.read(|conn| {
            for did in unique {
                let key = did.key();
                let did_type = match did.did_type {
                    Some(t) => Some(t),
                    None => load_did(conn, &key)?.map(|r| r.did_type),
                };
                match did_type {
                    Some(DidType::File) => {
                        if seen_files.insert(key.clone()) {
                            files.push(key);
                        }
                    }
                    Some(_) => stack.push((key, 0)),
                    None => debug!("ReplicaCatalog: list_replicas skips unknown did {}", key),
                }
            }

            while let Some((collection, depth)) = stack.pop() {
                if !visited.insert(collection.clone()) {
                    continue;
                }
                if depth >= MAX_HIERARCHY_DEPTH {
                    warn!(
                        "ReplicaCatalog: {} nested deeper than {}, not expanded",
                        collection, MAX_HIERARCHY_DEPTH
                    );
                    continue;
                }
                for entry in list_children(conn, &collection)? {
                    let child = entry.child();
                    if entry.child_type == DidType::File {
                        if seen_files.insert(child.clone()) {
                            files.push(child);
                        }
                    } else {
                        stack.push((child, depth + 1));
                    }
                }
            }
            Ok(())
        })?;
        Ok(files)
    }

    /// Resolves DIDs to the physical names of their file replicas. Staging
    /// sites are never reported. The result is consumed lazily.
    pub fn list_replicas(
        &self,
        dids: &[DidRef],
        options: ListReplicasOptions,
    ) -> CatalogResult<ReplicaIter> {
        let files = self.expand_to_files(dids)?;
        let all_states = options.all_states;
        let pending = files
            .iter()
            .map(|k| (k.clone(), FileReplicas::new(k, all_states)))
            .collect();
        let chunks = files
            .chunks(self.config.predicate_chunk_size.max(1))
            .map(|c| c.to_vec())
            .collect();
        Ok(ReplicaIter {
            db: self.db.clone(),
            rses: self.rses.clone(),
            protocols: self.protocols.clone(),
            options,
            chunks,
            pending,
            pending_order: files,
            ready: VecDeque::new(),
            rse_cache: HashMap::new(),
            protocol_cache: HashMap::new(),
            path_cache: HashMap::new(),
            drained: false,
        })
    }

    /// Maps physical names at one site back to file identities. Names that
    /// resolve to no registered replica are left out.
    pub fn get_did_from_pfns(
        &self,
        pfns: &[String],
        rse: &str,
    ) -> CatalogResult<BTreeMap<String, DidKey>> {
        if pfns.is_empty() {
            return Ok(BTreeMap::new());
        }
        let rse_info = self.rse_info(rse)?;
        let scheme = common_scheme(pfns)?;
        let protocol =
            self.protocols
                .create_protocol(&rse_info, ProtocolOperation::Read, scheme.as_deref())?;
        let parsed = protocol.parse_pfns(pfns)?;

        let mut result = BTreeMap::new();
        if rse_info.deterministic {
            for pfn in pfns {
                let Some(p) = parsed.get(pfn) else { continue };
                let scope = scope_from_path(&p.path).ok_or_else(|| {
                    CatalogError::InvalidInput(format!("cannot derive a scope from {}", pfn))
                })?;
                result.insert(pfn.clone(), DidKey::new(scope, p.name.clone()));
            }
            return Ok(result);
        }

        self.db.read(|conn| {
            for pfn in pfns {
                let Some(p) = parsed.get(pfn) else { continue };
                let lookup = ReplicaLookup::Path(p.relative_path());
                if let Some(did) = find_replica(conn, &rse_info.id, &lookup)? {
                    result.insert(pfn.clone(), did);
                }
            }
            Ok(())
        })?;
        Ok(result)
    }
}
