use crate::{
    clean_surl, scope_to_path, sha256_hex, url_scheme, CatalogError, CatalogResult, RseInfo,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

pub const DETERMINISM_HASH: &str = "hash";
pub const DETERMINISM_IDENTITY: &str = "identity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolOperation {
    Read,
    Write,
    Delete,
}

/// Per-operation priorities. 0 means the operation is not offered, lower wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolDomains {
    pub read: u32,
    pub write: u32,
    pub delete: u32,
}

impl Default for ProtocolDomains {
    fn default() -> Self {
        Self {
            read: 1,
            write: 1,
            delete: 1,
        }
    }
}

impl ProtocolDomains {
    pub fn priority(&self, operation: ProtocolOperation) -> u32 {
        match operation {
            ProtocolOperation::Read => self.read,
            ProtocolOperation::Write => self.write,
            ProtocolOperation::Delete => self.delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolDesc {
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
    pub prefix: String,
    #[serde(alias = "web_service")]
    pub web_service_path: Option<String>,
    pub determinism_type: Option<String>,
    pub space_token: Option<String>,
    pub domains: ProtocolDomains,
}

impl Default for ProtocolDesc {
    fn default() -> Self {
        Self {
            scheme: "file".to_string(),
            hostname: String::new(),
            port: 0,
            prefix: "/".to_string(),
            web_service_path: None,
            determinism_type: None,
            space_token: None,
            domains: ProtocolDomains::default(),
        }
    }
}

impl ProtocolDesc {
    fn normalized_prefix(&self) -> String {
        let mut prefix = self.prefix.clone();
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        prefix
    }

    fn authority(&self) -> String {
        if self.port > 0 {
            format!("{}:{}", self.hostname, self.port)
        } else {
            self.hostname.clone()
        }
    }

    /// Cleaned url prefix every pfn served by this protocol starts with.
    pub fn access_point(&self) -> String {
        clean_surl(&format!(
            "{}://{}{}{}",
            self.scheme,
            self.authority(),
            self.web_service_path.as_deref().unwrap_or(""),
            self.normalized_prefix()
        ))
    }

    pub fn determinism(&self) -> &str {
        self.determinism_type.as_deref().unwrap_or(DETERMINISM_HASH)
    }
}

/// Components of a physical name as understood by one protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPfn {
    pub scheme: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub prefix: String,
    /// Directory part relative to the prefix, ending with `/` unless empty.
    pub path: String,
    pub name: String,
}

impl ParsedPfn {
    /// Path relative to the protocol prefix, as stored for non-deterministic sites.
    pub fn relative_path(&self) -> String {
        format!("{}{}", self.path, self.name)
    }
}

pub trait RseProtocol: Send + Sync {
    fn attributes(&self) -> &ProtocolDesc;
    /// Deterministic relative path of a file.
    fn get_path(&self, scope: &str, name: &str) -> String;
    fn lfn_to_pfn(&self, scope: &str, name: &str, path: Option<&str>) -> String;
    fn parse_pfns(&self, pfns: &[String]) -> CatalogResult<HashMap<String, ParsedPfn>>;
}

pub trait ProtocolFactory: Send + Sync {
    fn create_protocol(
        &self,
        rse: &RseInfo,
        operation: ProtocolOperation,
        scheme: Option<&str>,
    ) -> CatalogResult<Arc<dyn RseProtocol>>;
}

pub struct StandardProtocol {
    desc: ProtocolDesc,
}

impl StandardProtocol {
    pub fn new(desc: ProtocolDesc) -> Self {
        Self { desc }
    }
}

impl RseProtocol for StandardProtocol {
    fn attributes(&self) -> &ProtocolDesc {
        &self.desc
    }

    fn get_path(&self, scope: &str, name: &str) -> String {
        let scope_path = scope_to_path(scope);
        if self.desc.determinism() == DETERMINISM_IDENTITY {
            return format!("{}/{}", scope_path, name);
        }
        let hash = sha256_hex(format!("{}:{}", scope, name).as_bytes());
        format!("{}/{}/{}/{}", scope_path, &hash[0..2], &hash[2..4], name)
    }

    fn lfn_to_pfn(&self, scope: &str, name: &str, path: Option<&str>) -> String {
        let path = match path {
            Some(p) => p.to_string(),
            None => self.get_path(scope, name),
        };
        format!(
            "{}://{}{}{}{}",
            self.desc.scheme,
            self.desc.authority(),
            self.desc.web_service_path.as_deref().unwrap_or(""),
            self.desc.normalized_prefix(),
            path.trim_start_matches('/')
        )
    }

    fn parse_pfns(&self, pfns: &[String]) -> CatalogResult<HashMap<String, ParsedPfn>> {
        let prefix = self.desc.normalized_prefix();
        let mut result = HashMap::new();
        for pfn in pfns {
            let url = Url::parse(pfn)
                .map_err(|e| CatalogError::InvalidInput(format!("pfn {} is not a url: {}", pfn, e)))?;
            if url.scheme() != self.desc.scheme {
                return Err(CatalogError::InvalidInput(format!(
                    "pfn {} does not use scheme {}",
                    pfn, self.desc.scheme
                )));
            }
            let hostname = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| CatalogError::InvalidInput(format!("pfn {} has no host", pfn)))?;

            // srm carries the site path in the SFN query value
            let full_path = match url.query().and_then(|q| q.strip_prefix("SFN=")) {
                Some(sfn) => sfn,
                None => url.path(),
            };
            let relative = full_path.strip_prefix(&prefix).ok_or_else(|| {
                CatalogError::InvalidInput(format!("pfn {} is not under prefix {}", pfn, prefix))
            })?;
            let (path, name) = match relative.rfind('/') {
                Some(pos) => (&relative[..=pos], &relative[pos + 1..]),
                None => ("", relative),
            };
            if name.is_empty() {
                return Err(CatalogError::InvalidInput(format!("pfn {} has no file name", pfn)));
            }

            result.insert(
                pfn.clone(),
                ParsedPfn {
                    scheme: self.desc.scheme.clone(),
                    hostname: hostname.to_string(),
                    port: url.port(),
                    prefix: prefix.clone(),
                    path: path.to_string(),
                    name: name.to_string(),
                },
            );
        }
        Ok(result)
    }
}

/// Picks the best protocol a site offers for an operation.
#[derive(Debug, Clone, Default)]
pub struct StandardProtocolFactory;

impl StandardProtocolFactory {
    pub fn select<'a>(
        rse: &'a RseInfo,
        operation: ProtocolOperation,
        scheme: Option<&str>,
    ) -> Option<&'a ProtocolDesc> {
        rse.protocols
            .iter()
            .filter(|p| scheme.map(|s| p.scheme == s).unwrap_or(true))
            .filter(|p| p.domains.priority(operation) > 0)
            .min_by_key(|p| p.domains.priority(operation))
    }
}

impl ProtocolFactory for StandardProtocolFactory {
    fn create_protocol(
        &self,
        rse: &RseInfo,
        operation: ProtocolOperation,
        scheme: Option<&str>,
    ) -> CatalogResult<Arc<dyn RseProtocol>> {
        let desc = Self::select(rse, operation, scheme).ok_or_else(|| {
            CatalogError::ProtocolNotSupported(format!(
                "{} offers no {:?} protocol for scheme {}",
                rse.name,
                operation,
                scheme.unwrap_or("*")
            ))
        })?;
        Ok(Arc::new(StandardProtocol::new(desc.clone())))
    }
}

/// Scheme shared by all given urls, or an error when they disagree.
pub fn common_scheme<S: AsRef<str>>(urls: &[S]) -> CatalogResult<Option<String>> {
    let mut scheme: Option<String> = None;
    for url in urls {
        let url = url.as_ref();
        let current = url_scheme(url)
            .ok_or_else(|| CatalogError::InvalidInput(format!("url {} has no scheme", url)))?;
        if let Some(existing) = scheme.as_deref() {
            if existing != current {
                return Err(CatalogError::InvalidInput(
                    "the pfns specified must have the same protocol".to_string(),
                ));
            }
            continue;
        }
        scheme = Some(current);
    }
    Ok(scheme)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn srm_desc() -> ProtocolDesc {
        ProtocolDesc {
            scheme: "srm".to_string(),
            hostname: "se-a.example.org".to_string(),
            port: 8443,
            prefix: "/pnfs/site-a/data".to_string(),
            web_service_path: Some("/srm/managerv2?SFN=".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_deterministic_path_layout() {
        let protocol = StandardProtocol::new(srm_desc());
        let path = protocol.get_path("user.alice", "file1");
        let hash = sha256_hex(b"user.alice:file1");
        assert_eq!(
            path,
            format!("user/alice/{}/{}/file1", &hash[0..2], &hash[2..4])
        );

        let identity = StandardProtocol::new(ProtocolDesc {
            determinism_type: Some(DETERMINISM_IDENTITY.to_string()),
            ..srm_desc()
        });
        assert_eq!(identity.get_path("data18", "f"), "data18/f");
    }

    #[test]
    fn test_lfn_to_pfn_and_parse_back() {
        let protocol = StandardProtocol::new(srm_desc());
        let pfn = protocol.lfn_to_pfn("user.alice", "file1", None);
        assert!(pfn.starts_with("srm://se-a.example.org:8443/srm/managerv2?SFN=/pnfs/site-a/data/user/alice/"));

        let parsed = protocol.parse_pfns(&[pfn.clone()]).unwrap();
        let parsed = parsed.get(&pfn).unwrap();
        assert_eq!(parsed.hostname, "se-a.example.org");
        assert_eq!(parsed.name, "file1");
        assert!(parsed.path.starts_with("user/alice/"));
        assert_eq!(
            parsed.relative_path(),
            protocol.get_path("user.alice", "file1")
        );
    }

    #[test]
    fn test_explicit_path_and_bad_pfns() {
        let protocol = StandardProtocol::new(srm_desc());
        let pfn = protocol.lfn_to_pfn("s", "n", Some("/custom/dir/n"));
        assert_eq!(
            pfn,
            "srm://se-a.example.org:8443/srm/managerv2?SFN=/pnfs/site-a/data/custom/dir/n"
        );

        let err = protocol
            .parse_pfns(&["root://se-a.example.org/pnfs/site-a/data/x".to_string()])
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidInput(_)));
        let err = protocol
            .parse_pfns(&["srm://se-a.example.org/other/x".to_string()])
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidInput(_)));
    }

    #[test]
    fn test_ipv6_host_round_trip() {
        let protocol = StandardProtocol::new(ProtocolDesc {
            scheme: "root".to_string(),
            hostname: "[2001:db8::1]".to_string(),
            port: 1094,
            prefix: "/store/".to_string(),
            ..Default::default()
        });
        let pfn = protocol.lfn_to_pfn("data", "f1", None);
        assert!(pfn.starts_with("root://[2001:db8::1]:1094/store/data/"));

        let parsed = protocol.parse_pfns(&[pfn.clone()]).unwrap();
        let parsed = &parsed[&pfn];
        assert_eq!(parsed.hostname, "[2001:db8::1]");
        assert_eq!(parsed.port, Some(1094));
        assert_eq!(parsed.name, "f1");
        assert_eq!(parsed.relative_path(), protocol.get_path("data", "f1"));
    }

    #[test]
    fn test_parse_srm_with_and_without_web_service() {
        let protocol = StandardProtocol::new(srm_desc());
        let full = protocol.lfn_to_pfn("data18", "f2", Some("run1/f2"));
        let cleaned = clean_surl(&full);
        assert_eq!(cleaned, "srm://se-a.example.org/pnfs/site-a/data/run1/f2");

        let parsed = protocol.parse_pfns(&[full.clone(), cleaned.clone()]).unwrap();
        assert_eq!(parsed[&full].port, Some(8443));
        assert_eq!(parsed[&cleaned].port, None);
        for pfn in [&full, &cleaned] {
            assert_eq!(parsed[pfn].relative_path(), "run1/f2");
            assert_eq!(parsed[pfn].hostname, "se-a.example.org");
        }
    }

    #[test]
    fn test_access_point_is_clean() {
        assert_eq!(
            srm_desc().access_point(),
            "srm://se-a.example.org/pnfs/site-a/data/"
        );
    }

    #[test]
    fn test_factory_priority_and_scheme() {
        let root = ProtocolDesc {
            scheme: "root".to_string(),
            hostname: "se-a.example.org".to_string(),
            port: 1094,
            prefix: "/store/".to_string(),
            domains: ProtocolDomains {
                read: 1,
                write: 0,
                delete: 2,
            },
            ..Default::default()
        };
        let srm = ProtocolDesc {
            domains: ProtocolDomains {
                read: 2,
                write: 1,
                delete: 1,
            },
            ..srm_desc()
        };
        let rse = RseInfo {
            id: "a".to_string(),
            name: "SITE_A".to_string(),
            protocols: vec![root, srm],
            ..Default::default()
        };
        let factory = StandardProtocolFactory;
        let read = factory
            .create_protocol(&rse, ProtocolOperation::Read, None)
            .unwrap();
        assert_eq!(read.attributes().scheme, "root");
        let write = factory
            .create_protocol(&rse, ProtocolOperation::Write, None)
            .unwrap();
        assert_eq!(write.attributes().scheme, "srm");
        let err = factory
            .create_protocol(&rse, ProtocolOperation::Write, Some("root"))
            .err()
            .unwrap();
        assert!(matches!(err, CatalogError::ProtocolNotSupported(_)));
    }

    #[test]
    fn test_common_scheme() {
        assert_eq!(
            common_scheme(&["srm://a/x", "srm://b/y"]).unwrap(),
            Some("srm".to_string())
        );
        assert_eq!(common_scheme::<&str>(&[]).unwrap(), None);
        assert!(common_scheme(&["srm://a/x", "root://b/y"]).is_err());
    }
}
