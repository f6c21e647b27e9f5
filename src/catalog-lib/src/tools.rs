use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

static SURL_PORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":[0-9]+/").expect("surl port pattern"));
static SURL_WEB_SERVICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/srm/(managerv1|managerv2|v2/server)\?SFN=").expect("surl web service pattern")
});

/// Normalize a storage URL so that equivalent spellings compare equal.
/// Only `srm` URLs carry a port and a web-service path worth removing.
pub fn clean_surl(surl: &str) -> String {
    if !surl.starts_with("srm") {
        return surl.to_string();
    }
    let surl = SURL_PORT_RE.replace_all(surl, "/");
    SURL_WEB_SERVICE_RE.replace_all(&surl, "").into_owned()
}

pub fn clean_surls<S: AsRef<str>>(surls: &[S]) -> Vec<String> {
    let mut result: Vec<String> = surls.iter().map(|s| clean_surl(s.as_ref())).collect();
    result.sort();
    result
}

/// Scheme of a URL (`srm` for `srm://host/...`).
pub fn url_scheme(url: &str) -> Option<String> {
    Url::parse(url).ok().map(|u| u.scheme().to_string())
}

/// Host part of a URL, without the port. IPv6 hosts keep their brackets.
pub fn url_hostname(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    url.host_str()
        .filter(|h| !h.is_empty())
        .map(|h| h.to_string())
}

fn is_two_segment_scope_root(segment: &str) -> bool {
    segment == "user" || segment == "group"
}

/// Directory form of a scope: `user.alice` lives under `user/alice`.
pub fn scope_to_path(scope: &str) -> String {
    match scope.split_once('.') {
        Some((root, _)) if is_two_segment_scope_root(root) => scope.replace('.', "/"),
        _ => scope.to_string(),
    }
}

/// Inverse of [`scope_to_path`] applied to the leading segments of a relative path.
pub fn scope_from_path(path: &str) -> Option<String> {
    let mut segments = path.trim_start_matches('/').split('/');
    let first = segments.next().filter(|s| !s.is_empty())?;
    if is_two_segment_scope_root(first) {
        let second = segments.next().filter(|s| !s.is_empty())?;
        return Some(format!("{}.{}", first, second));
    }
    Some(first.to_string())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Stable hash of a file name used to partition work between workers.
pub fn name_hash(name: &str) -> u32 {
    let digest = Sha256::digest(name.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Worker partition. Workers are numbered from 1; a shard is active only when
/// `total_workers - 1 > 0` and then owns names with
/// `name_hash(name) mod (total_workers - 1) == worker_number - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardSpec {
    pub worker_number: u32,
    pub total_workers: u32,
}

impl ShardSpec {
    pub fn new(worker_number: u32, total_workers: u32) -> Self {
        Self {
            worker_number,
            total_workers,
        }
    }

    pub fn unsharded() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.worker_number > 0 && self.total_workers > 1
    }

    pub fn modulus(&self) -> u32 {
        self.total_workers.saturating_sub(1)
    }

    pub fn residue(&self) -> u32 {
        self.worker_number.saturating_sub(1)
    }

    pub fn contains(&self, name: &str) -> bool {
        if !self.is_active() {
            return true;
        }
        name_hash(name) % self.modulus() == self.residue()
    }
}
