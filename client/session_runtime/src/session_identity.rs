use crate::protocol::PageDescriptor;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// Identity of the app and page a run belongs to, as last announced by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMetadata {
    pub installation_id: String,
    pub session_id: String,
    pub server_version: String,
    pub app_hash: String,
    pub main_script_path: String,
    pub current_page_script_hash: String,
    pub app_pages: Vec<PageDescriptor>,
}

impl SessionMetadata {
    pub fn page_name(&self, page_script_hash: &str) -> Option<&str> {
        self.app_pages
            .iter()
            .find(|page| page.page_script_hash == page_script_hash)
            .map(|page| page.page_name.as_str())
    }
}

/// Identity of an incoming run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub script_run_id: String,
    pub app_hash: String,
    pub main_script_path: String,
    pub page_script_hash: String,
}

/// Stable for reruns of the same script; changes with the script path or
/// the installation.
pub fn compute_app_hash(installation_id: &str, main_script_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(installation_id.as_bytes());
    hasher.update([0_u8]);
    hasher.update(main_script_path.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Whether `new` continues the app/page currently shown. Anything else
/// requires a full reset of the tree and widget state.
pub fn continues_same_app(old: &SessionMetadata, new: &RunIdentity) -> bool {
    old.app_hash == new.app_hash && old.current_page_script_hash == new.page_script_hash
}

/// Compares dotted version strings numerically. Missing or non-numeric
/// components count as zero, so `1.2` equals `1.2.0`.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let parse = |raw: &str| -> Vec<u64> {
        raw.trim()
            .split(['.', '-', '+'])
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect()
    };

    let (left, right) = (parse(left), parse(right));
    let width = left.len().max(right.len());
    (0..width)
        .map(|i| {
            let l = left.get(i).copied().unwrap_or(0);
            let r = right.get(i).copied().unwrap_or(0);
            l.cmp(&r)
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

pub fn is_newer_version(candidate: &str, recorded: &str) -> bool {
    compare_versions(candidate, recorded) == Ordering::Greater
}
