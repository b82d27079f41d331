//! On-disk layout helpers shared by the archive store and the worker.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

/// Submissions are addressed by a 32-character lowercase hex GUID.
pub fn is_valid_guid(guid: &str) -> bool {
    static GUID_RE: OnceLock<Regex> = OnceLock::new();
    GUID_RE
        .get_or_init(|| Regex::new("^[0-9a-f]{32}$").expect("guid regex"))
        .is_match(guid)
}

/// `<root>/submissions/<guid[:2]>/<guid[2:]>`
pub fn submission_path(runtime_path: &Path, guid: &str) -> PathBuf {
    runtime_path
        .join("submissions")
        .join(&guid[..2])
        .join(&guid[2..])
}

/// Archive location for a content hash: `<root>/<hh>/<rest>.tar.gz`,
/// sharded by the first two hex characters.
pub fn archive_path(cache_root: &Path, hash: &str) -> PathBuf {
    cache_root
        .join(&hash[..2])
        .join(format!("{}.tar.gz", &hash[2..]))
}

/// Directory the extracted contents of an archive live in.
pub fn input_dir(cache_root: &Path, hash: &str) -> PathBuf {
    cache_root.join(&hash[..2]).join(&hash[2..])
}

/// Grade directory for a run, sharded by the last four decimal digits:
/// `<root>/grade/<id%100>/<(id%10000)/100>/<id>`, two digits per level.
pub fn grade_dir(runtime_path: &Path, run_id: u64) -> PathBuf {
    runtime_path
        .join("grade")
        .join(format!("{:02}", run_id % 100))
        .join(format!("{:02}", (run_id % 10_000) / 100))
        .join(run_id.to_string())
}

/// Scratch tree for a grading pass: `<root>/grade/<attempt_id>`.
pub fn scratch_dir(runtime_path: &Path, attempt_id: u64) -> PathBuf {
    runtime_path.join("grade").join(attempt_id.to_string())
}
