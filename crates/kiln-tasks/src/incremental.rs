//! Session-local incrementality through per-task done records
//!
//! After a task succeeds (or is restored from the shared cache) a record of
//! its command, input hashes and output hashes is written to
//! `<package>/.kiln/<task>.done.json`. A later run skips the task when the
//! record carries the same cache key and still matches the package on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use kiln_cache::atomic::write_json_atomic;
use kiln_cache::InputFileHash;

use crate::hash_cache::FileHashCache;

/// Directory inside each package holding done records
pub const STATE_DIR: &str = ".kiln";

/// What a successful run of a task looked like
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneRecord {
    /// Command that ran
    pub command: String,
    /// Input path to content hash
    pub inputs: BTreeMap<String, String>,
    /// Output path to content hash
    pub outputs: BTreeMap<String, String>,
    /// Cache key of the run; records without one are never up to date
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
}

impl DoneRecord {
    /// Build a record from key inputs and output hashes
    pub fn new(
        command: impl Into<String>,
        inputs: &[InputFileHash],
        outputs: BTreeMap<String, String>,
    ) -> Self {
        Self {
            command: command.into(),
            inputs: inputs
                .iter()
                .map(|i| (i.path.clone(), i.hash.clone()))
                .collect(),
            outputs,
            cache_key: None,
        }
    }
}

/// Location of a task's done record
pub fn done_record_path(package_dir: &Path, task: &str) -> PathBuf {
    let file_name: String = task
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    package_dir
        .join(STATE_DIR)
        .join(format!("{}.done.json", file_name))
}

/// Read a done record; missing or unreadable records read as `None`
pub fn read_done_record(package_dir: &Path, task: &str) -> Option<DoneRecord> {
    let path = done_record_path(package_dir, task);
    let bytes = std::fs::read(&path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "ignoring unreadable done record");
            None
        }
    }
}

/// Atomically write a done record
pub fn write_done_record(package_dir: &Path, task: &str, record: &DoneRecord) -> kiln_cache::Result<()> {
    write_json_atomic(&done_record_path(package_dir, task), record)
}

/// Remove a done record so an interrupted or failed rerun is never up to date
pub fn clear_done_record(package_dir: &Path, task: &str) {
    let path = done_record_path(package_dir, task);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "failed to remove done record");
        }
    }
}

/// Hash outputs relative to `package_dir`
pub fn hash_outputs(
    package_dir: &Path,
    outputs: &[String],
    hashes: &FileHashCache,
) -> std::io::Result<BTreeMap<String, String>> {
    outputs
        .iter()
        .map(|rel| -> std::io::Result<(String, String)> {
            Ok((rel.clone(), hashes.hash(&package_dir.join(rel))?))
        })
        .collect()
}

/// Whether a record still describes the package on disk
pub fn is_up_to_date(
    record: &DoneRecord,
    package_dir: &Path,
    key: &str,
    command: &str,
    inputs: &[InputFileHash],
    hashes: &FileHashCache,
) -> bool {
    if record.cache_key.as_deref() != Some(key) {
        debug!("cache key changed");
        return false;
    }
    if record.command != command {
        debug!("command changed");
        return false;
    }

    let current: BTreeMap<&str, &str> = inputs
        .iter()
        .map(|i| (i.path.as_str(), i.hash.as_str()))
        .collect();
    let recorded: BTreeMap<&str, &str> = record
        .inputs
        .iter()
        .map(|(p, h)| (p.as_str(), h.as_str()))
        .collect();
    if current != recorded {
        debug!("inputs changed");
        return false;
    }

    record.outputs.iter().all(|(rel, hash)| {
        match hashes.hash(&package_dir.join(rel)) {
            Ok(current) if &current == hash => true,
            _ => {
                debug!(output = %rel, "output missing or modified");
                false
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_cache::fileops::hash_bytes;
    use tempfile::TempDir;

    const KEY: &str = "3f2a9c";

    fn inputs() -> Vec<InputFileHash> {
        vec![InputFileHash {
            path: "src/index.ts".to_string(),
            hash: hash_bytes(b"src"),
        }]
    }

    fn setup() -> (TempDir, DoneRecord) {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("dist")).unwrap();
        std::fs::write(temp.path().join("dist/index.js"), "out").unwrap();

        let hashes = FileHashCache::new();
        let outputs = hash_outputs(temp.path(), &["dist/index.js".to_string()], &hashes).unwrap();
        let mut record = DoneRecord::new("tsc", &inputs(), outputs);
        record.cache_key = Some(KEY.to_string());
        write_done_record(temp.path(), "build", &record).unwrap();
        (temp, record)
    }

    #[test]
    fn test_record_path() {
        assert_eq!(
            done_record_path(Path::new("/pkg"), "build:esm"),
            PathBuf::from("/pkg/.kiln/build_esm.done.json")
        );
    }

    #[test]
    fn test_round_trip_and_up_to_date() {
        let (temp, record) = setup();
        let read = read_done_record(temp.path(), "build").unwrap();
        assert_eq!(read, record);
        assert!(is_up_to_date(&read, temp.path(), KEY, "tsc", &inputs(), &FileHashCache::new()));
    }

    #[test]
    fn test_stale_when_anything_changes() {
        let (temp, record) = setup();

        assert!(!is_up_to_date(&record, temp.path(), KEY, "tsc --build", &inputs(), &FileHashCache::new()));

        let mut changed = inputs();
        changed[0].hash = hash_bytes(b"edited");
        assert!(!is_up_to_date(&record, temp.path(), KEY, "tsc", &changed, &FileHashCache::new()));

        std::fs::write(temp.path().join("dist/index.js"), "edited output").unwrap();
        assert!(!is_up_to_date(&record, temp.path(), KEY, "tsc", &inputs(), &FileHashCache::new()));

        std::fs::remove_file(temp.path().join("dist/index.js")).unwrap();
        assert!(!is_up_to_date(&record, temp.path(), KEY, "tsc", &inputs(), &FileHashCache::new()));
    }

    #[test]
    fn test_stale_when_key_differs_or_is_missing() {
        let (temp, mut record) = setup();
        let hashes = FileHashCache::new();

        // Same files and command, but the lockfile or environment moved the key
        assert!(!is_up_to_date(&record, temp.path(), "9b41e0", "tsc", &inputs(), &hashes));

        record.cache_key = None;
        assert!(!is_up_to_date(&record, temp.path(), KEY, "tsc", &inputs(), &hashes));
    }

    #[test]
    fn test_clear_record() {
        let (temp, _) = setup();
        clear_done_record(temp.path(), "build");
        assert!(read_done_record(temp.path(), "build").is_none());
        // Clearing twice is fine
        clear_done_record(temp.path(), "build");
    }
}
