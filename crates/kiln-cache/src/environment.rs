//! Environment fingerprint: platform, runtime version and lockfile hash

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fileops::{hash_bytes, hash_file};

/// Runtime version recorded when the version command cannot be run
pub const UNKNOWN_VERSION: &str = "unknown";

/// Platform and runtime a task's outputs were produced on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentFingerprint {
    /// `<os>-<arch>`, e.g. `linux-x86_64`
    pub platform: String,
    /// Output of the runtime version command, e.g. `v20.11.0`
    pub runtime_version: String,
}

impl EnvironmentFingerprint {
    /// Create a fingerprint from explicit values
    pub fn new(platform: impl Into<String>, runtime_version: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            runtime_version: runtime_version.into(),
        }
    }

    /// Detect the current platform and run `runtime_version_command` for the runtime version
    pub fn detect(runtime_version_command: &str) -> Self {
        let runtime_version = query_version(runtime_version_command).unwrap_or_else(|| UNKNOWN_VERSION.to_string());
        let fingerprint = Self::new(current_platform(), runtime_version);
        debug!(
            platform = %fingerprint.platform,
            runtime = %fingerprint.runtime_version,
            "environment fingerprint detected"
        );
        fingerprint
    }
}

/// `<os>-<arch>` of the running process
pub fn current_platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Run a version command and return the first non-empty line of its stdout
pub fn query_version(command: &str) -> Option<String> {
    let mut parts = command.split_whitespace();
    let program = parts.next()?;

    let output = Command::new(program).args(parts).output().ok()?;
    if !output.status.success() {
        debug!(command, status = ?output.status.code(), "version command failed");
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Hash of the first lockfile found in `root`, or of the empty string when
/// none of `candidates` exists
pub fn lockfile_hash(root: &Path, candidates: &[String]) -> String {
    for name in candidates {
        let path = root.join(name);
        if path.is_file() {
            match hash_file(&path) {
                Ok(hash) => {
                    debug!(lockfile = %path.display(), "hashed lockfile");
                    return hash;
                }
                Err(e) => {
                    debug!(lockfile = %path.display(), error = %e, "failed to hash lockfile");
                }
            }
        }
    }
    hash_bytes(b"")
}
