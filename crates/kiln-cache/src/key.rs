//! Cache key derivation
//!
//! A cache key is the SHA-256 of a canonical encoding of everything that can
//! influence a task's outputs. Collections are sorted before hashing, so the
//! order in which inputs were gathered never changes the key.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::environment::EnvironmentFingerprint;

/// Bumped whenever the canonical encoding changes
const KEY_FORMAT_VERSION: &str = "kiln-cache-key-v1";

/// Content hash of one input file, relative to the package directory
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InputFileHash {
    /// Relative path with forward slashes
    pub path: String,
    /// Hex SHA-256 of the file contents
    pub hash: String,
}

/// Everything that identifies one execution of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKeyInputs {
    /// Package the task belongs to
    pub package_name: String,
    /// Task name
    pub task_name: String,
    /// First word of the command
    pub executable: String,
    /// Full command line
    pub command: String,
    /// Input files and their hashes
    pub input_hashes: Vec<InputFileHash>,
    /// Declared output paths, relative to the package directory
    pub output_paths: Vec<String>,
    /// Platform and runtime version
    pub environment: EnvironmentFingerprint,
    /// Hash of the workspace lockfile
    pub lockfile_hash: String,
    /// Version of the tool that runs the task, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_version: Option<String>,
    /// Hashes of configuration files, keyed by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_hashes: BTreeMap<String, String>,
}

impl CacheKeyInputs {
    /// Start building inputs for a task command
    pub fn new(
        package_name: impl Into<String>,
        task_name: impl Into<String>,
        command: impl Into<String>,
        environment: EnvironmentFingerprint,
        lockfile_hash: impl Into<String>,
    ) -> Self {
        let command = command.into();
        Self {
            package_name: package_name.into(),
            task_name: task_name.into(),
            executable: executable_of(&command),
            command,
            input_hashes: Vec::new(),
            output_paths: Vec::new(),
            environment,
            lockfile_hash: lockfile_hash.into(),
            tool_version: None,
            config_hashes: BTreeMap::new(),
        }
    }

    /// Add an input file hash
    pub fn with_input(mut self, path: impl Into<String>, hash: impl Into<String>) -> Self {
        self.input_hashes.push(InputFileHash {
            path: path.into(),
            hash: hash.into(),
        });
        self
    }

    /// Add a declared output path
    pub fn with_output(mut self, path: impl Into<String>) -> Self {
        self.output_paths.push(path.into());
        self
    }

    /// Set the tool version
    pub fn with_tool_version(mut self, version: impl Into<String>) -> Self {
        self.tool_version = Some(version.into());
        self
    }

    /// Add a configuration file hash
    pub fn with_config_hash(mut self, name: impl Into<String>, hash: impl Into<String>) -> Self {
        self.config_hashes.insert(name.into(), hash.into());
        self
    }
}

/// First whitespace-separated word of a command, without any directory part
pub fn executable_of(command: &str) -> String {
    let first = command.split_whitespace().next().unwrap_or_default();
    first
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(first)
        .to_string()
}

/// Hex SHA-256 identifying a cache entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an existing hex digest, e.g. an entry directory name.
    ///
    /// Returns `None` unless `value` is 64 lowercase hex characters.
    pub fn parse(value: &str) -> Option<Self> {
        crate::fileops::is_sha256_hex(value).then(|| Self(value.to_string()))
    }

    /// The key as a hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for logs and console output
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Length-prefixed field so adjacent values can never run together
fn feed(hasher: &mut Sha256, tag: &str, value: &str) {
    hasher.update(tag.as_bytes());
    hasher.update([0u8]);
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

/// Derive the cache key for a set of inputs
pub fn compute_cache_key(inputs: &CacheKeyInputs) -> CacheKey {
    let mut hasher = Sha256::new();
    feed(&mut hasher, "format", KEY_FORMAT_VERSION);
    feed(&mut hasher, "package", &inputs.package_name);
    feed(&mut hasher, "task", &inputs.task_name);
    feed(&mut hasher, "executable", &inputs.executable);
    feed(&mut hasher, "command", &inputs.command);

    let mut input_hashes: Vec<&InputFileHash> = inputs.input_hashes.iter().collect();
    input_hashes.sort();
    input_hashes.dedup();
    feed(&mut hasher, "inputs", &input_hashes.len().to_string());
    for input in input_hashes {
        feed(&mut hasher, "input.path", &input.path);
        feed(&mut hasher, "input.hash", &input.hash);
    }

    let mut outputs: Vec<&String> = inputs.output_paths.iter().collect();
    outputs.sort();
    outputs.dedup();
    feed(&mut hasher, "outputs", &outputs.len().to_string());
    for output in outputs {
        feed(&mut hasher, "output", output);
    }

    feed(&mut hasher, "platform", &inputs.environment.platform);
    feed(&mut hasher, "runtime", &inputs.environment.runtime_version);
    feed(&mut hasher, "lockfile", &inputs.lockfile_hash);
    feed(
        &mut hasher,
        "tool",
        inputs.tool_version.as_deref().unwrap_or_default(),
    );
    feed(
        &mut hasher,
        "tool.present",
        if inputs.tool_version.is_some() { "1" } else { "0" },
    );

    // BTreeMap iterates in name order
    feed(&mut hasher, "configs", &inputs.config_hashes.len().to_string());
    for (name, hash) in &inputs.config_hashes {
        feed(&mut hasher, "config.name", name);
        feed(&mut hasher, "config.hash", hash);
    }

    let key = CacheKey(format!("{:x}", hasher.finalize()));
    trace!(
        package = %inputs.package_name,
        task = %inputs.task_name,
        key = %key,
        "computed cache key"
    );
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> EnvironmentFingerprint {
        EnvironmentFingerprint::new("linux-x86_64", "v20.11.0")
    }

    fn base() -> CacheKeyInputs {
        CacheKeyInputs::new("@scope/app", "build", "tsc --build", env(), "lock-hash")
            .with_input("src/a.ts", "aaaa")
            .with_input("src/b.ts", "bbbb")
            .with_output("dist/a.js")
            .with_output("dist/b.js")
            .with_config_hash("tsconfig.json", "cccc")
    }

    #[test]
    fn test_executable_of() {
        assert_eq!(executable_of("tsc --build"), "tsc");
        assert_eq!(executable_of("./node_modules/.bin/tsc -p ."), "tsc");
        assert_eq!(executable_of("  eslint src"), "eslint");
        assert_eq!(executable_of(""), "");
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = compute_cache_key(&base());
        let b = compute_cache_key(&base());
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(CacheKey::parse(a.as_str()).is_some());
    }

    #[test]
    fn test_construction_order_does_not_matter() {
        let reordered = CacheKeyInputs::new("@scope/app", "build", "tsc --build", env(), "lock-hash")
            .with_config_hash("tsconfig.json", "cccc")
            .with_output("dist/b.js")
            .with_input("src/b.ts", "bbbb")
            .with_output("dist/a.js")
            .with_input("src/a.ts", "aaaa");

        assert_eq!(compute_cache_key(&base()), compute_cache_key(&reordered));
    }

    #[test]
    fn test_key_sensitivity() {
        let original = compute_cache_key(&base());

        let mut changed_input = base();
        changed_input.input_hashes[0].hash = "aaab".to_string();
        assert_ne!(original, compute_cache_key(&changed_input));

        let extra_output = base().with_output("dist/c.js");
        assert_ne!(original, compute_cache_key(&extra_output));

        let mut other_platform = base();
        other_platform.environment.platform = "darwin-aarch64".to_string();
        assert_ne!(original, compute_cache_key(&other_platform));

        let mut other_runtime = base();
        other_runtime.environment.runtime_version = "v22.0.0".to_string();
        assert_ne!(original, compute_cache_key(&other_runtime));

        let mut other_lockfile = base();
        other_lockfile.lockfile_hash = "lock-hash-2".to_string();
        assert_ne!(original, compute_cache_key(&other_lockfile));

        let tool = base().with_tool_version("Version 5.4.2");
        assert_ne!(original, compute_cache_key(&tool));

        let config = base().with_config_hash("tsconfig.json", "dddd");
        assert_ne!(original, compute_cache_key(&config));
    }

    #[test]
    fn test_fields_do_not_run_together() {
        let a = CacheKeyInputs::new("ab", "c", "x", env(), "l");
        let b = CacheKeyInputs::new("a", "bc", "x", env(), "l");
        assert_ne!(compute_cache_key(&a), compute_cache_key(&b));
    }

    #[test]
    fn test_empty_tool_version_differs_from_none() {
        let none = base();
        let empty = base().with_tool_version("");
        assert_ne!(compute_cache_key(&none), compute_cache_key(&empty));
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        assert!(CacheKey::parse("not-a-key").is_none());
        assert!(CacheKey::parse(&"A".repeat(64)).is_none());
    }
}
