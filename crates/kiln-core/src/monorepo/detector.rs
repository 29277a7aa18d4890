//! Pluggable workspace detection
//!
//! Each detector looks for one tool's workspace metadata in a directory.
//! Unreadable metadata is logged and treated as "not this kind of
//! workspace" so a broken `package.json` does not hide a valid
//! `kiln.toml` next to it.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_CONFIG_TOML;
use crate::error::Result;

use super::workspace::{Workspace, WorkspaceType};

/// Trait for workspace detectors
pub trait WorkspaceDetector: Send + Sync {
    /// Detector name (e.g., "cargo", "pnpm")
    fn name(&self) -> &'static str;
    /// Try to detect a workspace rooted at `path`
    fn detect(&self, path: &Path) -> Result<Option<Workspace>>;
}

/// Read and deserialize a metadata file; `None` when absent or malformed
fn read_metadata<T: DeserializeOwned>(
    path: &Path,
    parse: fn(&str) -> std::result::Result<T, String>,
) -> Result<Option<T>> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    match parse(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable workspace metadata");
            Ok(None)
        }
    }
}

fn parse_toml<T: DeserializeOwned>(s: &str) -> std::result::Result<T, String> {
    toml::from_str(s).map_err(|e| e.to_string())
}

fn parse_json<T: DeserializeOwned>(s: &str) -> std::result::Result<T, String> {
    serde_json::from_str(s).map_err(|e| e.to_string())
}

fn parse_yaml<T: DeserializeOwned>(s: &str) -> std::result::Result<T, String> {
    serde_yaml::from_str(s).map_err(|e| e.to_string())
}

/// `[workspace] packages = [..]` in `kiln.toml`
pub struct KilnDetector;

impl WorkspaceDetector for KilnDetector {
    fn name(&self) -> &'static str {
        "kiln"
    }

    fn detect(&self, path: &Path) -> Result<Option<Workspace>> {
        #[derive(Deserialize)]
        struct KilnFile {
            workspace: Option<Section>,
        }

        #[derive(Deserialize)]
        struct Section {
            #[serde(default)]
            packages: Vec<String>,
            #[serde(default)]
            exclude: Vec<String>,
        }

        let file: Option<KilnFile> =
            read_metadata(&path.join(DEFAULT_CONFIG_TOML), parse_toml)?;
        Ok(file
            .and_then(|f| f.workspace)
            .filter(|section| !section.packages.is_empty())
            .map(|section| {
                Workspace::new(path.to_path_buf(), WorkspaceType::Kiln)
                    .with_patterns(section.packages)
                    .with_excludes(section.exclude)
            }))
    }
}

/// `pnpm-workspace.yaml`; `!glob` entries exclude
pub struct PnpmDetector;

impl WorkspaceDetector for PnpmDetector {
    fn name(&self) -> &'static str {
        "pnpm"
    }

    fn detect(&self, path: &Path) -> Result<Option<Workspace>> {
        #[derive(Deserialize)]
        struct PnpmFile {
            packages: Option<Vec<String>>,
        }

        let file: Option<PnpmFile> =
            read_metadata(&path.join("pnpm-workspace.yaml"), parse_yaml)?;
        Ok(file.map(|f| {
            // pnpm treats a file without `packages` as every direct subdirectory
            let patterns = f.packages.unwrap_or_else(|| vec!["*".to_string()]);
            Workspace::new(path.to_path_buf(), WorkspaceType::Pnpm).with_patterns(patterns)
        }))
    }
}

/// `workspaces` in `package.json`, as an array or `{ packages: [..] }`
pub struct NodeDetector;

impl WorkspaceDetector for NodeDetector {
    fn name(&self) -> &'static str {
        "node"
    }

    fn detect(&self, path: &Path) -> Result<Option<Workspace>> {
        #[derive(Deserialize)]
        struct PackageJson {
            name: Option<String>,
            workspaces: Option<Workspaces>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Workspaces {
            List(Vec<String>),
            Table { packages: Vec<String> },
        }

        let Some(manifest) = read_metadata::<PackageJson>(&path.join("package.json"), parse_json)?
        else {
            return Ok(None);
        };

        let kind = if path.join("yarn.lock").exists() {
            WorkspaceType::Yarn
        } else {
            WorkspaceType::Npm
        };

        let patterns = manifest.workspaces.map(|w| match w {
            Workspaces::List(patterns) => patterns,
            Workspaces::Table { packages } => packages,
        });

        Ok(match (patterns, manifest.name) {
            (Some(patterns), _) => {
                Some(Workspace::new(path.to_path_buf(), kind).with_patterns(patterns))
            }
            (None, Some(_)) => Some(Workspace::single_package(path.to_path_buf(), kind)),
            (None, None) => None,
        })
    }
}

/// `[workspace] members` in `Cargo.toml`, or a lone `[package]`
pub struct CargoDetector;

impl WorkspaceDetector for CargoDetector {
    fn name(&self) -> &'static str {
        "cargo"
    }

    fn detect(&self, path: &Path) -> Result<Option<Workspace>> {
        #[derive(Deserialize)]
        struct CargoFile {
            workspace: Option<Section>,
            package: Option<serde::de::IgnoredAny>,
        }

        #[derive(Deserialize)]
        struct Section {
            #[serde(default)]
            members: Vec<String>,
            #[serde(default)]
            exclude: Vec<String>,
        }

        let Some(file) = read_metadata::<CargoFile>(&path.join("Cargo.toml"), parse_toml)? else {
            return Ok(None);
        };

        Ok(match (file.workspace, file.package) {
            (Some(section), _) => Some(
                Workspace::new(path.to_path_buf(), WorkspaceType::Cargo)
                    .with_patterns(section.members)
                    .with_excludes(section.exclude),
            ),
            (None, Some(_)) => Some(Workspace::single_package(
                path.to_path_buf(),
                WorkspaceType::Cargo,
            )),
            (None, None) => None,
        })
    }
}

/// Registry of workspace detectors, tried in order
pub struct WorkspaceDetectorRegistry {
    detectors: Vec<Box<dyn WorkspaceDetector>>,
}

impl WorkspaceDetectorRegistry {
    /// Registry with the built-in detectors.
    ///
    /// An explicit `kiln.toml` workspace wins over package manager metadata,
    /// and pnpm wins over the `package.json` it also ships.
    pub fn new() -> Self {
        Self {
            detectors: vec![
                Box::new(KilnDetector),
                Box::new(PnpmDetector),
                Box::new(NodeDetector),
                Box::new(CargoDetector),
            ],
        }
    }

    /// Create an empty registry with no detectors
    pub fn empty() -> Self {
        Self {
            detectors: Vec::new(),
        }
    }

    /// Register an additional detector
    pub fn register(&mut self, detector: Box<dyn WorkspaceDetector>) {
        self.detectors.push(detector);
    }

    /// Try each detector in order, returning the first match
    pub fn detect(&self, path: &Path) -> Result<Option<Workspace>> {
        for detector in &self.detectors {
            if let Some(ws) = detector.detect(path)? {
                info!(
                    detector = detector.name(),
                    workspace_type = %ws.workspace_type,
                    path = %path.display(),
                    "workspace detected"
                );
                return Ok(Some(ws));
            }
        }
        debug!(path = %path.display(), "no workspace detected");
        Ok(None)
    }

    /// Get names of all registered detectors
    pub fn names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }
}

impl Default for WorkspaceDetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(temp: &TempDir, name: &str, content: &str) {
        std::fs::write(temp.path().join(name), content).unwrap();
    }

    fn detect(temp: &TempDir) -> Workspace {
        WorkspaceDetectorRegistry::new()
            .detect(temp.path())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_detector_order() {
        let registry = WorkspaceDetectorRegistry::new();
        assert_eq!(registry.names(), vec!["kiln", "pnpm", "node", "cargo"]);
        assert!(WorkspaceDetectorRegistry::empty().names().is_empty());
    }

    #[test]
    fn test_pnpm_with_exclusions() {
        let temp = TempDir::new().unwrap();
        write(
            &temp,
            "pnpm-workspace.yaml",
            "packages:\n  - 'packages/*'\n  - '!packages/scratch'\n",
        );
        write(&temp, "package.json", r#"{"name": "root"}"#);

        let ws = detect(&temp);
        assert_eq!(ws.workspace_type, WorkspaceType::Pnpm);
        assert_eq!(ws.package_patterns, vec!["packages/*"]);
        assert_eq!(ws.exclude_patterns, vec!["packages/scratch"]);
    }

    #[test]
    fn test_node_workspaces_forms() {
        let temp = TempDir::new().unwrap();
        write(
            &temp,
            "package.json",
            r#"{"name": "repo", "workspaces": {"packages": ["packages/*", "apps/*"]}}"#,
        );
        write(&temp, "yarn.lock", "");

        let ws = detect(&temp);
        assert_eq!(ws.workspace_type, WorkspaceType::Yarn);
        assert_eq!(ws.package_patterns, vec!["packages/*", "apps/*"]);

        let temp = TempDir::new().unwrap();
        write(&temp, "package.json", r#"{"workspaces": ["libs/*"]}"#);
        let ws = detect(&temp);
        assert_eq!(ws.workspace_type, WorkspaceType::Npm);
        assert!(!ws.is_single_package);
    }

    #[test]
    fn test_cargo_members_and_single_crate() {
        let temp = TempDir::new().unwrap();
        write(
            &temp,
            "Cargo.toml",
            "[workspace]\nmembers = [\"crates/*\"]\nexclude = [\"crates/bench\"]\n",
        );
        let ws = detect(&temp);
        assert_eq!(ws.workspace_type, WorkspaceType::Cargo);
        assert_eq!(ws.exclude_patterns, vec!["crates/bench"]);

        let temp = TempDir::new().unwrap();
        write(&temp, "Cargo.toml", "[package]\nname = \"solo\"\n");
        assert!(detect(&temp).is_single_package);
    }

    #[test]
    fn test_kiln_wins_and_malformed_metadata_is_skipped() {
        let temp = TempDir::new().unwrap();
        write(&temp, "kiln.toml", "[workspace]\npackages = [\"libs/*\"]\n");
        write(&temp, "package.json", "{ not json");

        let ws = detect(&temp);
        assert_eq!(ws.workspace_type, WorkspaceType::Kiln);
        assert_eq!(ws.package_patterns, vec!["libs/*"]);
    }

    #[test]
    fn test_kiln_toml_without_workspace_falls_through() {
        let temp = TempDir::new().unwrap();
        write(&temp, "kiln.toml", "[tasks.pipeline]\nbuild = [\"^build\"]\n");
        write(&temp, "package.json", r#"{"name": "r", "workspaces": ["p/*"]}"#);

        assert_eq!(detect(&temp).workspace_type, WorkspaceType::Npm);
    }

    #[test]
    fn test_register_custom_detector() {
        struct FixedDetector;
        impl WorkspaceDetector for FixedDetector {
            fn name(&self) -> &'static str {
                "fixed"
            }
            fn detect(&self, path: &Path) -> Result<Option<Workspace>> {
                Ok(Some(Workspace::single_package(
                    path.to_path_buf(),
                    WorkspaceType::Kiln,
                )))
            }
        }

        let mut registry = WorkspaceDetectorRegistry::empty();
        registry.register(Box::new(FixedDetector));

        let temp = TempDir::new().unwrap();
        let ws = registry.detect(temp.path()).unwrap().unwrap();
        assert!(ws.is_single_package);
        assert_eq!(registry.names(), vec!["fixed"]);
    }
}
