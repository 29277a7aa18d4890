//! Workspace model and root lookup

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DEFAULT_CONFIG_TOML;
use crate::error::Result;

use super::detector::WorkspaceDetectorRegistry;

/// Kind of workspace, named after the tool whose metadata declared it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceType {
    /// `[workspace] packages` in `kiln.toml`
    Kiln,
    /// `pnpm-workspace.yaml`
    Pnpm,
    /// `workspaces` in `package.json` with a `yarn.lock`
    Yarn,
    /// `workspaces` in `package.json`
    Npm,
    /// `[workspace] members` in `Cargo.toml`
    Cargo,
}

impl WorkspaceType {
    /// Manifest file that describes each member package
    pub fn manifest_name(&self) -> &'static str {
        match self {
            Self::Kiln => DEFAULT_CONFIG_TOML,
            Self::Pnpm | Self::Yarn | Self::Npm => "package.json",
            Self::Cargo => "Cargo.toml",
        }
    }
}

impl std::fmt::Display for WorkspaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Kiln => "kiln",
            Self::Pnpm => "pnpm",
            Self::Yarn => "yarn",
            Self::Npm => "npm",
            Self::Cargo => "cargo",
        };
        f.write_str(name)
    }
}

/// A detected workspace
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Directory holding the workspace metadata
    pub root: PathBuf,
    /// Tool that declared the workspace
    pub workspace_type: WorkspaceType,
    /// Globs, relative to `root`, matching package directories
    pub package_patterns: Vec<String>,
    /// Globs, relative to `root`, of directories to leave out
    pub exclude_patterns: Vec<String>,
    /// The root is itself the only package
    pub is_single_package: bool,
}

impl Workspace {
    /// Workspace with no member patterns yet
    pub fn new(root: PathBuf, workspace_type: WorkspaceType) -> Self {
        Self {
            root,
            workspace_type,
            package_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            is_single_package: false,
        }
    }

    /// Split `patterns` into includes and `!`-prefixed excludes
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for pattern in patterns {
            let pattern: String = pattern.into();
            let pattern = pattern.trim().trim_start_matches("./").to_string();
            match pattern.strip_prefix('!') {
                Some(excluded) => self.exclude_patterns.push(excluded.to_string()),
                None if !pattern.is_empty() => self.package_patterns.push(pattern),
                None => {}
            }
        }
        self
    }

    /// Add exclusion globs
    pub fn with_excludes<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_patterns
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Workspace whose root directory is the only package
    pub fn single_package(root: PathBuf, workspace_type: WorkspaceType) -> Self {
        let mut ws = Self::new(root, workspace_type);
        ws.package_patterns = vec![".".to_string()];
        ws.is_single_package = true;
        ws
    }

    /// Detect a workspace declared in `path` itself
    pub fn detect(path: &Path) -> Result<Option<Self>> {
        WorkspaceDetectorRegistry::new().detect(path)
    }

    /// Find the workspace enclosing `start`.
    ///
    /// Walks up from `start` to the nearest directory that declares member
    /// packages, so running from inside a member package still finds the
    /// repository root. A single-package match is used only when nothing
    /// above it declares members.
    pub fn find_enclosing(start: &Path) -> Result<Option<Self>> {
        let registry = WorkspaceDetectorRegistry::new();
        let mut single: Option<Self> = None;

        for dir in start.ancestors() {
            let Some(ws) = registry.detect(dir)? else {
                continue;
            };
            if !ws.is_single_package {
                return Ok(Some(ws));
            }
            debug!(dir = %dir.display(), "single package, looking further up");
            single.get_or_insert(ws);
        }

        Ok(single)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_with_patterns_splits_excludes() {
        let ws = Workspace::new(PathBuf::from("/repo"), WorkspaceType::Pnpm)
            .with_patterns(["packages/*", "!packages/legacy", "./apps/*", " "]);

        assert_eq!(ws.package_patterns, vec!["packages/*", "apps/*"]);
        assert_eq!(ws.exclude_patterns, vec!["packages/legacy"]);
    }

    #[test]
    fn test_find_enclosing_from_member_package() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("package.json"),
            r#"{"name": "root", "workspaces": ["packages/*"]}"#,
        )
        .unwrap();
        let member = temp.path().join("packages/core");
        std::fs::create_dir_all(member.join("src")).unwrap();
        std::fs::write(member.join("package.json"), r#"{"name": "core"}"#).unwrap();

        let ws = Workspace::find_enclosing(&member.join("src")).unwrap().unwrap();
        assert_eq!(ws.root, temp.path());
        assert!(!ws.is_single_package);
    }

    #[test]
    fn test_find_enclosing_single_package() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("package.json"), r#"{"name": "solo"}"#).unwrap();

        let ws = Workspace::find_enclosing(temp.path()).unwrap().unwrap();
        assert!(ws.is_single_package);
        assert_eq!(ws.package_patterns, vec!["."]);
    }

    #[test]
    fn test_workspace_type_manifest_and_display() {
        assert_eq!(WorkspaceType::Pnpm.manifest_name(), "package.json");
        assert_eq!(WorkspaceType::Kiln.manifest_name(), "kiln.toml");
        assert_eq!(WorkspaceType::Kiln.to_string(), "kiln");
    }
}
