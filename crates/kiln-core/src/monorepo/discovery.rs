//! Package discovery in monorepos

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use glob::{glob, Pattern};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConfigError, Result};

use super::workspace::{Workspace, WorkspaceType};

/// A discovered package in the workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPackage {
    /// Package name
    pub name: String,
    /// Path to the package directory
    pub path: PathBuf,
    /// Scripts declared by the manifest, keyed by script name
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    /// Dependencies on other packages in the workspace
    pub workspace_dependencies: Vec<String>,
}

impl DiscoveredPackage {
    /// Create a package with no manifest on disk (tests and embedding callers)
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            scripts: BTreeMap::new(),
            workspace_dependencies: Vec::new(),
        }
    }

    /// Add a script
    pub fn with_script(mut self, name: impl Into<String>, command: impl Into<String>) -> Self {
        self.scripts.insert(name.into(), command.into());
        self
    }

    /// Add a workspace dependency
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.workspace_dependencies.push(name.into());
        self
    }
}

/// Package discovery for workspaces
pub struct PackageDiscovery {
    workspace: Workspace,
}

impl PackageDiscovery {
    /// Create a new package discovery instance
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    /// Discover all packages in the workspace.
    ///
    /// Package directories come back in pattern order, each at most once.
    /// Dependencies are narrowed to other workspace members.
    pub fn discover(&self) -> Result<Vec<DiscoveredPackage>> {
        let ws = &self.workspace;
        debug!(
            workspace_type = %ws.workspace_type,
            patterns = ws.package_patterns.len(),
            excludes = ws.exclude_patterns.len(),
            "discovering packages"
        );

        let excludes = ws
            .exclude_patterns
            .iter()
            .map(|p| Pattern::new(p.trim_end_matches('/')).map_err(|e| invalid_pattern(p, e)))
            .collect::<Result<Vec<_>>>()?;
        let manifest_name = ws.workspace_type.manifest_name();

        let mut packages: Vec<DiscoveredPackage> = Vec::new();
        let mut seen_dirs: HashSet<PathBuf> = HashSet::new();
        let mut names: HashMap<String, PathBuf> = HashMap::new();

        for pattern in &ws.package_patterns {
            for dir in self.expand(pattern)? {
                let relative = dir.strip_prefix(&ws.root).unwrap_or(&dir);
                if relative.components().any(|c| c.as_os_str() == "node_modules")
                    || excludes.iter().any(|ex| ex.matches_path(relative))
                {
                    continue;
                }

                let manifest_path = dir.join(manifest_name);
                if !manifest_path.is_file() || !seen_dirs.insert(dir.clone()) {
                    continue;
                }

                let Some(pkg) = self.parse_package(&manifest_path)? else {
                    debug!(path = %manifest_path.display(), "manifest without a package name");
                    continue;
                };

                if let Some(existing) = names.insert(pkg.name.clone(), pkg.path.clone()) {
                    return Err(ConfigError::InvalidValue {
                        field: "workspace".to_string(),
                        message: format!(
                            "package name '{}' is used by both {} and {}",
                            pkg.name,
                            existing.display(),
                            pkg.path.display()
                        ),
                    }
                    .into());
                }
                packages.push(pkg);
            }
        }

        for pkg in &mut packages {
            let own = pkg.name.clone();
            pkg.workspace_dependencies
                .retain(|d| *d != own && names.contains_key(d));
            pkg.workspace_dependencies.sort();
            pkg.workspace_dependencies.dedup();
        }

        info!(count = packages.len(), "discovered packages");
        Ok(packages)
    }

    /// Directories matched by one member pattern, sorted
    fn expand(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let root = &self.workspace.root;
        if pattern == "." {
            return Ok(vec![root.clone()]);
        }

        let full = root.join(pattern.trim_end_matches('/'));
        let mut dirs = Vec::new();
        for entry in glob(&full.to_string_lossy()).map_err(|e| invalid_pattern(pattern, e))? {
            match entry {
                Ok(path) if path.is_dir() => dirs.push(path),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "skipping unreadable path"),
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Parse a package from its manifest
    fn parse_package(&self, manifest_path: &Path) -> Result<Option<DiscoveredPackage>> {
        match self.workspace.workspace_type {
            WorkspaceType::Cargo => parse_cargo_package(manifest_path),
            WorkspaceType::Npm | WorkspaceType::Yarn | WorkspaceType::Pnpm => {
                parse_npm_package(manifest_path)
            }
            WorkspaceType::Kiln => parse_kiln_package(manifest_path),
        }
    }
}

fn invalid_pattern(pattern: &str, error: glob::PatternError) -> crate::error::KilnError {
    ConfigError::InvalidValue {
        field: "workspace packages".to_string(),
        message: format!("invalid pattern '{}': {}", pattern, error),
    }
    .into()
}

fn package_dir(manifest_path: &Path) -> PathBuf {
    manifest_path
        .parent()
        .unwrap_or(Path::new("."))
        .to_path_buf()
}

/// Parse a Cargo package
fn parse_cargo_package(manifest_path: &Path) -> Result<Option<DiscoveredPackage>> {
    let content = std::fs::read_to_string(manifest_path)?;

    #[derive(Deserialize)]
    struct CargoToml {
        package: Option<PackageSection>,
        dependencies: Option<HashMap<String, toml::Value>>,
        #[serde(rename = "dev-dependencies")]
        dev_dependencies: Option<HashMap<String, toml::Value>>,
        #[serde(rename = "build-dependencies")]
        build_dependencies: Option<HashMap<String, toml::Value>>,
    }

    #[derive(Deserialize)]
    struct PackageSection {
        name: String,
    }

    let cargo: CargoToml = toml::from_str(&content)?;

    let Some(package) = cargo.package else {
        return Ok(None);
    };

    let dependencies = [
        cargo.dependencies,
        cargo.dev_dependencies,
        cargo.build_dependencies,
    ]
    .into_iter()
    .flatten()
    .flat_map(|section| section.into_keys())
    .collect();

    Ok(Some(DiscoveredPackage {
        name: package.name,
        path: package_dir(manifest_path),
        scripts: BTreeMap::new(),
        workspace_dependencies: dependencies,
    }))
}

/// Parse an npm package
fn parse_npm_package(manifest_path: &Path) -> Result<Option<DiscoveredPackage>> {
    let content = std::fs::read_to_string(manifest_path)?;

    #[derive(Deserialize)]
    struct PackageJson {
        name: Option<String>,
        #[serde(default)]
        scripts: BTreeMap<String, String>,
        dependencies: Option<HashMap<String, String>>,
        #[serde(rename = "devDependencies")]
        dev_dependencies: Option<HashMap<String, String>>,
        #[serde(rename = "peerDependencies")]
        peer_dependencies: Option<HashMap<String, String>>,
    }

    let pkg: PackageJson = serde_json::from_str(&content)?;

    let Some(name) = pkg.name else {
        return Ok(None);
    };

    let dependencies = [
        pkg.dependencies,
        pkg.dev_dependencies,
        pkg.peer_dependencies,
    ]
    .into_iter()
    .flatten()
    .flat_map(|section| section.into_keys())
    .collect();

    Ok(Some(DiscoveredPackage {
        name,
        path: package_dir(manifest_path),
        scripts: pkg.scripts,
        workspace_dependencies: dependencies,
    }))
}

/// Parse a package described by the `[package]` table of its `kiln.toml`
fn parse_kiln_package(manifest_path: &Path) -> Result<Option<DiscoveredPackage>> {
    let content = std::fs::read_to_string(manifest_path)?;

    #[derive(Deserialize)]
    struct KilnToml {
        package: Option<PackageSection>,
    }

    #[derive(Deserialize)]
    struct PackageSection {
        name: Option<String>,
        #[serde(default)]
        dependencies: Vec<String>,
        #[serde(default)]
        scripts: BTreeMap<String, String>,
    }

    let file: KilnToml = toml::from_str(&content)?;

    let Some((package, name)) = file
        .package
        .and_then(|p| p.name.clone().map(|name| (p, name)))
    else {
        return Ok(None);
    };

    Ok(Some(DiscoveredPackage {
        name,
        path: package_dir(manifest_path),
        scripts: package.scripts,
        workspace_dependencies: package.dependencies,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_discover_cargo_packages() {
        let temp = TempDir::new().unwrap();

        std::fs::write(
            temp.path().join("Cargo.toml"),
            r#"
[workspace]
members = ["crates/*"]
"#,
        )
        .unwrap();

        std::fs::create_dir_all(temp.path().join("crates/pkg-a")).unwrap();
        std::fs::write(
            temp.path().join("crates/pkg-a/Cargo.toml"),
            r#"
[package]
name = "pkg-a"
version = "1.0.0"

[dependencies]
serde = "1"
"#,
        )
        .unwrap();

        std::fs::create_dir_all(temp.path().join("crates/pkg-b")).unwrap();
        std::fs::write(
            temp.path().join("crates/pkg-b/Cargo.toml"),
            r#"
[package]
name = "pkg-b"
version.workspace = true

[dependencies]
pkg-a = { path = "../pkg-a" }
"#,
        )
        .unwrap();

        let ws = Workspace::detect(temp.path()).unwrap().unwrap();
        let packages = PackageDiscovery::new(ws).discover().unwrap();

        assert_eq!(packages.len(), 2);

        let pkg_a = packages.iter().find(|p| p.name == "pkg-a").unwrap();
        let pkg_b = packages.iter().find(|p| p.name == "pkg-b").unwrap();

        assert!(pkg_a.workspace_dependencies.is_empty());
        assert_eq!(pkg_a.path, temp.path().join("crates/pkg-a"));
        assert_eq!(pkg_b.workspace_dependencies, vec!["pkg-a"]);
    }

    #[test]
    fn test_discover_npm_packages_with_scripts() {
        let temp = TempDir::new().unwrap();

        std::fs::write(
            temp.path().join("package.json"),
            r#"{
                "name": "my-monorepo",
                "workspaces": ["packages/*"]
            }"#,
        )
        .unwrap();

        std::fs::create_dir_all(temp.path().join("packages/core")).unwrap();
        std::fs::write(
            temp.path().join("packages/core/package.json"),
            r#"{"name": "@my/core", "version": "1.0.0", "scripts": {"build": "tsc"}}"#,
        )
        .unwrap();

        std::fs::create_dir_all(temp.path().join("packages/utils")).unwrap();
        std::fs::write(
            temp.path().join("packages/utils/package.json"),
            r#"{
                "name": "@my/utils",
                "version": "1.0.0",
                "dependencies": {
                    "@my/core": "workspace:*",
                    "lodash": "^4.0.0"
                }
            }"#,
        )
        .unwrap();

        let ws = Workspace::detect(temp.path()).unwrap().unwrap();
        let packages = PackageDiscovery::new(ws).discover().unwrap();

        assert_eq!(packages.len(), 2);

        let core = packages.iter().find(|p| p.name == "@my/core").unwrap();
        assert_eq!(core.scripts.get("build").map(String::as_str), Some("tsc"));

        let utils = packages.iter().find(|p| p.name == "@my/utils").unwrap();
        assert_eq!(utils.workspace_dependencies, vec!["@my/core"]);
    }

    #[test]
    fn test_discover_kiln_packages() {
        let temp = TempDir::new().unwrap();

        std::fs::write(
            temp.path().join("kiln.toml"),
            "[workspace]\npackages = [\"libs/*\"]\n",
        )
        .unwrap();

        std::fs::create_dir_all(temp.path().join("libs/base")).unwrap();
        std::fs::write(
            temp.path().join("libs/base/kiln.toml"),
            "[package]\nname = \"base\"\n\n[package.scripts]\nbuild = \"make\"\n",
        )
        .unwrap();

        std::fs::create_dir_all(temp.path().join("libs/app")).unwrap();
        std::fs::write(
            temp.path().join("libs/app/kiln.toml"),
            "[package]\nname = \"app\"\ndependencies = [\"base\", \"missing\"]\n",
        )
        .unwrap();

        let ws = Workspace::detect(temp.path()).unwrap().unwrap();
        let packages = PackageDiscovery::new(ws).discover().unwrap();

        let app = packages.iter().find(|p| p.name == "app").unwrap();
        assert_eq!(app.workspace_dependencies, vec!["base"]);
        let base = packages.iter().find(|p| p.name == "base").unwrap();
        assert_eq!(base.scripts.get("build").map(String::as_str), Some("make"));
    }

    #[test]
    fn test_discover_honors_exclusions() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("pnpm-workspace.yaml"),
            "packages:\n  - 'packages/*'\n  - '!packages/scratch'\n",
        )
        .unwrap();

        for name in ["core", "scratch"] {
            let dir = temp.path().join("packages").join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join("package.json"),
                format!(r#"{{"name": "{}"}}"#, name),
            )
            .unwrap();
        }

        let ws = Workspace::detect(temp.path()).unwrap().unwrap();
        let packages = PackageDiscovery::new(ws).discover().unwrap();
        let names: Vec<&str> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["core"]);
    }

    #[test]
    fn test_duplicate_package_names_rejected() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("package.json"),
            r#"{"workspaces": ["packages/*", "apps/*"]}"#,
        )
        .unwrap();

        for dir in ["packages/ui", "apps/ui"] {
            let dir = temp.path().join(dir);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("package.json"), r#"{"name": "ui"}"#).unwrap();
        }

        let ws = Workspace::detect(temp.path()).unwrap().unwrap();
        let err = PackageDiscovery::new(ws).discover().unwrap_err();
        assert!(err.to_string().contains("'ui'"));
    }
}
