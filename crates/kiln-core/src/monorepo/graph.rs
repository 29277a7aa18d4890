//! Dependency graph for monorepo packages

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

use super::discovery::DiscoveredPackage;

/// A node in the dependency graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageNode {
    /// Package name
    pub name: String,
    /// Package directory
    pub path: PathBuf,
    /// Packages this package depends on
    pub dependencies: Vec<String>,
    /// Packages that depend on this package
    pub dependents: Vec<String>,
}

/// Dependency graph for workspace packages
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Nodes indexed by package name
    nodes: HashMap<String, PackageNode>,
    /// Topologically sorted order (dependencies before dependents)
    sorted_order: Vec<String>,
    /// Packages that take part in a dependency cycle
    cyclic: BTreeSet<String>,
}

impl DependencyGraph {
    /// Build a dependency graph from discovered packages.
    ///
    /// Package-level cycles are recorded, not rejected: whether they matter is
    /// decided by the task graph built on top.
    pub fn build(packages: &[DiscoveredPackage]) -> Result<Self> {
        let mut nodes: HashMap<String, PackageNode> = HashMap::new();

        for pkg in packages {
            nodes.insert(
                pkg.name.clone(),
                PackageNode {
                    name: pkg.name.clone(),
                    path: pkg.path.clone(),
                    dependencies: pkg.workspace_dependencies.clone(),
                    dependents: Vec::new(),
                },
            );
        }

        for pkg in packages {
            for dep in &pkg.workspace_dependencies {
                match nodes.get_mut(dep) {
                    Some(dep_node) => dep_node.dependents.push(pkg.name.clone()),
                    None => {
                        return Err(GraphError::UnknownPackage {
                            package: pkg.name.clone(),
                            dependency: dep.clone(),
                        }
                        .into())
                    }
                }
            }
        }

        let (sorted_order, cyclic) = Self::topological_sort(&nodes);

        Ok(Self {
            nodes,
            sorted_order,
            cyclic,
        })
    }

    /// Kahn's algorithm; nodes left over are part of (or behind) a cycle
    fn topological_sort(nodes: &HashMap<String, PackageNode>) -> (Vec<String>, BTreeSet<String>) {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut sorted: Vec<String> = Vec::new();

        // Sorted seed keeps the order stable across runs
        let mut names: Vec<&String> = nodes.keys().collect();
        names.sort();

        for name in names {
            let degree = nodes[name].dependencies.len();
            in_degree.insert(name, degree);
            if degree == 0 {
                queue.push_back(name);
            }
        }

        while let Some(name) = queue.pop_front() {
            sorted.push(name.to_string());

            let mut dependents: Vec<&String> = nodes[name].dependents.iter().collect();
            dependents.sort();
            for dependent in dependents {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        let in_sorted: HashSet<&String> = sorted.iter().collect();
        let cyclic = nodes
            .keys()
            .filter(|n| !in_sorted.contains(n))
            .cloned()
            .collect();

        (sorted, cyclic)
    }

    /// Get packages in topologically sorted order (dependencies first)
    pub fn sorted(&self) -> &[String] {
        &self.sorted_order
    }

    /// Check if there are any circular dependencies
    pub fn has_cycles(&self) -> bool {
        !self.cyclic.is_empty()
    }

    /// Packages on (or behind) a dependency cycle, sorted
    pub fn cyclic(&self) -> impl Iterator<Item = &str> {
        self.cyclic.iter().map(String::as_str)
    }

    /// Get a package node
    pub fn get(&self, name: &str) -> Option<&PackageNode> {
        self.nodes.get(name)
    }

    /// Whether the graph contains a package
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Directory of a package
    pub fn package_dir(&self, name: &str) -> Option<&Path> {
        self.nodes.get(name).map(|n| n.path.as_path())
    }

    /// Number of packages
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no packages
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get all packages that a given package depends on (direct dependencies)
    pub fn get_dependencies(&self, name: &str) -> Vec<String> {
        self.nodes
            .get(name)
            .map(|n| n.dependencies.clone())
            .unwrap_or_default()
    }
}
