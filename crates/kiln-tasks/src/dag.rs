//! Task DAG construction and management

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;

use tracing::{debug, info, instrument};

use kiln_core::monorepo::DependencyGraph;

use crate::definition::WorkspaceTasks;
use crate::task::{TaskDefinition, TaskId, TaskReference};

/// A node in the task execution DAG
#[derive(Debug, Clone)]
pub struct TaskNode {
    /// Task identifier
    pub id: TaskId,
    /// The resolved task definition
    pub definition: TaskDefinition,
    /// Package directory the task runs in
    pub package_dir: PathBuf,
    /// Tasks that must complete before this one
    pub dependencies: BTreeSet<TaskId>,
    /// Tasks waiting on this one
    pub dependents: BTreeSet<TaskId>,
    /// Number of distinct transitive dependents
    pub weight: usize,
    /// Ordering preference from `before`/`after` hints; higher runs earlier
    pub bias: i64,
    /// Execution wave (longest dependency chain below this node)
    pub wave: usize,
}

impl TaskNode {
    /// Command to run, `None` for structural tasks
    pub fn command(&self) -> Option<&str> {
        self.definition.command.as_shell()
    }
}

/// Directed acyclic graph of tasks to execute
#[derive(Debug, Clone)]
pub struct TaskDag {
    nodes: BTreeMap<TaskId, TaskNode>,
    waves: Vec<Vec<TaskId>>,
    sorted_order: Vec<TaskId>,
}

impl TaskDag {
    /// Build the task graph for `target_tasks` in `packages`.
    ///
    /// Each requested task present in a selected package becomes a node;
    /// dependency references then pull in every task they require, in any
    /// package of the workspace.
    #[instrument(skip_all, fields(packages = packages.len(), target_tasks = target_tasks.len()))]
    pub fn build(
        package_graph: &DependencyGraph,
        tasks: &WorkspaceTasks,
        target_tasks: &[String],
        packages: &[String],
    ) -> Result<Self, DagError> {
        let mut queue: VecDeque<TaskId> = VecDeque::new();

        for task_name in target_tasks {
            let mut found = false;
            for pkg in packages {
                if tasks.get(pkg).is_some_and(|t| t.has(task_name)) {
                    queue.push_back(TaskId::new(pkg, task_name));
                    found = true;
                }
            }
            if !found {
                return Err(DagError::TaskNotFound(task_name.clone()));
            }
        }

        let mut nodes: BTreeMap<TaskId, TaskNode> = BTreeMap::new();
        while let Some(id) = queue.pop_front() {
            if nodes.contains_key(&id) {
                continue;
            }
            let definition = tasks
                .get(&id.package)
                .and_then(|t| t.get(&id.task_name))
                .ok_or_else(|| DagError::TaskNotFound(id.to_string()))?
                .clone();
            let package_dir = package_graph
                .package_dir(&id.package)
                .ok_or_else(|| DagError::UnknownPackage(id.package.clone()))?
                .to_path_buf();

            let dependencies: BTreeSet<TaskId> = definition
                .depends_on
                .iter()
                .flat_map(|r| resolve_reference(&id, r, package_graph, tasks))
                .filter(|dep| dep != &id)
                .collect();

            for dep in &dependencies {
                if !nodes.contains_key(dep) {
                    queue.push_back(dep.clone());
                }
            }

            nodes.insert(
                id.clone(),
                TaskNode {
                    id,
                    definition,
                    package_dir,
                    dependencies,
                    dependents: BTreeSet::new(),
                    weight: 0,
                    bias: 0,
                    wave: 0,
                },
            );
        }

        let edges: Vec<(TaskId, TaskId)> = nodes
            .values()
            .flat_map(|n| n.dependencies.iter().map(|d| (d.clone(), n.id.clone())))
            .collect();
        for (dependency, dependent) in edges {
            if let Some(node) = nodes.get_mut(&dependency) {
                node.dependents.insert(dependent);
            }
        }

        let sorted_order = Self::topological_sort(&nodes)?;
        let waves = Self::compute_waves(&mut nodes, &sorted_order);
        Self::compute_weights(&mut nodes);
        Self::compute_bias(&mut nodes, package_graph, tasks);

        info!(
            task_count = nodes.len(),
            wave_count = waves.len(),
            "task DAG built"
        );

        Ok(Self {
            nodes,
            waves,
            sorted_order,
        })
    }

    /// Kahn's algorithm; on failure the error names the shortest cycle
    fn topological_sort(nodes: &BTreeMap<TaskId, TaskNode>) -> Result<Vec<TaskId>, DagError> {
        let mut in_degree: HashMap<&TaskId, usize> = HashMap::new();
        let mut queue: VecDeque<&TaskId> = VecDeque::new();
        let mut sorted: Vec<TaskId> = Vec::with_capacity(nodes.len());

        for (id, node) in nodes {
            let degree = node.dependencies.len();
            in_degree.insert(id, degree);
            if degree == 0 {
                queue.push_back(id);
            }
        }

        while let Some(id) = queue.pop_front() {
            sorted.push(id.clone());
            for dependent in &nodes[id].dependents {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if sorted.len() != nodes.len() {
            let remaining: BTreeSet<&TaskId> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(id, _)| id)
                .collect();
            return Err(DagError::Cycle(shortest_cycle(nodes, &remaining)));
        }

        Ok(sorted)
    }

    /// Longest-path depth of every node, grouped into waves
    fn compute_waves(nodes: &mut BTreeMap<TaskId, TaskNode>, sorted: &[TaskId]) -> Vec<Vec<TaskId>> {
        let mut waves: Vec<Vec<TaskId>> = Vec::new();

        for id in sorted {
            let wave = nodes[id]
                .dependencies
                .iter()
                .map(|dep| nodes[dep].wave + 1)
                .max()
                .unwrap_or(0);
            if let Some(node) = nodes.get_mut(id) {
                node.wave = wave;
            }
            if waves.len() <= wave {
                waves.resize_with(wave + 1, Vec::new);
            }
            waves[wave].push(id.clone());
        }

        waves
    }

    /// Weight: number of distinct tasks that transitively depend on a node
    fn compute_weights(nodes: &mut BTreeMap<TaskId, TaskNode>) {
        let weights: Vec<(TaskId, usize)> = nodes
            .keys()
            .map(|id| {
                let mut seen: BTreeSet<&TaskId> = BTreeSet::new();
                let mut queue: VecDeque<&TaskId> = nodes[id].dependents.iter().collect();
                while let Some(next) = queue.pop_front() {
                    if seen.insert(next) {
                        queue.extend(nodes[next].dependents.iter());
                    }
                }
                (id.clone(), seen.len())
            })
            .collect();

        for (id, weight) in weights {
            if let Some(node) = nodes.get_mut(&id) {
                node.weight = weight;
            }
        }
    }

    /// Apply `before`/`after` hints: each (earlier, later) pair raises the
    /// earlier task and lowers the later one. Hints never add edges.
    fn compute_bias(
        nodes: &mut BTreeMap<TaskId, TaskNode>,
        package_graph: &DependencyGraph,
        tasks: &WorkspaceTasks,
    ) {
        let mut pairs: Vec<(TaskId, TaskId)> = Vec::new();

        for node in nodes.values() {
            let targets = |references: &[TaskReference]| -> BTreeSet<TaskId> {
                references
                    .iter()
                    .flat_map(|r| match r {
                        TaskReference::AllLocal => nodes
                            .keys()
                            .filter(|other| other.package == node.id.package)
                            .cloned()
                            .collect(),
                        _ => resolve_reference(&node.id, r, package_graph, tasks),
                    })
                    .filter(|other| other != &node.id && nodes.contains_key(other))
                    .collect()
            };

            for later in targets(&node.definition.before) {
                pairs.push((node.id.clone(), later));
            }
            for earlier in targets(&node.definition.after) {
                pairs.push((earlier, node.id.clone()));
            }
        }

        for (earlier, later) in pairs {
            if let Some(node) = nodes.get_mut(&earlier) {
                node.bias += 1;
            }
            if let Some(node) = nodes.get_mut(&later) {
                node.bias -= 1;
            }
        }
    }

    /// Get all task nodes
    pub fn nodes(&self) -> &BTreeMap<TaskId, TaskNode> {
        &self.nodes
    }

    /// Get a specific task node
    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// Get execution waves
    pub fn waves(&self) -> &[Vec<TaskId>] {
        &self.waves
    }

    /// Get the total number of tasks
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the DAG is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of distinct packages with tasks in the graph
    pub fn package_count(&self) -> usize {
        self.nodes
            .keys()
            .map(|id| id.package.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Get topologically sorted order
    pub fn sorted(&self) -> &[TaskId] {
        &self.sorted_order
    }

    /// Get a human-readable summary of the execution plan
    pub fn execution_plan(&self) -> String {
        let mut plan = String::new();
        for (i, wave) in self.waves.iter().enumerate() {
            plan.push_str(&format!("Wave {} ({} tasks):\n", i, wave.len()));
            for id in wave {
                if let Some(node) = self.nodes.get(id) {
                    let cmd = node.command().unwrap_or("<no command>");
                    let deps: Vec<String> =
                        node.dependencies.iter().map(|d| d.to_string()).collect();
                    if deps.is_empty() {
                        plan.push_str(&format!("  {} -> {}\n", id, cmd));
                    } else {
                        plan.push_str(&format!(
                            "  {} -> {} (after: {})\n",
                            id,
                            cmd,
                            deps.join(", ")
                        ));
                    }
                }
            }
        }
        plan
    }
}

/// Tasks a reference points at, limited to tasks that exist
fn resolve_reference(
    from: &TaskId,
    reference: &TaskReference,
    package_graph: &DependencyGraph,
    tasks: &WorkspaceTasks,
) -> Vec<TaskId> {
    let exists = |pkg: &str, task: &str| tasks.get(pkg).is_some_and(|t| t.has(task));

    match reference {
        TaskReference::Local(name) => {
            if exists(&from.package, name) {
                vec![TaskId::new(&from.package, name)]
            } else {
                debug!(task = %from, dependency = %name, "dependency not present in package, skipping");
                Vec::new()
            }
        }
        TaskReference::Dependencies(name) => {
            let mut deps = package_graph.get_dependencies(&from.package);
            deps.sort();
            deps.into_iter()
                .filter(|pkg| exists(pkg, name))
                .map(|pkg| TaskId::new(pkg, name))
                .collect()
        }
        TaskReference::Exact(id) => {
            if exists(&id.package, &id.task_name) {
                vec![id.clone()]
            } else {
                debug!(task = %from, dependency = %id, "dependency not present, skipping");
                Vec::new()
            }
        }
        TaskReference::IncludeDefaults | TaskReference::AllLocal => Vec::new(),
    }
}

/// Shortest dependency cycle among `remaining`, as `a#x -> b#y -> a#x`
fn shortest_cycle(nodes: &BTreeMap<TaskId, TaskNode>, remaining: &BTreeSet<&TaskId>) -> String {
    let mut best: Option<Vec<&TaskId>> = None;

    for &start in remaining {
        // BFS along dependency edges back to `start`
        let mut parent: HashMap<&TaskId, &TaskId> = HashMap::new();
        let mut queue: VecDeque<&TaskId> = VecDeque::from([start]);
        let mut closing: Option<&TaskId> = None;

        'search: while let Some(current) = queue.pop_front() {
            for dep in &nodes[current].dependencies {
                if !remaining.contains(dep) {
                    continue;
                }
                if dep == start {
                    closing = Some(current);
                    break 'search;
                }
                if !parent.contains_key(dep) {
                    parent.insert(dep, current);
                    queue.push_back(dep);
                }
            }
        }

        if let Some(mut current) = closing {
            let mut path = vec![current];
            while current != start {
                current = parent[current];
                path.push(current);
            }
            path.reverse();
            path.push(start);
            if best.as_ref().map_or(true, |b| path.len() < b.len()) {
                best = Some(path);
            }
        }
    }

    match best {
        Some(path) => path
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" -> "),
        None => remaining
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", "),
    }
}

/// Errors during DAG construction
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    /// Cyclic dependency detected
    #[error("Cyclic task dependency: {0}")]
    Cycle(String),

    /// A requested task exists in no selected package
    #[error("Task '{0}' is not defined in any selected package")]
    TaskNotFound(String),

    /// A task belongs to a package outside the workspace graph
    #[error("Package '{0}' is not part of the workspace")]
    UnknownPackage(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::PackageTasks;
    use kiln_core::monorepo::DiscoveredPackage;

    fn create_test_graph() -> DependencyGraph {
        let packages = vec![
            DiscoveredPackage::new("core", "packages/core"),
            DiscoveredPackage::new("utils", "packages/utils").with_dependency("core"),
            DiscoveredPackage::new("app", "packages/app")
                .with_dependency("core")
                .with_dependency("utils"),
            DiscoveredPackage::new("docs", "packages/docs").with_dependency("core"),
        ];
        DependencyGraph::build(&packages).unwrap()
    }

    fn package(name: &str, definitions: Vec<TaskDefinition>) -> (String, PackageTasks) {
        let tasks: BTreeMap<String, TaskDefinition> = definitions
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        let defined = tasks.keys().cloned().collect();
        (
            name.to_string(),
            PackageTasks {
                package: name.to_string(),
                tasks,
                defined,
            },
        )
    }

    fn build_def() -> TaskDefinition {
        TaskDefinition::new("build")
            .with_command("tsc")
            .with_depends_on(TaskReference::Dependencies("build".to_string()))
    }

    fn test_def() -> TaskDefinition {
        TaskDefinition::new("test")
            .with_command("vitest run")
            .with_depends_on(TaskReference::Local("build".to_string()))
    }

    fn create_tasks() -> WorkspaceTasks {
        [
            package("core", vec![build_def(), test_def()]),
            package("utils", vec![build_def(), test_def()]),
            package("app", vec![build_def(), test_def()]),
            // docs has no build; ^build from its dependents skips it
            package("docs", vec![test_def()]),
        ]
        .into_iter()
        .collect()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_dag_waves_and_weights() {
        let dag = TaskDag::build(
            &create_test_graph(),
            &create_tasks(),
            &names(&["build"]),
            &names(&["core", "utils", "app"]),
        )
        .unwrap();

        assert_eq!(dag.len(), 3);
        assert_eq!(dag.get(&TaskId::new("core", "build")).unwrap().wave, 0);
        assert_eq!(dag.get(&TaskId::new("utils", "build")).unwrap().wave, 1);
        assert_eq!(dag.get(&TaskId::new("app", "build")).unwrap().wave, 2);

        assert_eq!(dag.get(&TaskId::new("core", "build")).unwrap().weight, 2);
        assert_eq!(dag.get(&TaskId::new("utils", "build")).unwrap().weight, 1);
        assert_eq!(dag.get(&TaskId::new("app", "build")).unwrap().weight, 0);
        assert_eq!(
            dag.get(&TaskId::new("core", "build")).unwrap().package_dir,
            PathBuf::from("packages/core")
        );
        assert_eq!(dag.sorted()[0], TaskId::new("core", "build"));
    }

    #[test]
    fn test_dependencies_pull_in_unselected_packages() {
        let dag = TaskDag::build(
            &create_test_graph(),
            &create_tasks(),
            &names(&["test"]),
            &names(&["app"]),
        )
        .unwrap();

        // app#test -> app#build -> core#build, utils#build
        assert_eq!(dag.len(), 4);
        assert_eq!(dag.package_count(), 3);
        let app_build = dag.get(&TaskId::new("app", "build")).unwrap();
        assert!(app_build.dependencies.contains(&TaskId::new("core", "build")));
        assert!(app_build.dependencies.contains(&TaskId::new("utils", "build")));
    }

    #[test]
    fn test_caret_reference_skips_packages_without_task() {
        let graph = create_test_graph();
        let mut tasks = create_tasks();
        tasks.insert(
            "docs".to_string(),
            package(
                "docs",
                vec![TaskDefinition::new("lint")
                    .with_command("eslint .")
                    .with_depends_on(TaskReference::Dependencies("lint".to_string()))],
            )
            .1,
        );

        let dag = TaskDag::build(&graph, &tasks, &names(&["lint"]), &names(&["docs"])).unwrap();
        assert_eq!(dag.len(), 1);
        assert!(dag.get(&TaskId::new("docs", "lint")).unwrap().dependencies.is_empty());
    }

    #[test]
    fn test_task_present_in_subset_of_packages() {
        let dag = TaskDag::build(
            &create_test_graph(),
            &create_tasks(),
            &names(&["build"]),
            &names(&["core", "docs"]),
        )
        .unwrap();
        assert_eq!(dag.len(), 1);
    }

    #[test]
    fn test_task_not_found() {
        let result = TaskDag::build(
            &create_test_graph(),
            &create_tasks(),
            &names(&["deploy"]),
            &names(&["core"]),
        );
        assert!(matches!(result, Err(DagError::TaskNotFound(t)) if t == "deploy"));

        let result = TaskDag::build(
            &create_test_graph(),
            &create_tasks(),
            &names(&["build"]),
            &names(&["docs"]),
        );
        assert!(matches!(result, Err(DagError::TaskNotFound(_))));
    }

    #[test]
    fn test_cycle_reports_shortest_cycle() {
        let graph = create_test_graph();
        let tasks: WorkspaceTasks = [
            package(
                "core",
                vec![TaskDefinition::new("build")
                    .with_command("make")
                    .with_depends_on(TaskReference::Exact(TaskId::new("utils", "build")))],
            ),
            package(
                "utils",
                vec![
                    TaskDefinition::new("build")
                        .with_command("make")
                        .with_depends_on(TaskReference::Exact(TaskId::new("core", "build")))
                        .with_depends_on(TaskReference::Local("gen".to_string())),
                    TaskDefinition::new("gen")
                        .with_command("make gen")
                        .with_depends_on(TaskReference::Exact(TaskId::new("app", "build"))),
                ],
            ),
            package(
                "app",
                vec![TaskDefinition::new("build")
                    .with_command("make")
                    .with_depends_on(TaskReference::Exact(TaskId::new("utils", "build")))],
            ),
        ]
        .into_iter()
        .collect();

        let err = TaskDag::build(&graph, &tasks, &names(&["build"]), &names(&["core"]))
            .unwrap_err();
        match err {
            DagError::Cycle(cycle) => assert_eq!(cycle, "core#build -> utils#build -> core#build"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_before_after_bias() {
        let graph = create_test_graph();
        let tasks: WorkspaceTasks = [package(
            "core",
            vec![
                TaskDefinition::new("lint")
                    .with_command("eslint .")
                    .with_after(TaskReference::AllLocal),
                TaskDefinition::new("typecheck")
                    .with_command("tsc --noEmit")
                    .with_before(TaskReference::Local("format".to_string())),
                TaskDefinition::new("format").with_command("prettier --check ."),
            ],
        )]
        .into_iter()
        .collect();

        let dag = TaskDag::build(
            &graph,
            &tasks,
            &names(&["lint", "typecheck", "format"]),
            &names(&["core"]),
        )
        .unwrap();

        let bias = |task: &str| dag.get(&TaskId::new("core", task)).unwrap().bias;
        assert_eq!(bias("lint"), -2);
        assert_eq!(bias("typecheck"), 2);
        assert_eq!(bias("format"), 0);
        // Hints never create edges
        assert!(dag.nodes().values().all(|n| n.dependencies.is_empty()));
    }

    #[test]
    fn test_execution_plan_output() {
        let dag = TaskDag::build(
            &create_test_graph(),
            &create_tasks(),
            &names(&["build"]),
            &names(&["core", "utils"]),
        )
        .unwrap();
        let plan = dag.execution_plan();

        assert!(plan.contains("Wave 0"));
        assert!(plan.contains("core#build -> tsc"));
        assert!(plan.contains("utils#build -> tsc (after: core#build)"));
    }
}
