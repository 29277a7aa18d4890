//! Task definition resolution
//!
//! Repository defaults come from `tasks.pipeline` in the root config; each
//! package may override entries in its own `kiln.toml`. An override replaces
//! the default outright, except that a `...` marker in `depends_on`,
//! `before` or `after` splices the default list in at that position. An
//! override written in the short form (a bare dependency list) keeps the
//! default's other settings.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, instrument};

use kiln_core::config::{PackageTasksConfig, PipelineEntry, PipelineTask};
use kiln_core::monorepo::DiscoveredPackage;

use crate::task::{TaskCommand, TaskDefinition, TaskId, TaskReference};

/// Errors found while resolving task definitions
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// A reference could not be parsed
    #[error("Invalid reference in {task}: {message}")]
    InvalidReference {
        /// Task holding the reference
        task: TaskId,
        /// Parser message
        message: String,
    },

    /// A dependency names a task that is not defined
    #[error("{task} depends on '{reference}', but no task '{missing}' is defined")]
    UnknownTask {
        /// Task holding the reference
        task: TaskId,
        /// The reference as written
        reference: String,
        /// Missing task name
        missing: String,
    },

    /// A dependency names a package that is not in the workspace
    #[error("{task} depends on '{reference}', but package '{package}' is not in the workspace")]
    UnknownPackage {
        /// Task holding the reference
        task: TaskId,
        /// The reference as written
        reference: String,
        /// Missing package
        package: String,
    },
}

/// Resolved tasks of one package
#[derive(Debug, Clone, Default)]
pub struct PackageTasks {
    /// Package name
    pub package: String,
    /// Tasks that exist in the package, keyed by name
    pub tasks: BTreeMap<String, TaskDefinition>,
    /// Every task name configured for the package, present or not
    pub defined: BTreeSet<String>,
}

impl PackageTasks {
    /// A task present in the package
    pub fn get(&self, task: &str) -> Option<&TaskDefinition> {
        self.tasks.get(task)
    }

    /// Whether the package has the task
    pub fn has(&self, task: &str) -> bool {
        self.tasks.contains_key(task)
    }
}

/// Resolved tasks for every package in the workspace
pub type WorkspaceTasks = BTreeMap<String, PackageTasks>;

/// Merges repository defaults with package overrides
#[derive(Debug, Clone)]
pub struct DefinitionResolver<'a> {
    defaults: &'a BTreeMap<String, PipelineEntry>,
}

impl<'a> DefinitionResolver<'a> {
    /// Create a resolver over the repository default pipeline
    pub fn new(defaults: &'a BTreeMap<String, PipelineEntry>) -> Self {
        Self { defaults }
    }

    /// Resolve every package, then check that dependency references point
    /// at defined tasks
    #[instrument(skip_all, fields(packages = packages.len()))]
    pub fn resolve_workspace(
        &self,
        packages: &[(DiscoveredPackage, PackageTasksConfig)],
    ) -> Result<WorkspaceTasks, DefinitionError> {
        let mut resolved = WorkspaceTasks::new();
        for (package, overrides) in packages {
            resolved.insert(package.name.clone(), self.resolve_package(package, overrides)?);
        }
        validate_references(&resolved)?;
        debug!(packages = resolved.len(), "task definitions resolved");
        Ok(resolved)
    }

    /// Resolve the tasks of one package
    pub fn resolve_package(
        &self,
        package: &DiscoveredPackage,
        overrides: &PackageTasksConfig,
    ) -> Result<PackageTasks, DefinitionError> {
        let names: BTreeSet<&String> = self.defaults.keys().chain(overrides.tasks.keys()).collect();
        let mut result = PackageTasks {
            package: package.name.clone(),
            ..Default::default()
        };

        for name in names {
            result.defined.insert(name.clone());
            let id = TaskId::new(&package.name, name);
            let merged = merge_entries(self.defaults.get(name), overrides.tasks.get(name));

            let command = match (&merged.command, merged.script) {
                (Some(command), _) => TaskCommand::Shell(command.clone()),
                (None, true) => match package.scripts.get(name) {
                    Some(script) => TaskCommand::Shell(script.clone()),
                    None => {
                        debug!(task = %id, "no command or script, task absent from package");
                        continue;
                    }
                },
                (None, false) => TaskCommand::Structural,
            };

            let definition = TaskDefinition {
                name: name.clone(),
                command,
                depends_on: parse_references(&id, &merged.depends_on, false)?,
                before: parse_references(&id, &merged.before, true)?,
                after: parse_references(&id, &merged.after, true)?,
                inputs: merged.inputs,
                outputs: merged.outputs,
                output_detection: merged.output_detection,
                env: merged.env,
            };
            result.tasks.insert(name.clone(), definition);
        }

        Ok(result)
    }
}

/// Merge a default entry with a package override
fn merge_entries(default: Option<&PipelineEntry>, local: Option<&PipelineEntry>) -> PipelineTask {
    let default_task = default.map(PipelineEntry::to_task);

    match (default_task, local) {
        (None, None) => PipelineTask::default(),
        (Some(default), None) => default,
        (None, Some(local)) => {
            let mut task = local.to_task();
            task.depends_on = splice(&task.depends_on, &[]);
            task.before = splice(&task.before, &[]);
            task.after = splice(&task.after, &[]);
            task
        }
        (Some(default), Some(PipelineEntry::Dependencies(deps))) => PipelineTask {
            depends_on: splice(deps, &default.depends_on),
            ..default
        },
        (Some(default), Some(PipelineEntry::Task(local))) => PipelineTask {
            depends_on: splice(&local.depends_on, &default.depends_on),
            before: splice(&local.before, &default.before),
            after: splice(&local.after, &default.after),
            ..local.clone()
        },
    }
}

/// Replace every `...` in `list` with `defaults`
fn splice(list: &[String], defaults: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(list.len() + defaults.len());
    for item in list {
        if item == "..." {
            out.extend(defaults.iter().cloned());
        } else {
            out.push(item.clone());
        }
    }
    out
}

fn parse_references(
    task: &TaskId,
    references: &[String],
    allow_wildcard: bool,
) -> Result<Vec<TaskReference>, DefinitionError> {
    let mut parsed = Vec::with_capacity(references.len());
    for reference in references {
        let r = TaskReference::parse(reference, allow_wildcard).map_err(|message| {
            DefinitionError::InvalidReference {
                task: task.clone(),
                message,
            }
        })?;
        // Defaults are already spliced in; a leftover marker has nothing to add
        if r != TaskReference::IncludeDefaults && !parsed.contains(&r) {
            parsed.push(r);
        }
    }
    Ok(parsed)
}

/// Every non-wildcard dependency must name a defined task
fn validate_references(tasks: &WorkspaceTasks) -> Result<(), DefinitionError> {
    for package in tasks.values() {
        for definition in package.tasks.values() {
            let id = TaskId::new(&package.package, &definition.name);
            for reference in &definition.depends_on {
                match reference {
                    TaskReference::Local(name) if !package.defined.contains(name) => {
                        return Err(DefinitionError::UnknownTask {
                            task: id,
                            reference: reference.to_string(),
                            missing: name.clone(),
                        });
                    }
                    TaskReference::Exact(target) => match tasks.get(&target.package) {
                        None => {
                            return Err(DefinitionError::UnknownPackage {
                                task: id,
                                reference: reference.to_string(),
                                package: target.package.clone(),
                            });
                        }
                        Some(other) if !other.defined.contains(&target.task_name) => {
                            return Err(DefinitionError::UnknownTask {
                                task: id,
                                reference: reference.to_string(),
                                missing: target.task_name.clone(),
                            });
                        }
                        _ => {}
                    },
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(deps: &[&str]) -> PipelineEntry {
        PipelineEntry::Dependencies(deps.iter().map(|s| s.to_string()).collect())
    }

    fn task(command: Option<&str>, deps: &[&str]) -> PipelineEntry {
        PipelineTask {
            command: command.map(str::to_string),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            outputs: vec!["dist/**".to_string()],
            ..Default::default()
        }
        .into()
    }

    fn defaults() -> BTreeMap<String, PipelineEntry> {
        let mut d = BTreeMap::new();
        d.insert("build".to_string(), task(None, &["^build"]));
        d.insert("test".to_string(), entry(&["build"]));
        d.insert("lint".to_string(), entry(&[]));
        d
    }

    fn package() -> DiscoveredPackage {
        DiscoveredPackage::new("app", "packages/app")
            .with_script("build", "tsc")
            .with_script("test", "vitest run")
    }

    fn overrides(tasks: &[(&str, PipelineEntry)]) -> PackageTasksConfig {
        PackageTasksConfig {
            tasks: tasks
                .iter()
                .map(|(n, e)| (n.to_string(), e.clone()))
                .collect(),
        }
    }

    #[test]
    fn test_defaults_apply_with_package_scripts() {
        let defaults = defaults();
        let resolved = DefinitionResolver::new(&defaults)
            .resolve_package(&package(), &PackageTasksConfig::default())
            .unwrap();

        let build = resolved.get("build").unwrap();
        assert_eq!(build.command, TaskCommand::Shell("tsc".to_string()));
        assert_eq!(build.depends_on, vec![TaskReference::Dependencies("build".to_string())]);
        assert_eq!(build.outputs, vec!["dist/**"]);

        // No lint script: defined but absent
        assert!(!resolved.has("lint"));
        assert!(resolved.defined.contains("lint"));
    }

    #[test]
    fn test_override_replaces_default() {
        let defaults = defaults();
        let local = overrides(&[("build", task(Some("tsc -p tsconfig.build.json"), &["codegen"]))]);
        let resolved = DefinitionResolver::new(&defaults)
            .resolve_package(&package(), &local)
            .unwrap();

        let build = resolved.get("build").unwrap();
        assert_eq!(build.command.as_shell(), Some("tsc -p tsconfig.build.json"));
        assert_eq!(build.depends_on, vec![TaskReference::Local("codegen".to_string())]);
    }

    #[test]
    fn test_include_defaults_marker_splices_in_place() {
        let defaults = defaults();
        let local = overrides(&[("build", entry(&["codegen", "...", "app-config#build"]))]);
        let resolved = DefinitionResolver::new(&defaults)
            .resolve_package(&package(), &local)
            .unwrap();

        let build = resolved.get("build").unwrap();
        assert_eq!(
            build.depends_on,
            vec![
                TaskReference::Local("codegen".to_string()),
                TaskReference::Dependencies("build".to_string()),
                TaskReference::Exact(TaskId::new("app-config", "build")),
            ]
        );
        // Short form keeps the default's other settings
        assert_eq!(build.outputs, vec!["dist/**"]);
        assert_eq!(build.command.as_shell(), Some("tsc"));
    }

    #[test]
    fn test_marker_in_ordering_hints() {
        let mut defaults = defaults();
        defaults.insert(
            "lint".to_string(),
            PipelineTask {
                command: Some("eslint .".to_string()),
                after: vec!["build".to_string()],
                ..Default::default()
            }
            .into(),
        );
        let local = overrides(&[(
            "lint",
            PipelineTask {
                command: Some("eslint src".to_string()),
                after: vec!["...".to_string(), "*".to_string()],
                ..Default::default()
            }
            .into(),
        )]);

        let resolved = DefinitionResolver::new(&defaults)
            .resolve_package(&package(), &local)
            .unwrap();
        let lint = resolved.get("lint").unwrap();
        assert_eq!(
            lint.after,
            vec![TaskReference::Local("build".to_string()), TaskReference::AllLocal]
        );
    }

    #[test]
    fn test_structural_task() {
        let mut defaults = defaults();
        defaults.insert(
            "ci".to_string(),
            PipelineTask {
                script: false,
                depends_on: vec!["build".to_string(), "test".to_string()],
                ..Default::default()
            }
            .into(),
        );
        let resolved = DefinitionResolver::new(&defaults)
            .resolve_package(&package(), &PackageTasksConfig::default())
            .unwrap();
        assert!(resolved.get("ci").unwrap().is_structural());
    }

    #[test]
    fn test_unknown_local_dependency_is_fatal() {
        let defaults = defaults();
        let local = overrides(&[("build", task(Some("tsc"), &["does-not-exist"]))]);
        let err = DefinitionResolver::new(&defaults)
            .resolve_workspace(&[(package(), local)])
            .unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownTask { .. }));
        assert!(err.to_string().contains("does-not-exist"));
    }

    #[test]
    fn test_unknown_package_dependency_is_fatal() {
        let defaults = defaults();
        let local = overrides(&[("build", task(Some("tsc"), &["ghost#build"]))]);
        let err = DefinitionResolver::new(&defaults)
            .resolve_workspace(&[(package(), local)])
            .unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownPackage { .. }));
    }

    #[test]
    fn test_missing_caret_target_is_not_fatal() {
        let mut defaults = BTreeMap::new();
        defaults.insert("build".to_string(), entry(&["^compile"]));
        let resolved = DefinitionResolver::new(&defaults)
            .resolve_workspace(&[(package(), PackageTasksConfig::default())])
            .unwrap();
        assert!(resolved["app"].has("build"));
    }

    #[test]
    fn test_wildcard_rejected_in_depends_on() {
        let defaults = defaults();
        let local = overrides(&[("build", entry(&["*"]))]);
        let err = DefinitionResolver::new(&defaults)
            .resolve_package(&package(), &local)
            .unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidReference { .. }));
    }
}
