//! Task types and definitions

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use kiln_core::config::{check_task_reference, OutputDetectionKind};

/// Unique identifier for a task within the workspace
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    /// Package name
    pub package: String,
    /// Task name (e.g., "build", "test", "lint")
    pub task_name: String,
}

impl TaskId {
    /// Create a new task ID
    pub fn new(package: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            task_name: task_name.into(),
        }
    }

    /// Parse a task ID from "package#task" format
    pub fn parse(s: &str) -> Option<Self> {
        let (package, task) = s.rsplit_once('#')?;
        if package.is_empty() || task.is_empty() {
            return None;
        }
        Some(Self::new(package, task))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.package, self.task_name)
    }
}

/// A reference to other tasks, as written in `depends_on`, `before` and `after`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskReference {
    /// `name`: a task of the same package
    Local(String),
    /// `^name`: the task in every direct dependency package that has it
    Dependencies(String),
    /// `package#name`: one exact task
    Exact(TaskId),
    /// `...`: splice in the repository default list at this position
    IncludeDefaults,
    /// `*`: every other task of the package (ordering hints only)
    AllLocal,
}

impl TaskReference {
    /// Parse a reference; `allow_wildcard` permits `*`
    pub fn parse(reference: &str, allow_wildcard: bool) -> Result<Self, String> {
        check_task_reference(reference, allow_wildcard)?;

        Ok(match reference {
            "..." => Self::IncludeDefaults,
            "*" => Self::AllLocal,
            _ => {
                if let Some(task) = reference.strip_prefix('^') {
                    Self::Dependencies(task.to_string())
                } else if let Some(id) = TaskId::parse(reference) {
                    Self::Exact(id)
                } else {
                    Self::Local(reference.to_string())
                }
            }
        })
    }
}

impl fmt::Display for TaskReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(name) => write!(f, "{}", name),
            Self::Dependencies(name) => write!(f, "^{}", name),
            Self::Exact(id) => write!(f, "{}", id),
            Self::IncludeDefaults => write!(f, "..."),
            Self::AllLocal => write!(f, "*"),
        }
    }
}

/// How a task should be executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskCommand {
    /// Shell command run in the package directory
    Shell(String),
    /// No command; the task only aggregates its dependencies
    Structural,
}

impl TaskCommand {
    /// The shell command, if any
    pub fn as_shell(&self) -> Option<&str> {
        match self {
            Self::Shell(cmd) => Some(cmd),
            Self::Structural => None,
        }
    }
}

/// Resolved definition of a task in one package; immutable once built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task name (e.g., "build", "test", "lint")
    pub name: String,

    /// Command to execute
    pub command: TaskCommand,

    /// Tasks that must complete first
    #[serde(default)]
    pub depends_on: Vec<TaskReference>,

    /// Tasks to prefer running after this one
    #[serde(default)]
    pub before: Vec<TaskReference>,

    /// Tasks to prefer running before this one
    #[serde(default)]
    pub after: Vec<TaskReference>,

    /// Input glob patterns (for cache key computation)
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Output glob patterns (for caching)
    #[serde(default)]
    pub outputs: Vec<String>,

    /// How outputs are detected after execution
    #[serde(default)]
    pub output_detection: OutputDetectionKind,

    /// Environment variables to pass
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl TaskDefinition {
    /// Create a new structural task definition
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: TaskCommand::Structural,
            depends_on: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            output_detection: OutputDetectionKind::default(),
            env: BTreeMap::new(),
        }
    }

    /// Set the command
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = TaskCommand::Shell(command.into());
        self
    }

    /// Add a dependency reference
    pub fn with_depends_on(mut self, reference: TaskReference) -> Self {
        self.depends_on.push(reference);
        self
    }

    /// Add a `before` ordering hint
    pub fn with_before(mut self, reference: TaskReference) -> Self {
        self.before.push(reference);
        self
    }

    /// Add an `after` ordering hint
    pub fn with_after(mut self, reference: TaskReference) -> Self {
        self.after.push(reference);
        self
    }

    /// Set output globs
    pub fn with_outputs(mut self, outputs: Vec<String>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Set input globs
    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Whether the task runs no command
    pub fn is_structural(&self) -> bool {
        matches!(self.command, TaskCommand::Structural)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_display() {
        let id = TaskId::new("core", "build");
        assert_eq!(id.to_string(), "core#build");
    }

    #[test]
    fn test_task_id_parse() {
        let id = TaskId::parse("@scope/core#build").unwrap();
        assert_eq!(id.package, "@scope/core");
        assert_eq!(id.task_name, "build");
    }

    #[test]
    fn test_task_id_parse_invalid() {
        assert!(TaskId::parse("nobuild").is_none());
        assert!(TaskId::parse("#build").is_none());
        assert!(TaskId::parse("core#").is_none());
    }

    #[test]
    fn test_reference_parse() {
        assert_eq!(
            TaskReference::parse("build", false).unwrap(),
            TaskReference::Local("build".to_string())
        );
        assert_eq!(
            TaskReference::parse("^build", false).unwrap(),
            TaskReference::Dependencies("build".to_string())
        );
        assert_eq!(
            TaskReference::parse("core#build", false).unwrap(),
            TaskReference::Exact(TaskId::new("core", "build"))
        );
        assert_eq!(
            TaskReference::parse("...", false).unwrap(),
            TaskReference::IncludeDefaults
        );
        assert_eq!(TaskReference::parse("*", true).unwrap(), TaskReference::AllLocal);
        assert!(TaskReference::parse("*", false).is_err());
        assert!(TaskReference::parse("^", false).is_err());
    }

    #[test]
    fn test_reference_display_round_trips() {
        for text in ["build", "^build", "core#build", "...", "*"] {
            assert_eq!(TaskReference::parse(text, true).unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_task_definition_builder() {
        let def = TaskDefinition::new("build")
            .with_command("tsc")
            .with_depends_on(TaskReference::Dependencies("build".to_string()))
            .with_outputs(vec!["dist/**".to_string()]);

        assert_eq!(def.name, "build");
        assert_eq!(def.command.as_shell(), Some("tsc"));
        assert!(!def.is_structural());
        assert_eq!(def.outputs, vec!["dist/**"]);
        assert!(TaskDefinition::new("all").is_structural());
    }
}
