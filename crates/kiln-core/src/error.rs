//! Error types for Kiln

use thiserror::Error;

/// Result type alias using KilnError
pub type Result<T> = std::result::Result<T, KilnError>;

/// Main error type for Kiln core operations
#[derive(Debug, Error)]
pub enum KilnError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Package graph errors
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Package graph errors
#[derive(Debug, Error)]
pub enum GraphError {
    /// A package lists a dependency that is not part of the workspace
    #[error("Package '{package}' depends on unknown package '{dependency}'")]
    UnknownPackage { package: String, dependency: String },
}

impl KilnError {
    /// Whether this error comes from configuration rather than the environment
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Toml(_))
    }
}
