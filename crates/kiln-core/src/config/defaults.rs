//! Default configuration values

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "kiln.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "kiln.yaml";

/// Per-package task override file
pub const PACKAGE_CONFIG_FILE: &str = "kiln.toml";

/// Environment variable pointing at a shared cache directory
pub const CACHE_DIR_ENV: &str = "KILN_CACHE_DIR";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".kiln.toml",
        ".kiln.yaml",
    ]
}
