//! Configuration
//!
//! Tunables for the framer and the scheduler, loaded from a TOML file at
//! `~/.config/conductor-stream/config.toml` with environment overrides.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. Explicit overrides ([`ConfigOverrides`], usually from the CLI)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [scheduler]
//! buffer_depth = 4
//! thread_name = "conductor-executor"
//!
//! [framer]
//! max_envelope_len = 1048576
//! max_output_len = 16777216
//! ```
//!
//! # Environment Variables
//!
//! - `CONDUCTOR_BUFFER_DEPTH`: capacity of the normal-priority slot pool
//! - `CONDUCTOR_MAX_ENVELOPE`: maximum envelope payload length in bytes
//! - `CONDUCTOR_MAX_OUTPUT`: maximum accumulated `%output` length in bytes

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default capacity of the normal-priority slot pool
pub const DEFAULT_BUFFER_DEPTH: usize = 4;

/// Default maximum envelope payload (1 MB)
pub const DEFAULT_MAX_ENVELOPE_LEN: usize = 1024 * 1024;

/// Default maximum accumulated output per `%output` block (16 MB)
pub const DEFAULT_MAX_OUTPUT_LEN: usize = 16 * 1024 * 1024;

/// Default name of the executor thread
pub const DEFAULT_THREAD_NAME: &str = "conductor-executor";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where the effective configuration came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Runtime Configuration
// =============================================================================

/// Scheduler tunables
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of normal-priority batches that may be in flight to the executor
    pub buffer_depth: usize,

    /// Name given to the executor thread
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            buffer_depth: DEFAULT_BUFFER_DEPTH,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the slot pool capacity
    #[must_use]
    pub fn with_buffer_depth(mut self, depth: usize) -> Self {
        self.buffer_depth = depth;
        self
    }

    /// Set the executor thread name
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

/// Framer tunables
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramerConfig {
    /// Maximum envelope payload length before the framer gives up
    pub max_envelope_len: usize,

    /// Maximum bytes accumulated for one `%output` block
    pub max_output_len: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            max_envelope_len: DEFAULT_MAX_ENVELOPE_LEN,
            max_output_len: DEFAULT_MAX_OUTPUT_LEN,
        }
    }
}

impl FramerConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the envelope limit
    #[must_use]
    pub fn with_max_envelope_len(mut self, len: usize) -> Self {
        self.max_envelope_len = len;
        self
    }

    /// Set the output limit
    #[must_use]
    pub fn with_max_output_len(mut self, len: usize) -> Self {
        self.max_output_len = len;
        self
    }
}

/// Complete stream configuration
#[derive(Clone, Debug, Default)]
pub struct StreamConfig {
    /// Scheduler settings
    pub scheduler: SchedulerConfig,
    /// Framer settings
    pub framer: FramerConfig,
    /// Path of the loaded file, if any
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl StreamConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the highest-priority value came from
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Reject values the framer or scheduler cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.buffer_depth == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.buffer_depth must be at least 1".to_string(),
            ));
        }
        if self.framer.max_envelope_len == 0 {
            return Err(ConfigError::ValidationError(
                "framer.max_envelope_len must be at least 1".to_string(),
            ));
        }
        if self.framer.max_output_len == 0 {
            return Err(ConfigError::ValidationError(
                "framer.max_output_len must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Scheduler section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerToml {
    /// Slot pool capacity
    pub buffer_depth: Option<usize>,

    /// Executor thread name
    pub thread_name: Option<String>,
}

/// Framer section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FramerToml {
    /// Maximum envelope payload length in bytes
    pub max_envelope_len: Option<usize>,

    /// Maximum accumulated output length in bytes
    pub max_output_len: Option<usize>,
}

/// Root of the TOML configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    /// `[scheduler]` section
    pub scheduler: SchedulerToml,
    /// `[framer]` section
    pub framer: FramerToml,
}

// =============================================================================
// Loading
// =============================================================================

/// Default configuration file location
///
/// `$XDG_CONFIG_HOME/conductor-stream/config.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("conductor-stream").join("config.toml"))
}

/// Load configuration from the default location plus the environment
pub fn load_config() -> Result<StreamConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from `path` (if it exists) plus the environment
///
/// A missing file is not an error; defaults are used instead.
pub fn load_config_from_path(path: Option<&Path>) -> Result<StreamConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration reading environment values through `env`
///
/// Exposed so callers (and tests) can supply variables without touching the
/// process environment.
pub fn load_config_with_env<F>(path: Option<&Path>, env: F) -> Result<StreamConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = StreamConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;

            let toml_config: StreamToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.to_path_buf());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut StreamConfig, toml: &StreamToml) {
    if let Some(depth) = toml.scheduler.buffer_depth {
        config.scheduler.buffer_depth = depth;
    }
    if let Some(ref name) = toml.scheduler.thread_name {
        config.scheduler.thread_name = name.clone();
    }
    if let Some(len) = toml.framer.max_envelope_len {
        config.framer.max_envelope_len = len;
    }
    if let Some(len) = toml.framer.max_output_len {
        config.framer.max_output_len = len;
    }
}

fn apply_env_config<F>(config: &mut StreamConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(depth) = env("CONDUCTOR_BUFFER_DEPTH").and_then(|v| v.parse::<usize>().ok()) {
        config.scheduler.buffer_depth = depth;
        config.source = ConfigSource::Env;
    }
    if let Some(len) = env("CONDUCTOR_MAX_ENVELOPE").and_then(|v| v.parse::<usize>().ok()) {
        config.framer.max_envelope_len = len;
        config.source = ConfigSource::Env;
    }
    if let Some(len) = env("CONDUCTOR_MAX_OUTPUT").and_then(|v| v.parse::<usize>().ok()) {
        config.framer.max_output_len = len;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Overrides with the highest priority, typically from command-line flags
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Slot pool capacity override
    pub buffer_depth: Option<usize>,

    /// Envelope limit override
    pub max_envelope_len: Option<usize>,

    /// Output limit override
    pub max_output_len: Option<usize>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set buffer depth override
    #[must_use]
    pub fn with_buffer_depth(mut self, depth: usize) -> Self {
        self.buffer_depth = Some(depth);
        self
    }

    /// Set envelope limit override
    #[must_use]
    pub fn with_max_envelope_len(mut self, len: usize) -> Self {
        self.max_envelope_len = Some(len);
        self
    }

    /// Set output limit override
    #[must_use]
    pub fn with_max_output_len(mut self, len: usize) -> Self {
        self.max_output_len = Some(len);
        self
    }

    /// Apply overrides to a configuration, re-validating the result
    pub fn apply(&self, config: &mut StreamConfig) -> Result<(), ConfigError> {
        if self.buffer_depth.is_some()
            || self.max_envelope_len.is_some()
            || self.max_output_len.is_some()
        {
            config.source = ConfigSource::Cli;
        }
        if let Some(depth) = self.buffer_depth {
            config.scheduler.buffer_depth = depth;
        }
        if let Some(len) = self.max_envelope_len {
            config.framer.max_envelope_len = len;
        }
        if let Some(len) = self.max_output_len {
            config.framer.max_output_len = len;
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn toml_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = StreamConfig::default();
        assert_eq!(config.scheduler.buffer_depth, 4);
        assert_eq!(config.scheduler.thread_name, "conductor-executor");
        assert_eq!(config.framer.max_envelope_len, 1024 * 1024);
        assert_eq!(config.framer.max_output_len, 16 * 1024 * 1024);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("conductor-stream/config.toml"));
        }
    }

    #[test]
    fn test_parse_partial_toml() {
        let file = toml_file(
            r#"
[scheduler]
buffer_depth = 8
"#,
        );

        let config = load_config_with_env(Some(file.path()), no_env).unwrap();
        assert_eq!(config.scheduler.buffer_depth, 8);
        assert_eq!(config.scheduler.thread_name, DEFAULT_THREAD_NAME);
        assert_eq!(config.framer, FramerConfig::default());
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_missing_file_graceful() {
        let config =
            load_config_with_env(Some(Path::new("/nonexistent/conductor.toml")), no_env).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = toml_file("[scheduler\nbuffer_depth = \"four\"\n");
        let result = load_config_with_env(Some(file.path()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = toml_file(
            r#"
[scheduler]
buffer_depth = 8

[framer]
max_envelope_len = 2048
"#,
        );

        let config = load_config_with_env(
            Some(file.path()),
            env_of(&[("CONDUCTOR_BUFFER_DEPTH", "2"), ("CONDUCTOR_MAX_OUTPUT", "4096")]),
        )
        .unwrap();

        assert_eq!(config.scheduler.buffer_depth, 2);
        assert_eq!(config.framer.max_envelope_len, 2048);
        assert_eq!(config.framer.max_output_len, 4096);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_unparseable_env_is_ignored() {
        let config =
            load_config_with_env(None, env_of(&[("CONDUCTOR_BUFFER_DEPTH", "lots")])).unwrap();
        assert_eq!(config.scheduler.buffer_depth, DEFAULT_BUFFER_DEPTH);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_zero_buffer_depth_rejected() {
        let file = toml_file("[scheduler]\nbuffer_depth = 0\n");
        let result = load_config_with_env(Some(file.path()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config =
            load_config_with_env(None, env_of(&[("CONDUCTOR_BUFFER_DEPTH", "2")])).unwrap();

        ConfigOverrides::new()
            .with_buffer_depth(16)
            .apply(&mut config)
            .unwrap();

        assert_eq!(config.scheduler.buffer_depth, 16);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_no_change() {
        let mut config = StreamConfig::default();
        ConfigOverrides::new().apply(&mut config).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
