//! Configuration management.
//!
//! Configuration is read from TOML. Every field is optional in the file;
//! missing fields keep their defaults. Lookup order for the file:
//!
//! 1. An explicit path (the CLI's `--config`)
//! 2. `NOTEGRAPH_CONFIG_PATH`
//! 3. `<config dir>/notegraph/config.toml`
//!
//! Environment overrides (`NOTEGRAPH_HOME`, `NOTEGRAPH_LOG_FORMAT`,
//! `NOTEGRAPH_LOG_FILE`) are applied last.

use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the database inside the data directory.
pub const DATABASE_FILE_NAME: &str = "notegraph.db";

/// Default ignore patterns applied on top of the built-in transient rules.
const DEFAULT_IGNORE_PATTERNS: &[&str] = &["node_modules", "__pycache__"];

/// Main configuration for notegraph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteGraphConfig {
    /// Directory holding the database.
    pub data_dir: PathBuf,
    /// Registered projects: name to directory.
    pub projects: BTreeMap<String, PathBuf>,
    /// Project used when a command names none.
    pub default_project: Option<String>,
    /// Sync engine settings.
    pub sync: SyncConfig,
    /// Context building settings.
    pub context: ContextConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Sync engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Quiet period before a batch of watched changes is synced.
    pub debounce_ms: u64,
    /// Longest a batch of watched changes may keep growing.
    pub max_batch_ms: u64,
    /// Extra glob patterns to ignore.
    pub ignore_patterns: Vec<String>,
    /// Bound on permalink disambiguation suffixes.
    pub max_permalink_suffix: u32,
    /// How long a direct write waits for relation resolution.
    pub resolve_timeout_ms: u64,
    /// Poll interval for polling watch backends.
    pub poll_interval_ms: u64,
}

/// Context building settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Depth when a request gives none.
    pub default_depth: usize,
    /// Cap on related items per primary result.
    pub max_related: usize,
    /// Seeds per page when a request gives none.
    pub default_page_size: usize,
    /// Window of the `recent` seed without `since`.
    pub recent_window_days: i64,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-line.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parses a format name; unknown names are pretty.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `notegraph=info`.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Append logs to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            max_batch_ms: 10_000,
            ignore_patterns: DEFAULT_IGNORE_PATTERNS
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
            max_permalink_suffix: crate::storage::graph::DEFAULT_MAX_PERMALINK_SUFFIX,
            resolve_timeout_ms: 2000,
            poll_interval_ms: 2000,
        }
    }
}

impl SyncConfig {
    /// Debounce window as a duration.
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Batch window bound as a duration.
    #[must_use]
    pub const fn max_batch_window(&self) -> Duration {
        Duration::from_millis(self.max_batch_ms)
    }

    /// Resolution wait as a duration.
    #[must_use]
    pub const fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_depth: 1,
            max_related: 10,
            default_page_size: 10,
            recent_window_days: 7,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "notegraph=info".to_string(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

impl Default for NoteGraphConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            projects: BTreeMap::new(),
            default_project: None,
            sync: SyncConfig::default(),
            context: ContextConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".notegraph"),
        |dirs| dirs.data_dir().join("notegraph"),
    )
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Data directory.
    pub data_dir: Option<String>,
    /// Projects.
    pub projects: Option<BTreeMap<String, String>>,
    /// Default project.
    pub default_project: Option<String>,
    /// Sync section.
    pub sync: Option<ConfigFileSync>,
    /// Context section.
    pub context: Option<ConfigFileContext>,
    /// Logging section.
    pub logging: Option<ConfigFileLogging>,
}

/// Sync section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileSync {
    /// Debounce in milliseconds.
    pub debounce_ms: Option<u64>,
    /// Batch window bound in milliseconds.
    pub max_batch_ms: Option<u64>,
    /// Ignore patterns; replaces the defaults.
    pub ignore_patterns: Option<Vec<String>>,
    /// Disambiguation bound.
    pub max_permalink_suffix: Option<u32>,
    /// Resolution wait in milliseconds.
    pub resolve_timeout_ms: Option<u64>,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: Option<u64>,
}

/// Context section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileContext {
    /// Default depth.
    pub default_depth: Option<usize>,
    /// Related cap.
    pub max_related: Option<usize>,
    /// Default page size.
    pub default_page_size: Option<usize>,
    /// Recent window in days.
    pub recent_window_days: Option<i64>,
}

/// Logging section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileLogging {
    /// Filter directive.
    pub level: Option<String>,
    /// `pretty` or `json`.
    pub format: Option<String>,
    /// Log file path.
    pub file: Option<String>,
}

impl NoteGraphConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for malformed TOML or unknown keys.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents)
            .map_err(|e| Error::InvalidInput(format!("invalid config: {e}")))?;
        Ok(Self::from_config_file(file))
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::operation("read_config_file", format!("{}: {e}", path.display())))?;
        Self::from_toml(&contents)
    }

    /// Loads configuration following the lookup order, then applies
    /// environment overrides.
    ///
    /// An explicit path that cannot be loaded is an error; a missing default
    /// file is not.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit or `NOTEGRAPH_CONFIG_PATH` file cannot
    /// be loaded.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os("NOTEGRAPH_CONFIG_PATH").map(PathBuf::from);
        let mut config = if let Some(path) = explicit.map(Path::to_path_buf).or(env_path) {
            Self::load_from_file(&path)?
        } else {
            Self::load_default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads `<config dir>/notegraph/config.toml`, or defaults.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };
        let path = base_dirs.config_dir().join("notegraph").join("config.toml");
        if path.exists() {
            match Self::load_from_file(&path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config file");
                },
            }
        }
        Self::default()
    }

    /// Applies `NOTEGRAPH_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(home) = std::env::var_os("NOTEGRAPH_HOME") {
            self.data_dir = PathBuf::from(home);
        }
        if let Ok(format) = std::env::var("NOTEGRAPH_LOG_FORMAT") {
            self.logging.format = LogFormat::parse(&format);
        }
        if let Some(file) = std::env::var_os("NOTEGRAPH_LOG_FILE") {
            self.logging.file = Some(PathBuf::from(file));
        }
    }

    /// Converts a `ConfigFile` to `NoteGraphConfig`.
    fn from_config_file(file: ConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(data_dir) = file.data_dir {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(projects) = file.projects {
            config.projects = projects
                .into_iter()
                .map(|(name, path)| (name, PathBuf::from(path)))
                .collect();
        }
        config.default_project = file.default_project;

        if let Some(sync) = file.sync {
            if let Some(v) = sync.debounce_ms {
                config.sync.debounce_ms = v;
            }
            if let Some(v) = sync.max_batch_ms {
                config.sync.max_batch_ms = v;
            }
            if let Some(v) = sync.ignore_patterns {
                config.sync.ignore_patterns = v;
            }
            if let Some(v) = sync.max_permalink_suffix {
                config.sync.max_permalink_suffix = v;
            }
            if let Some(v) = sync.resolve_timeout_ms {
                config.sync.resolve_timeout_ms = v;
            }
            if let Some(v) = sync.poll_interval_ms {
                config.sync.poll_interval_ms = v;
            }
        }
        if let Some(context) = file.context {
            if let Some(v) = context.default_depth {
                config.context.default_depth = v;
            }
            if let Some(v) = context.max_related {
                config.context.max_related = v;
            }
            if let Some(v) = context.default_page_size {
                config.context.default_page_size = v;
            }
            if let Some(v) = context.recent_window_days {
                config.context.recent_window_days = v;
            }
        }
        if let Some(logging) = file.logging {
            if let Some(level) = logging.level {
                config.logging.level = level;
            }
            if let Some(format) = logging.format {
                config.logging.format = LogFormat::parse(&format);
            }
            config.logging.file = logging.file.map(PathBuf::from);
        }

        config
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Registers a project.
    #[must_use]
    pub fn with_project(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.projects.insert(name.into(), path.into());
        self
    }

    /// Path of the database file.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE_NAME)
    }

    /// Picks the project a command operates on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if no project is named and no default
    /// can be chosen.
    pub fn project_name(&self, requested: Option<&str>) -> Result<String> {
        if let Some(name) = requested {
            return Ok(name.to_string());
        }
        if let Some(name) = &self.default_project {
            return Ok(name.clone());
        }
        match self.projects.keys().next() {
            Some(name) if self.projects.len() == 1 => Ok(name.clone()),
            _ => Err(Error::InvalidInput(
                "no project given and no default_project configured".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NoteGraphConfig::default();
        assert_eq!(config.sync.debounce_ms, 1000);
        assert_eq!(config.sync.max_permalink_suffix, 1000);
        assert_eq!(config.context.default_depth, 1);
        assert_eq!(config.context.max_related, 10);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.database_path().ends_with(DATABASE_FILE_NAME));
    }

    #[test]
    fn test_from_toml_overrides_sections() {
        let config = NoteGraphConfig::from_toml(
            r#"
            data_dir = "/var/lib/notegraph"
            default_project = "work"

            [projects]
            work = "/home/me/work-notes"

            [sync]
            debounce_ms = 250
            max_batch_ms = 5000
            ignore_patterns = ["drafts/*"]

            [context]
            max_related = 25

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/notegraph"));
        assert_eq!(config.projects["work"], PathBuf::from("/home/me/work-notes"));
        assert_eq!(config.sync.debounce(), Duration::from_millis(250));
        assert_eq!(config.sync.max_batch_window(), Duration::from_secs(5));
        assert_eq!(config.sync.ignore_patterns, vec!["drafts/*".to_string()]);
        assert_eq!(config.sync.resolve_timeout_ms, 2000);
        assert_eq!(config.context.max_related, 25);
        assert_eq!(config.context.default_depth, 1);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_key_is_invalid() {
        let err = NoteGraphConfig::from_toml("colour = \"blue\"").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[context]\ndefault_depth = 3\n").unwrap();
        let config = NoteGraphConfig::load_from_file(&path).unwrap();
        assert_eq!(config.context.default_depth, 3);

        let missing = NoteGraphConfig::load_from_file(&dir.path().join("nope.toml"));
        assert!(missing.is_err());
    }

    #[test]
    fn test_project_name_selection() {
        let config = NoteGraphConfig::default().with_project("only", "/tmp/only");
        assert_eq!(config.project_name(None).unwrap(), "only");
        assert_eq!(config.project_name(Some("other")).unwrap(), "other");

        let config = config.with_project("second", "/tmp/second");
        assert!(config.project_name(None).is_err());
    }
}
