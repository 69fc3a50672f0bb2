//! Configuration loader with tier-based merging.
//!
//! Loads configuration from multiple tiers and merges them field-by-field.

use super::merge::deep_merge_all;
use super::types::Config;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    /// Compiled-in defaults (lowest priority)
    Defaults = 0,
    /// Project-level config ($CWD/taskport/)
    Project = 1,
    /// User-level config (~/.taskport/)
    User = 2,
    /// Environment variables (highest priority)
    Environment = 3,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Environment => write!(f, "environment"),
        }
    }
}

/// Directories searched for `config.yaml`.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// Project-level config directory
    pub project_dir: Option<PathBuf>,
    /// User-level config directory
    pub user_dir: Option<PathBuf>,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::discover()
    }
}

impl ConfigPaths {
    /// Discover configuration paths from environment and defaults.
    pub fn discover() -> Self {
        // User dir: TASKPORT_USER_DIR or ~/.taskport
        let user_dir = std::env::var("TASKPORT_USER_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".taskport")));

        // Project dir: TASKPORT_PROJECT_DIR or $CWD/taskport
        let project_dir = std::env::var("TASKPORT_PROJECT_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("taskport")));

        Self {
            project_dir,
            user_dir,
        }
    }

    /// Create paths with explicit directories.
    pub fn with_dirs(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
        }
    }
}

/// Configuration loader that handles tier-based merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Paths for each tier
    pub paths: ConfigPaths,
    /// Loaded configuration
    config: Config,
    /// Path to the highest-priority config file that was read (if any)
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Load configuration from all tiers with proper merging.
    ///
    /// A `.env` file in the working directory is read first so its values
    /// take part in the environment tier.
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env file");
        }
        Self::load_with_paths(ConfigPaths::discover())
    }

    /// Load configuration with explicit paths, reading overrides from the
    /// process environment.
    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        Self::load_with_env(paths, |key| std::env::var(key).ok())
    }

    /// Load configuration with explicit paths and an environment lookup.
    pub fn load_with_env<F>(paths: ConfigPaths, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Explicit config path replaces the file tiers
        if let Some(explicit_path) = env("TASKPORT_CONFIG_PATH") {
            let path = PathBuf::from(&explicit_path);
            let mut config = Config::load(&path)
                .with_context(|| format!("failed to load config file {}", path.display()))?;
            apply_env_overrides(&mut config, &env);
            config.validate()?;
            return Ok(Self {
                paths,
                config,
                config_path: Some(path),
            });
        }

        let mut configs: Vec<Value> = Vec::new();
        let mut config_path = None;

        // Tier 1: Defaults
        configs.push(serde_json::to_value(Config::default())?);

        // Tier 2: Project config
        if let Some(ref project_dir) = paths.project_dir
            && let Some(value) = read_tier(&project_dir.join("config.yaml"), ConfigTier::Project)
        {
            configs.push(value);
            config_path = Some(project_dir.join("config.yaml"));
        }

        // Tier 3: User config
        if let Some(ref user_dir) = paths.user_dir
            && let Some(value) = read_tier(&user_dir.join("config.yaml"), ConfigTier::User)
        {
            configs.push(value);
            config_path = Some(user_dir.join("config.yaml"));
        }

        let merged = deep_merge_all(configs);
        let mut config: Config = serde_json::from_value(merged)?;

        // Tier 4: Environment variable overrides
        apply_env_overrides(&mut config, &env);

        config.validate()?;

        Ok(Self {
            paths,
            config,
            config_path,
        })
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable access to the configuration.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Consume the loader and return the configuration.
    pub fn into_config(self) -> Config {
        self.config
    }

    /// Get the config file path that was used.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

/// Read one YAML tier. Missing files are skipped; unreadable ones are skipped
/// with a warning.
fn read_tier(path: &Path, tier: ConfigTier) -> Option<Value> {
    if !path.exists() {
        return None;
    }
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(tier = %tier, path = %path.display(), "Cannot read config file: {}", e);
            return None;
        }
    };
    match serde_yaml::from_str::<Value>(&content) {
        Ok(value) => {
            debug!(tier = %tier, path = %path.display(), "Loaded config tier");
            Some(value)
        }
        Err(e) => {
            warn!(tier = %tier, path = %path.display(), "Invalid YAML in config file: {}", e);
            None
        }
    }
}

/// Parse an environment value, ignoring it with a warning when malformed.
fn env_value<T, F>(env: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Apply environment variable overrides to config.
fn apply_env_overrides<F>(config: &mut Config, env: &F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(db_path) = env("TASKPORT_DB_PATH") {
        config.server.db_path = PathBuf::from(db_path);
    }
    if let Some(host) = env("TASKPORT_HOST") {
        config.server.host = host;
    }
    if let Some(port) = env_value(env, "PORT") {
        config.server.port = port;
    }

    let ports = &mut config.ports;
    if let Some(v) = env_value(env, "PORT_ALLOCATION_MIN") {
        ports.min_port = v;
    }
    if let Some(v) = env_value(env, "PORT_ALLOCATION_MAX") {
        ports.max_port = v;
    }
    if let Some(v) = env_value(env, "PORT_ALLOCATION_DEFAULT_COUNT") {
        ports.default_count = v;
    }
    if let Some(v) = env_value(env, "PORT_ALLOCATION_MAX_PER_PROJECT") {
        ports.max_per_project = v;
    }
    if let Some(v) = env_value(env, "PORT_ALLOCATION_MAX_RETRIES") {
        ports.max_retries = v;
    }
    if let Some(v) = env_value(env, "PORT_ALLOCATION_RETRY_DELAY_MS") {
        ports.retry_delay_ms = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_load_defaults_only() {
        let temp = TempDir::new().unwrap();
        let paths = ConfigPaths::with_dirs(
            Some(temp.path().join("project")),
            Some(temp.path().join("user")),
        );

        let loader = ConfigLoader::load_with_env(paths, no_env).unwrap();
        let config = loader.config();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.ports.min_port, 1000);
        assert_eq!(config.ports.max_port, 2000);
        assert!(loader.config_path().is_none());
    }

    #[test]
    fn test_project_config_overrides_defaults() {
        let temp = TempDir::new().unwrap();
        let project_dir = temp.path().join("taskport");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(
            project_dir.join("config.yaml"),
            "ports:\n  min_port: 4000\n  max_port: 4099\n",
        )
        .unwrap();

        let paths = ConfigPaths::with_dirs(Some(project_dir), Some(temp.path().join("user")));
        let config = ConfigLoader::load_with_env(paths, no_env)
            .unwrap()
            .into_config();

        assert_eq!(config.ports.min_port, 4000);
        assert_eq!(config.ports.max_port, 4099);
        assert_eq!(config.ports.max_per_project, 50);
    }

    #[test]
    fn test_user_config_overrides_project() {
        let temp = TempDir::new().unwrap();
        let project_dir = temp.path().join("taskport");
        let user_dir = temp.path().join("user");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::create_dir_all(&user_dir).unwrap();

        std::fs::write(
            project_dir.join("config.yaml"),
            "ports:\n  max_retries: 5\n  retry_delay_ms: 250\n",
        )
        .unwrap();
        std::fs::write(user_dir.join("config.yaml"), "ports:\n  max_retries: 8\n").unwrap();

        let paths = ConfigPaths::with_dirs(Some(project_dir), Some(user_dir.clone()));
        let loader = ConfigLoader::load_with_env(paths, no_env).unwrap();
        let config = loader.config();

        assert_eq!(config.ports.max_retries, 8);
        assert_eq!(config.ports.retry_delay_ms, 250);
        assert_eq!(loader.config_path(), Some(user_dir.join("config.yaml").as_path()));
    }

    #[test]
    fn test_env_overrides_files() {
        let temp = TempDir::new().unwrap();
        let project_dir = temp.path().join("taskport");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join("config.yaml"), "ports:\n  max_port: 1500\n").unwrap();

        let env: HashMap<&str, &str> = [
            ("PORT_ALLOCATION_MAX", "1009"),
            ("PORT_ALLOCATION_DEFAULT_COUNT", "5"),
            ("PORT", "8080"),
            ("TASKPORT_DB_PATH", "/tmp/ports.db"),
        ]
        .into_iter()
        .collect();

        let paths = ConfigPaths::with_dirs(Some(project_dir), None);
        let config = ConfigLoader::load_with_env(paths, |k| env.get(k).map(|v| v.to_string()))
            .unwrap()
            .into_config();

        assert_eq!(config.ports.max_port, 1009);
        assert_eq!(config.ports.default_count, 5);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.db_path, PathBuf::from("/tmp/ports.db"));
    }

    #[test]
    fn test_unparseable_env_value_ignored() {
        let temp = TempDir::new().unwrap();
        let paths = ConfigPaths::with_dirs(Some(temp.path().join("none")), None);
        let config = ConfigLoader::load_with_env(paths, |k| {
            (k == "PORT_ALLOCATION_MIN").then(|| "lots".to_string())
        })
        .unwrap()
        .into_config();

        assert_eq!(config.ports.min_port, 1000);
    }

    #[test]
    fn test_invalid_pool_rejected() {
        let temp = TempDir::new().unwrap();
        let paths = ConfigPaths::with_dirs(Some(temp.path().join("none")), None);
        let result = ConfigLoader::load_with_env(paths, |k| match k {
            "PORT_ALLOCATION_MIN" => Some("3000".to_string()),
            "PORT_ALLOCATION_MAX" => Some("2000".to_string()),
            _ => None,
        });

        assert!(result.is_err());
    }

    #[test]
    fn test_explicit_config_path() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("custom.yaml");
        std::fs::write(&file, "server:\n  port: 9090\n").unwrap();
        let file_str = file.to_string_lossy().to_string();

        let paths = ConfigPaths::with_dirs(None, None);
        let loader = ConfigLoader::load_with_env(paths, |k| {
            (k == "TASKPORT_CONFIG_PATH").then(|| file_str.clone())
        })
        .unwrap();

        assert_eq!(loader.config().server.port, 9090);
        assert_eq!(loader.config_path(), Some(file.as_path()));
    }
}
