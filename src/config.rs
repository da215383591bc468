//! Storage configuration
//!
//! Resolves where the database file lives. The schema and runtime pragmas
//! are compiled in and not configurable.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AppError;

/// Default database location, relative to the working directory
pub const DEFAULT_DB_FILE: &str = "data/app.db";

/// Environment variable overriding the database location
pub const DB_FILE_ENV: &str = "DB_FILE";

/// Configuration file name
const CONFIG_FILENAME: &str = "settings.yaml";

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_db_file")]
    pub db_file: PathBuf,
}

fn default_db_file() -> PathBuf {
    PathBuf::from(DEFAULT_DB_FILE)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file: default_db_file(),
        }
    }
}

impl StorageConfig {
    /// Load configuration from a config directory
    ///
    /// # Arguments
    /// * `config_dir` - Directory holding `settings.yaml`
    ///
    /// # Returns
    /// The stored configuration, or defaults when the file is missing or unreadable
    pub fn load(config_dir: &Path) -> Self {
        let config_path = config_dir.join(CONFIG_FILENAME);

        if !config_path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&config_path) {
            Ok(content) => serde_yaml::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %config_path.display(), error = %e, "ignoring malformed settings");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save configuration to a config directory
    pub fn save(&self, config_dir: &Path) -> Result<(), AppError> {
        let config_path = config_dir.join(CONFIG_FILENAME);

        if !config_dir.exists() {
            fs::create_dir_all(config_dir)?;
        }

        let content = serde_yaml::to_string(self)
            .map_err(|e| AppError::Config(format!("failed to serialize settings: {}", e)))?;

        fs::write(&config_path, content)?;
        Ok(())
    }

    /// Resolve the database file
    ///
    /// Explicit override first, then `DB_FILE`, then `settings.yaml` in
    /// `config_dir`, then [`DEFAULT_DB_FILE`].
    pub fn resolve(db_file: Option<PathBuf>, config_dir: Option<&Path>) -> Self {
        let env = std::env::var(DB_FILE_ENV).ok().filter(|v| !v.trim().is_empty());
        Self::resolve_from(db_file, env, config_dir)
    }

    fn resolve_from(db_file: Option<PathBuf>, env: Option<String>, config_dir: Option<&Path>) -> Self {
        if let Some(db_file) = db_file.or_else(|| env.map(PathBuf::from)) {
            return Self { db_file };
        }

        config_dir.map(Self::load).unwrap_or_default()
    }

    /// Full path of the configuration file
    pub fn config_path(config_dir: &Path) -> PathBuf {
        config_dir.join(CONFIG_FILENAME)
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.db_file, PathBuf::from("data/app.db"));
    }

    #[test]
    fn test_load_nonexistent_config() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::load(dir.path());
        assert_eq!(config, StorageConfig::default());
    }

    #[test]
    fn test_save_and_load_config() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            db_file: PathBuf::from("/var/lib/questboard/app.db"),
        };

        config.save(dir.path()).unwrap();

        let loaded = StorageConfig::load(dir.path());
        assert_eq!(loaded, config);
        assert!(StorageConfig::config_path(dir.path()).exists());
    }

    #[test]
    fn test_malformed_config_falls_back() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILENAME), "db_file: [unclosed").unwrap();

        assert_eq!(StorageConfig::load(dir.path()), StorageConfig::default());
    }

    #[test]
    fn test_resolution_order() {
        let dir = tempdir().unwrap();
        StorageConfig {
            db_file: PathBuf::from("from-yaml.db"),
        }
        .save(dir.path())
        .unwrap();

        let resolved = StorageConfig::resolve_from(
            Some(PathBuf::from("from-flag.db")),
            Some("from-env.db".to_string()),
            Some(dir.path()),
        );
        assert_eq!(resolved.db_file, PathBuf::from("from-flag.db"));

        let resolved =
            StorageConfig::resolve_from(None, Some("from-env.db".to_string()), Some(dir.path()));
        assert_eq!(resolved.db_file, PathBuf::from("from-env.db"));

        let resolved = StorageConfig::resolve_from(None, None, Some(dir.path()));
        assert_eq!(resolved.db_file, PathBuf::from("from-yaml.db"));

        let resolved = StorageConfig::resolve_from(None, None, None);
        assert_eq!(resolved.db_file, PathBuf::from(DEFAULT_DB_FILE));
    }
}
