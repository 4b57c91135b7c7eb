use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::TallyError;

/// File looked up in the working directory before the user config.
pub const LOCAL_CONFIG_FILE: &str = "tally.toml";

/// Environment variable overriding `[database] path`.
pub const DB_ENV_VAR: &str = "TALLY_DB";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

impl TallyConfig {
    /// Reject values no command can run with.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::Configuration`] naming the offending key.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.database.path.as_os_str().is_empty() {
            return Err(TallyError::Configuration(
                "database.path must not be empty".to_string(),
            ));
        }
        if self.intake.workers == 0 {
            return Err(TallyError::Configuration(
                "intake.workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the config came from, for `tally stats` and debug logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "path")]
pub enum ConfigSource {
    Explicit(PathBuf),
    Local(PathBuf),
    User(PathBuf),
    Defaults,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub config: TallyConfig,
    pub source: ConfigSource,
    /// Database path after `--db` and `TALLY_DB` overrides.
    pub db_path: PathBuf,
}

/// Parse one config file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or fails
/// validation.
pub fn load_config_file(path: &Path) -> Result<TallyConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config = toml::from_str::<TallyConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config {}", path.display()))?;
    Ok(config)
}

/// Find and load the config: an explicit path, else `tally.toml` in `cwd`,
/// else `<config dir>/tally/config.toml`, else defaults.
///
/// # Errors
///
/// Returns an error if an explicit path is missing, or if the selected file
/// cannot be loaded.
pub fn load_config(explicit: Option<&Path>, cwd: &Path) -> Result<(TallyConfig, ConfigSource)> {
    if let Some(path) = explicit {
        if !path.exists() {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        return Ok((load_config_file(path)?, ConfigSource::Explicit(path.to_path_buf())));
    }

    let local = cwd.join(LOCAL_CONFIG_FILE);
    if local.exists() {
        return Ok((load_config_file(&local)?, ConfigSource::Local(local)));
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user = config_dir.join("tally/config.toml");
        if user.exists() {
            return Ok((load_config_file(&user)?, ConfigSource::User(user)));
        }
    }

    Ok((TallyConfig::default(), ConfigSource::Defaults))
}

/// Load the config and apply database path overrides.
///
/// # Errors
///
/// Same as [`load_config`].
pub fn resolve_config(
    explicit: Option<&Path>,
    cwd: &Path,
    cli_db: Option<&Path>,
) -> Result<EffectiveConfig> {
    let (config, source) = load_config(explicit, cwd)?;
    let env_db = std::env::var(DB_ENV_VAR).ok();
    let db_path = resolve_db_path(&config, cli_db, env_db.as_deref());

    tracing::debug!(source = ?source, db = %db_path.display(), "resolved configuration");
    Ok(EffectiveConfig {
        config,
        source,
        db_path,
    })
}

fn resolve_db_path(config: &TallyConfig, cli_db: Option<&Path>, env_db: Option<&str>) -> PathBuf {
    if let Some(path) = cli_db {
        return path.to_path_buf();
    }
    if let Some(path) = env_db.map(str::trim).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    config.database.path.clone()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("tally.sqlite3")
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_workers() -> usize {
    4
}
