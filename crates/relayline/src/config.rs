//! Relay configuration.
//!
//! Sources, later ones winning: built-in defaults, an optional TOML file,
//! then `RELAYLINE__SECTION__KEY` environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "relayline";

const ENV_PREFIX: &str = "RELAYLINE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address downstream executors connect to.
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when no verbosity flag is given on the command line.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load from `path` (or the default location) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => expand_path(path)?,
            None => default_config_file()?,
        };
        Self::load_with_env(&path, None)
    }

    /// Load from `path`, reading overrides from `env_vars` instead of the
    /// process environment when given.
    pub fn load_with_env(path: &Path, env_vars: Option<config::Map<String, String>>) -> Result<Self> {
        let defaults = RelayConfig::default();
        let built = Config::builder()
            .set_default("server.host", defaults.server.host)?
            .set_default("server.port", i64::from(defaults.server.port))?
            .set_default("logging.level", defaults.logging.level)?
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env_vars),
            )
            .build()
            .with_context(|| format!("reading configuration from {}", path.display()))?;

        let config: RelayConfig = built
            .try_deserialize()
            .context("deserializing configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.logging.level.parse::<log::LevelFilter>().is_err() {
            return Err(anyhow!("unknown logging.level '{}'", self.logging.level));
        }
        Ok(())
    }

    /// Pretty TOML with a short header, as written by `config init`.
    pub fn to_toml(&self, path: &Path) -> Result<String> {
        let body = toml::to_string_pretty(self).context("serializing config to TOML")?;
        Ok(format!(
            "# Configuration for {APP_NAME}\n# File: {}\n\n{body}",
            path.display()
        ))
    }

    /// Write the defaults to `path`, creating parent directories.
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
        let body = RelayConfig::default().to_toml(path)?;
        fs::write(path, body).with_context(|| format!("writing config file {}", path.display()))
    }
}

pub fn default_config_file() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn expand_path(path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => {
            let expanded = shellexpand::full(text).context("expanding path")?;
            Ok(PathBuf::from(expanded.to_string()))
        }
        None => Ok(path.to_path_buf()),
    }
}
