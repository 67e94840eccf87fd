//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration comes from an optional TOML file. Anything that
//! can change at runtime lives in the `settings` table instead.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "EMX_ROOT_FOLDER";

/// Database file name inside the root folder
pub const DATABASE_FILE: &str = "emx.db";

/// Cache directory name inside the root folder
pub const CACHE_DIR: &str = "cache";

/// Bootstrap configuration file contents
#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Allowed CORS origins; empty means any origin
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Step sources served over HTTP instead of the local `study_modules` table
    #[serde(default)]
    pub remote_sources: Vec<RemoteSourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One HTTP-backed step source
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSourceConfig {
    /// Source kind, e.g. `smartvoc` or `cognitive`
    pub kind: String,
    /// URL with a `{study_id}` placeholder
    pub url_template: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5810
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            bind_address: default_bind_address(),
            port: default_port(),
            logging: LoggingConfig::default(),
            cors_origins: Vec::new(),
            remote_sources: Vec::new(),
        }
    }
}

impl TomlConfig {
    /// Parse TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
    }

    /// Load from an explicit path, or from the platform config location
    ///
    /// A missing file is not an error: a warning is logged and defaults are
    /// used. A file that exists but does not parse is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) => p,
                None => {
                    warn!("No config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default
pub fn resolve_root_folder(
    cli_arg: Option<&str>,
    env_var_name: &str,
    toml: &TomlConfig,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// Create the root folder and its cache directory if needed
pub fn prepare_root_folder(root: &Path) -> Result<()> {
    std::fs::create_dir_all(root.join(CACHE_DIR))?;
    Ok(())
}

/// `~/.config/emx/config.toml`, then `/etc/emx/config.toml` on Linux
fn default_config_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("emx").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/emx/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }
    None
}

/// OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("emx"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/emx"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("emx"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\emx"))
    } else {
        dirs::data_local_dir()
            .map(|d| d.join("emx"))
            .unwrap_or_else(|| PathBuf::from("./emx_data"))
    }
}
