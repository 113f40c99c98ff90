//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, CorralConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config file that was loaded, if any.
    pub file: Option<PathBuf>,
    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,
}

/// Discover the config file to load.
///
/// The CLI path wins when it exists; otherwise the local, user, and system
/// locations are tried in that order. Returns `None` when nothing exists,
/// in which case compiled defaults apply.
pub fn discover_config_file(cli_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        if path.exists() {
            return Some(path.to_path_buf());
        }
    }

    let local = PathBuf::from("corral.toml");
    if local.exists() {
        return Some(local);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("corral/config.toml");
        if user.exists() {
            return Some(user);
        }
    }

    let system = PathBuf::from("/etc/corral/config.toml");
    if system.exists() {
        return Some(system);
    }

    None
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<CorralConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Apply environment variable overrides to a loaded config.
///
/// `CORRAL_LOG` overrides `telemetry.log_level`.
pub fn apply_env_overrides(config: &mut CorralConfig, sources: &mut ConfigSources) {
    if let Ok(level) = env::var("CORRAL_LOG") {
        if !level.is_empty() {
            config.telemetry.log_level = level;
            sources.env_overrides.push("CORRAL_LOG".to_string());
        }
    }
}
