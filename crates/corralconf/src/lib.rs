//! Minimal configuration loading for Corral.
//!
//! This crate provides configuration loading with minimal dependencies.
//! Configuration here is read-only infrastructure: paths, bind addresses,
//! capture tuning knobs. Mutable state (the inclusion list and pending
//! request queue) lives in the daemon's own state file, not here.
//!
//! # Config File Locations
//!
//! The first file found wins:
//! 1. Path passed on the command line (`--config`)
//! 2. `./corral.toml` (local override)
//! 3. `~/.config/corral/config.toml` (user)
//! 4. `/etc/corral/config.toml` (system)
//!
//! Environment variables are applied afterwards (`CORRAL_LOG` overrides
//! `telemetry.log_level`).
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! capture_dir = "./capture"
//! complete_dir = "./complete"
//! state_file = "~/.local/share/corral/state.json"
//!
//! [bind]
//! http_port = 9080
//!
//! [roster]
//! url = "http://127.0.0.1:9090/models"
//! timeout_secs = 30
//!
//! [capture]
//! min_file_size_mb = 0
//! scan_interval_secs = 30
//! first_check_delay_secs = 600
//! check_interval_secs = 300
//! per_source_dirs = false
//!
//! [convert]
//! src_dir = "./complete"
//! dst_dir = "./converted"
//! scan_interval_secs = 300
//! delete_after = false
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod loader;
pub mod settings;

pub use loader::{discover_config_file, ConfigSources};
pub use settings::{
    BindConfig, CaptureConfig, ConvertConfig, PathsConfig, RosterConfig, TelemetryConfig,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete Corral configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorralConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub roster: RosterConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub convert: ConvertConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl CorralConfig {
    /// Load configuration from the standard locations.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, preferring an explicit file path when given.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report where values came from.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();

        let mut config = match loader::discover_config_file(config_path) {
            Some(path) => {
                let config = loader::load_from_file(&path)?;
                sources.file = Some(path);
                config
            }
            None => CorralConfig::default(),
        };

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }
}
