//! Configuration sections - none of these can change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths for capture output and durable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Working directory for in-progress capture files.
    /// Default: ./capture
    #[serde(default = "PathsConfig::default_capture_dir")]
    pub capture_dir: PathBuf,

    /// Directory finished captures are moved into.
    /// Default: ./complete
    #[serde(default = "PathsConfig::default_complete_dir")]
    pub complete_dir: PathBuf,

    /// Durable inclusion-list state file.
    /// Default: ~/.local/share/corral/state.json
    #[serde(default = "PathsConfig::default_state_file")]
    pub state_file: PathBuf,
}

impl PathsConfig {
    fn default_capture_dir() -> PathBuf {
        PathBuf::from("./capture")
    }

    fn default_complete_dir() -> PathBuf {
        PathBuf::from("./complete")
    }

    fn default_state_file() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/corral/state.json"))
            .unwrap_or_else(|| PathBuf::from(".local/share/corral/state.json"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            capture_dir: Self::default_capture_dir(),
            complete_dir: Self::default_complete_dir(),
            state_file: Self::default_state_file(),
        }
    }
}

/// Network bind addresses for this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    /// HTTP port for the control API.
    /// Default: 9080
    #[serde(default = "BindConfig::default_http_port")]
    pub http_port: u16,
}

impl BindConfig {
    fn default_http_port() -> u16 {
        9080
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            http_port: Self::default_http_port(),
        }
    }
}

/// Where the online-roster snapshot comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterConfig {
    /// Endpoint returning the JSON array of online sources.
    /// Default: http://127.0.0.1:9090/models
    #[serde(default = "RosterConfig::default_url")]
    pub url: String,

    /// Per-request timeout for the roster fetch.
    /// Default: 30
    #[serde(default = "RosterConfig::default_timeout_secs")]
    pub timeout_secs: u64,

    /// How long startup may wait for the first successful snapshot
    /// before the process gives up and exits.
    /// Default: 120
    #[serde(default = "RosterConfig::default_startup_window_secs")]
    pub startup_window_secs: u64,
}

impl RosterConfig {
    fn default_url() -> String {
        "http://127.0.0.1:9090/models".to_string()
    }

    fn default_timeout_secs() -> u64 {
        30
    }

    fn default_startup_window_secs() -> u64 {
        120
    }
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            timeout_secs: Self::default_timeout_secs(),
            startup_window_secs: Self::default_startup_window_secs(),
        }
    }
}

/// Capture supervision tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Finished files smaller than this are discarded instead of archived.
    /// Default: 0 (keep everything)
    #[serde(default)]
    pub min_file_size_mb: u64,

    /// Seconds between reconciliation cycles.
    /// Default: 30
    #[serde(default = "CaptureConfig::default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Grace period before the first liveness check of a new session.
    /// Must be generous: streams can take a while to start producing bytes.
    /// Default: 600
    #[serde(default = "CaptureConfig::default_first_check_delay_secs")]
    pub first_check_delay_secs: u64,

    /// Steady-state interval between liveness checks of a session.
    /// Default: 300
    #[serde(default = "CaptureConfig::default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Move finished captures into a per-source subdirectory of the
    /// complete directory.
    /// Default: false
    #[serde(default)]
    pub per_source_dirs: bool,
}

impl CaptureConfig {
    fn default_scan_interval_secs() -> u64 {
        30
    }

    fn default_first_check_delay_secs() -> u64 {
        600
    }

    fn default_check_interval_secs() -> u64 {
        300
    }

    /// Minimum size threshold in bytes.
    pub fn min_file_bytes(&self) -> u64 {
        self.min_file_size_mb * 1_048_576
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            min_file_size_mb: 0,
            scan_interval_secs: Self::default_scan_interval_secs(),
            first_check_delay_secs: Self::default_first_check_delay_secs(),
            check_interval_secs: Self::default_check_interval_secs(),
            per_source_dirs: false,
        }
    }
}

/// Post-capture conversion (`corral convert`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertConfig {
    /// Directory scanned for finished captures.
    /// Default: ./complete
    #[serde(default = "ConvertConfig::default_src_dir")]
    pub src_dir: PathBuf,

    /// Directory converted files (and their archived sources) are moved
    /// into.
    /// Default: ./converted
    #[serde(default = "ConvertConfig::default_dst_dir")]
    pub dst_dir: PathBuf,

    /// Seconds between directory scans.
    /// Default: 300
    #[serde(default = "ConvertConfig::default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Delete the source file after a successful conversion instead of
    /// archiving it next to the output.
    /// Default: false
    #[serde(default)]
    pub delete_after: bool,
}

impl ConvertConfig {
    fn default_src_dir() -> PathBuf {
        PathBuf::from("./complete")
    }

    fn default_dst_dir() -> PathBuf {
        PathBuf::from("./converted")
    }

    fn default_scan_interval_secs() -> u64 {
        300
    }
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            src_dir: Self::default_src_dir(),
            dst_dir: Self::default_dst_dir(),
            scan_interval_secs: Self::default_scan_interval_secs(),
            delete_after: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (tracing EnvFilter syntax).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
