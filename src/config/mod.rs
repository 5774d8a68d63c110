//! Configuration for capture pipelines
//!
//! [`PipelineConfig`] carries the sizing, timeout and policy knobs every
//! pipeline is built with. It is plain serde data, stored as TOML.
//!
//! # Config Location
//!
//! The default file lives in the platform config directory:
//! - **Linux**: `~/.config/capture-pipeline/pipeline.toml`
//! - **macOS**: `~/Library/Application Support/capture-pipeline/pipeline.toml`
//! - **Windows**: `%APPDATA%\capture-pipeline\pipeline.toml`
//!
//! Every field has a default, so a partial file (or none at all) is valid.

use crate::error::{CaptureError, Result, ResultExt};
use crate::types::ImageFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "capture-pipeline";

/// Config filename
pub const CONFIG_FILE: &str = "pipeline.toml";

/// Default number of requests a session keeps in flight
pub const DEFAULT_REQUEST_QUEUE_DEPTH: u32 = 8;

/// Default slot count; twice the queue depth so a slot is never reused while live
pub const DEFAULT_MAX_PER_REQUEST_INFO: usize = 2 * DEFAULT_REQUEST_QUEUE_DEPTH as usize;

/// Default bound on the stream-on config-done wait in milliseconds
pub const DEFAULT_STREAM_ON_TIMEOUT_MS: u64 = 900;

// ==================== Config Directory ====================

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Get the path to the default config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Logging ====================

/// Logging settings consumed by the host binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Directory for daily-rolling log files; console only when unset
    #[serde(default)]
    pub file_dir: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "info,capture_pipeline=debug".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            file_dir: None,
        }
    }
}

// ==================== Pipeline Config ====================

/// Sizing, timeouts and policy for one pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of request slots (N); request `id` uses slot `id % N`
    #[serde(default = "default_max_per_request_info")]
    pub max_per_request_info: usize,

    /// Requests the owning session keeps in flight
    #[serde(default = "default_request_queue_depth")]
    pub request_queue_depth: u32,

    /// Upper bound on batched frames per request
    #[serde(default = "default_max_batched_frames")]
    pub max_batched_frames: usize,

    /// Fence capacity of each slot
    #[serde(default = "default_max_fences_per_request")]
    pub max_fences_per_request: usize,

    /// Bound on the config-done wait inside stream-on
    #[serde(default = "default_stream_on_timeout_ms")]
    pub stream_on_timeout_ms: u64,

    /// Bound on waiting for every submitted request to retire
    #[serde(default = "default_nodes_request_done_timeout_ms")]
    pub nodes_request_done_timeout_ms: u64,

    /// Bound on waiting for a companion thread's stream-on
    #[serde(default = "default_stream_on_done_timeout_ms")]
    pub stream_on_done_timeout_ms: u64,

    /// Emit recovery errors from the SOF watchdog and stream-on timeouts
    #[serde(default = "default_true")]
    pub enable_watchdog_recovery: bool,

    /// Push invariant violations to the host's fatal channel
    #[serde(default = "default_true")]
    pub abort_on_invariant_violation: bool,

    /// Deliver partial metadata results
    #[serde(default)]
    pub partial_metadata_enabled: bool,

    /// Prefer hardware frame timestamps over the host clock
    #[serde(default = "default_true")]
    pub use_hardware_timestamps: bool,

    /// Format forced onto sink outputs when negotiation has to be retried
    #[serde(default)]
    pub fallback_format: ImageFormat,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_max_per_request_info() -> usize {
    DEFAULT_MAX_PER_REQUEST_INFO
}

fn default_request_queue_depth() -> u32 {
    DEFAULT_REQUEST_QUEUE_DEPTH
}

fn default_max_batched_frames() -> usize {
    8
}

fn default_max_fences_per_request() -> usize {
    32
}

fn default_stream_on_timeout_ms() -> u64 {
    DEFAULT_STREAM_ON_TIMEOUT_MS
}

fn default_nodes_request_done_timeout_ms() -> u64 {
    300
}

fn default_stream_on_done_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_per_request_info: default_max_per_request_info(),
            request_queue_depth: default_request_queue_depth(),
            max_batched_frames: default_max_batched_frames(),
            max_fences_per_request: default_max_fences_per_request(),
            stream_on_timeout_ms: default_stream_on_timeout_ms(),
            nodes_request_done_timeout_ms: default_nodes_request_done_timeout_ms(),
            stream_on_done_timeout_ms: default_stream_on_done_timeout_ms(),
            enable_watchdog_recovery: true,
            abort_on_invariant_violation: true,
            partial_metadata_enabled: false,
            use_hardware_timestamps: true,
            fallback_format: ImageFormat::default(),
            log: LogConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Reject sizings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_per_request_info == 0 {
            return Err(CaptureError::Config(
                "max_per_request_info must be non-zero".to_string(),
            ));
        }
        if self.request_queue_depth == 0 {
            return Err(CaptureError::Config(
                "request_queue_depth must be non-zero".to_string(),
            ));
        }
        if self.max_per_request_info < self.request_queue_depth as usize {
            return Err(CaptureError::Config(format!(
                "max_per_request_info ({}) is smaller than request_queue_depth ({})",
                self.max_per_request_info, self.request_queue_depth
            )));
        }
        if self.max_batched_frames == 0 {
            return Err(CaptureError::Config(
                "max_batched_frames must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CaptureError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load the default config file, returning defaults if it is missing or invalid
    pub fn load_or_default() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load pipeline config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save to a config file, creating the parent directory if needed
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CaptureError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| CaptureError::Config(format!("Failed to write config: {}", e)))
    }
}
