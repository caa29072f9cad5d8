use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SETTINGS_FILE_NAME: &str = "retouch_settings.json";

const GIB: u64 = 1024 * 1024 * 1024;

/// On-disk configuration. Every field has a default so partial files load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// When enabled the logger starts at debug level and honours `RUST_LOG`.
    #[serde(default)]
    pub debug_logging: bool,
    /// Optional log file in addition to stderr.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub history: HistorySettings,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub image: ImageSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub view: ViewSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HistorySettings {
    /// Fixed undo depth. When `None` the depth is picked from total system
    /// memory at startup.
    #[serde(default)]
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySettings {
    /// Percentage of system memory that raises a warning.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    /// Percentage of system memory that forces an immediate cleanup.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
    /// Minimum spacing between cleanups triggered at warning level.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
            sample_interval_secs: default_sample_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSettings {
    #[serde(default = "default_max_dimension")]
    pub max_width: u32,
    #[serde(default = "default_max_dimension")]
    pub max_height: u32,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            max_width: default_max_dimension(),
            max_height: default_max_dimension(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// How long a caller blocks on a queued transform. `None` waits forever.
    #[serde(default)]
    pub queued_timeout_ms: Option<u64>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            queued_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSettings {
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_warning_threshold() -> f64 {
    70.0
}

fn default_critical_threshold() -> f64 {
    80.0
}

fn default_sample_interval() -> u64 {
    5
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_max_dimension() -> u32 {
    10_000
}

fn default_queue_depth() -> usize {
    8
}

fn default_cache_capacity() -> usize {
    10
}

impl Settings {
    /// Load settings from `path`. A missing or empty file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read settings file {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("deserialize settings file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create settings folder {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("serialize settings")?;
        std::fs::write(path, json)
            .with_context(|| format!("write settings file {}", path.display()))
    }
}

pub fn settings_path_from_exe_path(exe_path: &Path) -> Result<PathBuf> {
    let parent = exe_path
        .parent()
        .ok_or_else(|| anyhow!("executable path has no parent: {}", exe_path.display()))?;
    Ok(parent.join(SETTINGS_FILE_NAME))
}

pub fn resolve_settings_path() -> Result<PathBuf> {
    let exe_path = std::env::current_exe().context("resolve current executable")?;
    settings_path_from_exe_path(&exe_path)
}

/// Undo depth by memory tier: < 4 GiB, < 8 GiB, and everything above.
pub fn history_capacity_for_memory(total_memory_bytes: u64) -> usize {
    if total_memory_bytes < 4 * GIB {
        50
    } else if total_memory_bytes < 8 * GIB {
        75
    } else {
        100
    }
}

/// Resolved, immutable configuration handed to the session and the monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub history_capacity: usize,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub sample_interval: Duration,
    pub cleanup_interval: Duration,
    pub max_image_dimensions: (u32, u32),
    pub queue_depth: usize,
    pub queued_timeout: Option<Duration>,
    pub view_cache_capacity: usize,
}

impl SessionConfig {
    /// Resolve against the memory of the machine we are running on.
    pub fn resolve(settings: &Settings) -> Self {
        Self::from_settings(settings, crate::memory::total_system_memory())
    }

    pub fn from_settings(settings: &Settings, total_memory_bytes: u64) -> Self {
        let history_capacity = settings
            .history
            .capacity
            .unwrap_or_else(|| history_capacity_for_memory(total_memory_bytes))
            .max(1);

        let critical = settings.memory.critical_threshold.clamp(0.0, 100.0);
        let mut warning = settings.memory.warning_threshold.clamp(0.0, 100.0);
        if warning > critical {
            tracing::warn!(
                warning,
                critical,
                "warning threshold above critical threshold; using critical for both"
            );
            warning = critical;
        }

        Self {
            history_capacity,
            warning_threshold: warning,
            critical_threshold: critical,
            sample_interval: Duration::from_secs(settings.memory.sample_interval_secs.max(1)),
            cleanup_interval: Duration::from_secs(settings.memory.cleanup_interval_secs),
            max_image_dimensions: (settings.image.max_width, settings.image.max_height),
            queue_depth: settings.executor.queue_depth.max(1),
            queued_timeout: settings.executor.queued_timeout_ms.map(Duration::from_millis),
            view_cache_capacity: settings.view.cache_capacity.max(1),
        }
    }

    /// Defaults with an explicit history depth; handy for embedding and tests.
    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            history_capacity: capacity.max(1),
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), 8 * GIB)
    }
}
