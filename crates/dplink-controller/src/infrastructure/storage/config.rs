//! TOML-based configuration persistence for the controller.
//!
//! Reads and writes [`ControllerConfig`] to the platform-appropriate file:
//! - Windows:  `%APPDATA%\DPLink\controller.toml`
//! - Linux:    `~/.config/dplink/controller.toml`
//! - macOS:    `~/Library/Application Support/DPLink/controller.toml`
//!
//! Example:
//!
//! ```toml
//! [controller]
//! log_level = "debug"
//!
//! [timing]
//! time_unit_ms = 1000
//! notification_delay_ms = 0
//!
//! [resources]
//! mixers = 4
//! compression_blocks = 2
//!
//! [hdcp]
//! enabled = true
//! sink_sync = false
//!
//! [mst]
//! enabled = true
//! max_streams = 4
//! ```
//!
//! Every field has a serde default, so a missing file, a missing section or
//! a missing key all fall back to the values below.  Out-of-range delays are
//! clamped when converted into a [`TimingConfig`], never rejected.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dplink_core::PlatformCapacity;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::connection::ConnectionOptions;
use crate::application::hardware::PanelKind;
use crate::application::timing::TimingConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level controller configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    #[serde(default)]
    pub controller: GeneralConfig,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub resources: ResourcesSection,
    #[serde(default)]
    pub hdcp: HdcpSection,
    #[serde(default)]
    pub mst: MstSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Schema version string.
    #[serde(default = "default_version")]
    pub version: String,
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Treat attached links as embedded panels.
    #[serde(default)]
    pub embedded_panel: bool,
}

/// Delay knobs, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingSection {
    /// Length of one time unit.  Acknowledgement and HDCP timeouts scale
    /// with it.
    #[serde(default = "default_time_unit_ms")]
    pub time_unit_ms: u64,
    /// Debug delay before each notification wait.  Clamped to 5000.
    #[serde(default)]
    pub notification_delay_ms: u64,
    /// Debug delay before processing hotplug low.  Clamped to 5000.
    #[serde(default)]
    pub disconnect_delay_ms: u64,
}

/// Platform display-pipeline capacity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcesSection {
    #[serde(default = "default_mixers")]
    pub mixers: u32,
    #[serde(default = "default_compression_blocks")]
    pub compression_blocks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HdcpSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Wait for the sink to report HDCP-ready before authenticating.
    #[serde(default)]
    pub sink_sync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MstSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_version() -> String {
    "1.0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_time_unit_ms() -> u64 {
    1000
}
fn default_mixers() -> u32 {
    4
}
fn default_compression_blocks() -> u32 {
    2
}
fn default_true() -> bool {
    true
}
fn default_max_streams() -> usize {
    4
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            log_level: default_log_level(),
            embedded_panel: false,
        }
    }
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            time_unit_ms: default_time_unit_ms(),
            notification_delay_ms: 0,
            disconnect_delay_ms: 0,
        }
    }
}

impl Default for ResourcesSection {
    fn default() -> Self {
        Self {
            mixers: default_mixers(),
            compression_blocks: default_compression_blocks(),
        }
    }
}

impl Default for HdcpSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            sink_sync: false,
        }
    }
}

impl Default for MstSection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_streams: default_max_streams(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl ControllerConfig {
    /// Timing with the debug delays clamped.  A zero unit falls back to the
    /// default so no wait degenerates into a busy loop.
    pub fn timing(&self) -> TimingConfig {
        let unit_ms = match self.timing.time_unit_ms {
            0 => default_time_unit_ms(),
            ms => ms,
        };
        TimingConfig::new(
            Duration::from_millis(unit_ms),
            Duration::from_millis(self.timing.notification_delay_ms),
            Duration::from_millis(self.timing.disconnect_delay_ms),
        )
    }

    pub fn capacity(&self) -> PlatformCapacity {
        PlatformCapacity {
            mixers: self.resources.mixers,
            compression_blocks: self.resources.compression_blocks,
        }
    }

    /// Options applied to every attached connection.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            panel: if self.controller.embedded_panel {
                PanelKind::Edp
            } else {
                PanelKind::Dp
            },
            mst_capable: self.mst.enabled,
            hdcp_enabled: self.hdcp.enabled,
            sink_sync: self.hdcp.sink_sync,
            max_streams: self.mst.max_streams.max(1),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("controller.toml"))
}

/// Loads the config from the platform location, or defaults if absent.
pub fn load_config() -> Result<ControllerConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `ControllerConfig` from `path`, returning the defaults if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<ControllerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ControllerConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn save_config(config: &ControllerConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_file_path()?)
}

/// Persists `config` to `path`, creating the parent directory if needed.
pub fn save_config_to(config: &ControllerConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("DPLink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("dplink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("DPLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("dplink_test_{}", Uuid::new_v4()))
            .join("controller.toml")
    }

    #[test]
    fn test_default_config_uses_one_second_unit_and_no_debug_delays() {
        // Arrange / Act
        let timing = ControllerConfig::default().timing();

        // Assert
        assert_eq!(timing.unit(), Duration::from_secs(1));
        assert_eq!(timing.notification_delay(), Duration::ZERO);
        assert_eq!(timing.disconnect_delay(), Duration::ZERO);
    }

    #[test]
    fn test_default_options_enable_hdcp_and_disable_mst() {
        let options = ControllerConfig::default().connection_options();
        assert!(options.hdcp_enabled);
        assert!(!options.mst_capable);
        assert_eq!(options.panel, PanelKind::Dp);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg: ControllerConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, ControllerConfig::default());
    }

    #[test]
    fn test_partial_section_overrides_only_given_keys() {
        // Arrange
        let toml_str = r#"
[resources]
mixers = 6

[mst]
enabled = true
"#;

        // Act
        let cfg: ControllerConfig = toml::from_str(toml_str).unwrap();

        // Assert
        assert_eq!(cfg.capacity().mixers, 6);
        assert_eq!(cfg.capacity().compression_blocks, 2);
        assert!(cfg.connection_options().mst_capable);
        assert_eq!(cfg.connection_options().max_streams, 4);
    }

    #[test]
    fn test_oversized_delays_are_clamped_to_five_seconds() {
        let mut cfg = ControllerConfig::default();
        cfg.timing.notification_delay_ms = 60_000;
        cfg.timing.disconnect_delay_ms = 9_000;

        let timing = cfg.timing();

        assert_eq!(timing.notification_delay(), Duration::from_secs(5));
        assert_eq!(timing.disconnect_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_time_unit_falls_back_to_default() {
        let mut cfg = ControllerConfig::default();
        cfg.timing.time_unit_ms = 0;
        assert_eq!(cfg.timing().unit(), Duration::from_secs(1));
    }

    #[test]
    fn test_embedded_panel_flag_selects_edp() {
        let cfg: ControllerConfig = toml::from_str("[controller]\nembedded_panel = true\n").unwrap();
        assert_eq!(cfg.connection_options().panel, PanelKind::Edp);
    }

    #[test]
    fn test_invalid_toml_returns_parse_error() {
        // Arrange
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        // Act
        let result = load_config_from(&path);

        // Assert
        assert!(matches!(result, Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_load_returns_default_when_file_absent() {
        let path = PathBuf::from("/nonexistent/path/that/cannot/exist/controller.toml");
        let cfg = load_config_from(&path).unwrap();
        assert_eq!(cfg, ControllerConfig::default());
    }

    #[test]
    fn test_save_then_load_preserves_values() {
        // Arrange
        let path = temp_path();
        let mut cfg = ControllerConfig::default();
        cfg.controller.log_level = "debug".to_string();
        cfg.timing.time_unit_ms = 10;
        cfg.hdcp.sink_sync = true;

        // Act
        save_config_to(&cfg, &path).unwrap();
        let loaded = load_config_from(&path).unwrap();

        // Assert
        assert_eq!(loaded, cfg);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_config_file_path_ends_with_controller_toml() {
        // NoPlatformConfigDir is acceptable in a stripped environment.
        if let Ok(path) = config_file_path() {
            assert!(path.ends_with("controller.toml"), "got {path:?}");
        }
    }
}
