//! Configuration module for TekScope
//!
//! This module handles service configuration including:
//! - Serial link settings for the scope and the control panel
//! - Calibration constants used by the sample decoder
//! - The control panel layout (which encoder/switch does what)
//! - Startup capture settings and the protocol violation policy
//!
//! Configuration is stored as TOML. When no path is given the service looks in
//! the platform config directory:
//! - **Linux**: `~/.config/tekscope-rs/tekscope.toml`
//! - **macOS**: `~/Library/Application Support/tekscope-rs/tekscope.toml`
//! - **Windows**: `%APPDATA%\tekscope-rs\tekscope.toml`
//!
//! # Example
//!
//! ```ignore
//! use tekscope_rs::config::ServiceConfig;
//!
//! let mut config = ServiceConfig::load_or_default(None)?;
//! config.server.port = 5001;
//! config.save("tekscope.toml")?;
//! ```

pub mod capture;

pub use capture::{CaptureConfig, CaptureState};

use crate::backend::ViolationPolicyKind;
use crate::controls::{default_encoders, default_leds, default_switches, EncoderSpec, SwitchSpec};
use crate::error::{ControlKind, Result, ScopeError};
use crate::types::PreampGain;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "tekscope-rs";

/// Config filename
pub const CONFIG_FILE: &str = "tekscope.toml";

/// Scope serial speed
pub const DEFAULT_SCOPE_BAUD_RATE: u32 = 230_400;

/// Scope read timeout in milliseconds
pub const DEFAULT_SCOPE_TIMEOUT_MS: u64 = 10_000;

/// Control panel serial speed
pub const DEFAULT_PANEL_BAUD_RATE: u32 = 9600;

/// Control panel read timeout in milliseconds
pub const DEFAULT_PANEL_TIMEOUT_MS: u64 = 200;

/// TCP port subscribers connect to
pub const DEFAULT_SERVER_PORT: u16 = 5000;

/// Get the path of the default config file
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

// ==================== Serial Links ====================

/// Scope serial link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeLinkConfig {
    pub baud_rate: u32,
    /// Read timeout in milliseconds; 0 blocks until data arrives
    pub read_timeout_ms: u64,
    /// RTS/CTS flow control
    pub hardware_flow_control: bool,
}

impl Default for ScopeLinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_SCOPE_BAUD_RATE,
            read_timeout_ms: DEFAULT_SCOPE_TIMEOUT_MS,
            hardware_flow_control: true,
        }
    }
}

impl ScopeLinkConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }
}

/// Control panel link settings and layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    /// Ticks added or removed per encoder detent
    pub encoder_step: i64,
    /// Trigger level encoder is clamped to `[-limit, +limit]` volts
    pub trigger_level_limit: f64,
    /// Volts per trigger encoder tick
    pub trigger_step_volts: f64,
    pub leds: Vec<char>,
    pub encoders: Vec<EncoderSpec>,
    pub switches: Vec<SwitchSpec>,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_PANEL_BAUD_RATE,
            read_timeout_ms: DEFAULT_PANEL_TIMEOUT_MS,
            encoder_step: 1,
            trigger_level_limit: 2.5,
            trigger_step_volts: 0.05,
            leds: default_leds(),
            encoders: default_encoders(),
            switches: default_switches(),
        }
    }
}

impl PanelConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

// ==================== Server ====================

/// Subscriber listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_SERVER_PORT,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

// ==================== Calibration ====================

/// Conversion constants between device counts and volts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    /// Volts per count with the preamp in high gain
    pub high_gain_volts_per_count: f64,
    /// Volts per count with the preamp in low gain
    pub low_gain_volts_per_count: f64,
    /// Multiplier applied when converting a trigger level to a device code
    pub trigger_gain: f64,
    /// Decimal digits kept in published voltages
    pub decimals: u32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            high_gain_volts_per_count: 0.01,
            low_gain_volts_per_count: 0.05,
            trigger_gain: 1.0,
            decimals: 2,
        }
    }
}

impl Calibration {
    pub fn step_size(&self, gain: PreampGain) -> f64 {
        match gain {
            PreampGain::High => self.high_gain_volts_per_count,
            PreampGain::Low => self.low_gain_volts_per_count,
        }
    }
}

// ==================== Acquisition ====================

/// Acquisition loop behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// What to do when a frame arrives with an unexpected tag
    pub violation_policy: ViolationPolicyKind,
    /// Consecutive violations tolerated by the resync policy before aborting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resync_limit: Option<usize>,
    /// Consecutive read timeouts after which a cycle is abandoned
    pub max_consecutive_timeouts: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            violation_policy: ViolationPolicyKind::Resync,
            resync_limit: None,
            max_consecutive_timeouts: 5,
        }
    }
}

// ==================== Service Config ====================

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub scope: ScopeLinkConfig,
    pub panel: PanelConfig,
    pub server: ServerConfig,
    /// Capture settings pushed to the scope at startup
    pub capture: CaptureState,
    pub calibration: Calibration,
    pub acquisition: AcquisitionConfig,
}

impl ServiceConfig {
    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ScopeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: ServiceConfig = toml::from_str(&contents).map_err(|e| {
            ScopeError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ScopeError::Serialization(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Load the given file, else the default location, else built-in defaults
    ///
    /// An explicitly given path must exist; the default location is optional.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match default_config_path() {
            Some(default_path) if default_path.exists() => {
                tracing::info!("Loading config from {:?}", default_path);
                Self::load(default_path)
            }
            _ => {
                tracing::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Check values that would be rejected later by the device or registry
    pub fn validate(&self) -> Result<()> {
        CaptureState::validate(&self.capture)?;

        let cal = &self.calibration;
        if !(cal.high_gain_volts_per_count > 0.0 && cal.low_gain_volts_per_count > 0.0) {
            return Err(ScopeError::Config(
                "volts per count must be positive".to_string(),
            ));
        }
        if cal.trigger_gain <= 0.0 {
            return Err(ScopeError::Config("trigger gain must be positive".to_string()));
        }
        if self.panel.trigger_level_limit < 0.0 || self.panel.trigger_step_volts <= 0.0 {
            return Err(ScopeError::Config(
                "trigger limit must be non-negative and trigger step positive".to_string(),
            ));
        }
        if self.panel.encoder_step <= 0 {
            return Err(ScopeError::Config("encoder step must be positive".to_string()));
        }

        let encoder_ids = self
            .panel
            .encoders
            .iter()
            .map(|spec| {
                spec.id_char().ok_or_else(|| {
                    ScopeError::InvalidSetting(format!(
                        "encoder id {} is not a single digit",
                        spec.id
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(spec) = self.panel.switches.iter().find(|s| !s.id.is_ascii_uppercase()) {
            return Err(ScopeError::InvalidSetting(format!(
                "switch id {:?} is not an uppercase letter",
                spec.id
            )));
        }

        check_unique(ControlKind::Encoder, encoder_ids.into_iter())?;
        check_unique(ControlKind::Switch, self.panel.switches.iter().map(|s| s.id))?;
        check_unique(ControlKind::Led, self.panel.leds.iter().copied())?;
        Ok(())
    }
}

fn check_unique(kind: ControlKind, ids: impl Iterator<Item = char>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ScopeError::DuplicateRegistration { kind, id });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::{EncoderAction, SwitchAction};
    use tempfile::TempDir;

    #[test]
    fn test_defaults_validate() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scope.baud_rate, 230_400);
        assert_eq!(config.panel.baud_rate, 9600);
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.capture.sample_rate_divisor, 7);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("tekscope.toml");

        let mut config = ServiceConfig::default();
        config.server.port = 6001;
        config.acquisition.violation_policy = ViolationPolicyKind::Abort;
        config.acquisition.resync_limit = Some(12);
        config.panel.encoders[0].action = EncoderAction::SampleRateDivisor;
        config.save(&path).unwrap();

        let loaded = ServiceConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("partial.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 7000

[scope]
read_timeout_ms = 0

[[panel.switches]]
id = "Q"
action = { kind = "trigger_edge" }
"#,
        )
        .unwrap();

        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.scope.read_timeout(), None);
        assert_eq!(config.panel.switches.len(), 1);
        assert_eq!(config.panel.switches[0].action, SwitchAction::TriggerEdge);
        assert_eq!(config.panel.encoders, default_encoders());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut config = ServiceConfig::default();
        config.panel.leds.push('A');
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ScopeError::DuplicateRegistration {
                kind: ControlKind::Led,
                id: 'A'
            }
        ));
    }

    #[test]
    fn test_out_of_range_control_ids_rejected() {
        let mut config = ServiceConfig::default();
        config.panel.encoders = vec![
            EncoderSpec::new(10, EncoderAction::SampleRateDivisor),
            EncoderSpec::new(11, EncoderAction::TriggerLevel),
        ];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ScopeError::InvalidSetting(ref msg) if msg.contains("10")));

        let mut config = ServiceConfig::default();
        config.panel.switches.push(SwitchSpec::new('g', SwitchAction::TriggerEdge));
        assert!(matches!(config.validate(), Err(ScopeError::InvalidSetting(_))));
    }

    #[test]
    fn test_invalid_divisor_rejected() {
        let mut config = ServiceConfig::default();
        config.capture.sample_rate_divisor = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.toml");
        assert!(matches!(
            ServiceConfig::load_or_default(Some(&missing)),
            Err(ScopeError::Config(_))
        ));
    }
}
