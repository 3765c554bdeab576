//! Runtime configuration: scan behavior, host-stack quirk flags and
//! logging options, persisted as JSON under the platform config dir.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::models::ScanMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            console_logging_enabled: default_true(),
            file_logging_enabled: default_false(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_central".to_string()
}

/// Behavioral workarounds for known host-stack defects. Callers set these
/// per deployment instead of the library probing OS versions at runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StackQuirks {
    /// The host stack gives up on connect attempts after roughly 5 seconds
    /// instead of the usual 30. Use the short supervision window so a stack
    /// timeout is still classified correctly.
    #[serde(default = "default_false")]
    pub short_connection_timeout: bool,
    /// The host stack races service discovery against bonding state
    /// restoration. Delay discovery by one second when connecting to a
    /// bonded peripheral.
    #[serde(default = "default_false")]
    pub delayed_discovery_when_bonded: bool,
    /// Retry the command that failed with an encryption error once bonding
    /// completes. Stacks that transparently re-issue the ATT request after
    /// pairing should leave this off to avoid a duplicate operation.
    #[serde(default = "default_true")]
    pub retry_commands_after_bonding: bool,
}

impl Default for StackQuirks {
    fn default() -> Self {
        Self {
            short_connection_timeout: false,
            delayed_discovery_when_bonded: false,
            retry_commands_after_bonding: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralSettings {
    /// Duty cycle for discovery scans. Autoconnect scans always run low
    /// power.
    #[serde(default = "default_scan_mode")]
    pub scan_mode: ScanMode,

    #[serde(default)]
    pub quirks: StackQuirks,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for CentralSettings {
    fn default() -> Self {
        Self {
            scan_mode: default_scan_mode(),
            quirks: StackQuirks::default(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_scan_mode() -> ScanMode {
    ScanMode::LowLatency
}

/// Loads settings at startup and writes them back on change.
pub struct SettingsStore {
    settings: CentralSettings,
    settings_path: PathBuf,
}

impl SettingsStore {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ble_central");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<CentralSettings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &CentralSettings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut CentralSettings {
        &mut self.settings
    }
}
