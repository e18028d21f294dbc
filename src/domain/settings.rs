use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "warn".to_string()
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
    "pebble_feel".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Bluetooth address of the device, e.g. "AA:BB:CC:DD:EE:FF"
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub name: Option<String>,

    // Polling
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub mode_polling: bool,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Advanced BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_write_uuid")]
    pub ble_write_char_uuid: String,
    #[serde(default = "default_pipe_uuid")]
    pub ble_pipe_char_uuid: String,

    // Connection Settings
    #[serde(default = "default_connect_max_retries")]
    pub connect_max_retries: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            address: None,
            name: None,
            poll_interval_secs: default_poll_interval_secs(),
            mode_polling: default_true(),
            read_timeout_ms: default_read_timeout_ms(),
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            ble_write_char_uuid: default_write_uuid(),
            ble_pipe_char_uuid: default_pipe_uuid(),
            connect_max_retries: default_connect_max_retries(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    30
}
fn default_read_timeout_ms() -> u64 {
    3000
}
fn default_service_uuid() -> String {
    "5df89308-0b98-11eb-adc1-0242ac120002".to_string()
}
fn default_write_uuid() -> String {
    "8eb21104-0b98-11eb-adc1-0242ac120002".to_string()
}
fn default_pipe_uuid() -> String {
    "8eb20e7a-0b98-11eb-adc1-0242ac120002".to_string()
}
fn default_connect_max_retries() -> u32 {
    3
}
fn default_connect_retry_delay_ms() -> u64 {
    1000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from the user config directory
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit file. A missing or unreadable file
    /// yields defaults.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("PebbleFeel");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn set_address(&mut self, address: &str) -> anyhow::Result<()> {
        self.settings.address = Some(address.trim().to_uppercase());
        self.save()
    }

    pub fn set_poll_interval(&mut self, seconds: u64) -> anyhow::Result<()> {
        if seconds == 0 {
            anyhow::bail!("Poll interval must be at least one second");
        }
        self.settings.poll_interval_secs = seconds;
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.address, None);
        assert_eq!(settings.poll_interval_secs, 30);
        assert!(settings.mode_polling);
        assert_eq!(settings.read_timeout_ms, 3000);
        assert_eq!(settings.ble_pipe_char_uuid, "8eb20e7a-0b98-11eb-adc1-0242ac120002");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "address": "AA:BB:CC:DD:EE:FF" }"#).unwrap();
        assert_eq!(settings.address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(settings.poll_interval_secs, 30);
        assert_eq!(settings.log_settings, LogSettings::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::with_path(path.clone());
        service.set_address(" aa:bb:cc:dd:ee:ff ").unwrap();
        service.set_poll_interval(45).unwrap();
        assert!(service.set_poll_interval(0).is_err());

        let reloaded = SettingsService::with_path(path);
        assert_eq!(
            reloaded.get().address.as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(reloaded.get().poll_interval_secs, 45);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::with_path(dir.path().join("absent.json"));
        assert_eq!(service.get(), &Settings::default());
    }
}
