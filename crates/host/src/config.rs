//! Host configuration management

use anyhow::{Context, Result, anyhow};
use engine::{DEFAULT_BUFFER_SIZE, EngineConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub host: HostSettings,
    /// Identity announced during the accessory handshake
    #[serde(default)]
    pub accessory: AccessoryIdentity,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    pub log_level: String,
    /// Devices to switch into accessory mode (VID:PID patterns)
    ///
    /// Empty means no automatic switching; devices already in accessory
    /// mode are always used.
    #[serde(default)]
    pub filters: Vec<String>,
    /// Capacity of the lifecycle event channel
    #[serde(default = "HostSettings::default_event_capacity")]
    pub event_capacity: usize,
    /// Single-instance lock file; defaults to `aoa-host.pid` next to the config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_file: Option<String>,
}

impl HostSettings {
    fn default_event_capacity() -> usize {
        256
    }
}

/// Strings sent with the accessory handshake
///
/// The Android application matches on manufacturer, model and version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessoryIdentity {
    pub manufacturer: String,
    pub model: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub serial: String,
}

impl Default for AccessoryIdentity {
    fn default() -> Self {
        Self {
            manufacturer: "Nexus-Computing GmbH".to_string(),
            model: "SimpleAccessory".to_string(),
            description: "Simple accessory host".to_string(),
            version: "1.0".to_string(),
            uri: "https://github.com/kimasplund/rust-aoa".to_string(),
            serial: "0000000012345678".to_string(),
        }
    }
}

impl AccessoryIdentity {
    /// Strings in handshake index order (0 = manufacturer ... 5 = serial)
    pub fn fields(&self) -> [&str; 6] {
        [
            &self.manufacturer,
            &self.model,
            &self.description,
            &self.version,
            &self.uri,
            &self.serial,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "EngineSettings::default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "EngineSettings::default_thread_name")]
    pub reader_thread_name: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            buffer_size: Self::default_buffer_size(),
            reader_thread_name: Self::default_thread_name(),
        }
    }
}

impl EngineSettings {
    fn default_buffer_size() -> usize {
        DEFAULT_BUFFER_SIZE
    }

    fn default_thread_name() -> String {
        EngineConfig::default().reader_thread_name
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            buffer_size: self.buffer_size,
            reader_thread_name: self.reader_thread_name.clone(),
        }
    }
}

/// Periodic byte written while a session is established
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    #[serde(default = "HeartbeatSettings::default_enabled")]
    pub enabled: bool,
    #[serde(default = "HeartbeatSettings::default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub value: u8,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            interval_ms: Self::default_interval_ms(),
            value: 0,
        }
    }
}

impl HeartbeatSettings {
    fn default_enabled() -> bool {
        true
    }

    fn default_interval_ms() -> u64 {
        500
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: HostSettings {
                log_level: "info".to_string(),
                filters: Vec::new(),
                event_capacity: HostSettings::default_event_capacity(),
                lock_file: None,
            },
            accessory: AccessoryIdentity::default(),
            engine: EngineSettings::default(),
            heartbeat: HeartbeatSettings::default(),
        }
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/aoa-host/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("aoa-host").join("host.toml")
        } else {
            PathBuf::from(".config/aoa-host/host.toml")
        }
    }

    /// Path of the single-instance lock file
    pub fn lock_path(&self) -> PathBuf {
        match self.host.lock_file.as_deref() {
            Some(path) => PathBuf::from(shellexpand::tilde(path).as_ref()),
            None => Self::default_path().with_file_name("aoa-host.pid"),
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        for filter in &self.host.filters {
            Self::validate_filter(filter)?;
        }

        if self.host.event_capacity == 0 {
            return Err(anyhow!("event_capacity must be greater than 0"));
        }

        if self.accessory.manufacturer.is_empty() || self.accessory.model.is_empty() {
            return Err(anyhow!("Accessory manufacturer and model must not be empty"));
        }
        if self.accessory.fields().iter().any(|s| s.contains('\0')) {
            return Err(anyhow!("Accessory identity strings must not contain NUL"));
        }

        if self.engine.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than 0"));
        }
        if self.engine.reader_thread_name.contains('\0') {
            return Err(anyhow!("reader_thread_name must not contain NUL"));
        }

        if self.heartbeat.enabled && self.heartbeat.interval_ms == 0 {
            return Err(anyhow!("Heartbeat interval must be greater than 0"));
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        if !id.starts_with("0x") && !id.starts_with("0X") {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        }

        let hex_part = &id[2..];
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<HostConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    HostConfig::load(Some(path_buf))
}
