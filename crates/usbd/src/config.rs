//! Service configuration management

use crate::usb::ServiceOptions;
use anyhow::{Context, Result, anyhow};
use common::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbdConfig {
    pub service: ServiceSettings,
    pub usb: UsbSettings,
    #[serde(default)]
    pub port: PortSettings,
    #[serde(default)]
    pub function: FunctionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID patterns of devices the service manages (empty = all)
    #[serde(default)]
    pub filters: Vec<String>,
    /// Upper bound of the bulk-cancel quiescence wait
    #[serde(default = "UsbSettings::default_bulk_cancel_grace_ms")]
    pub bulk_cancel_grace_ms: u64,
    /// Poll interval of the hot-plug event loop
    #[serde(default = "UsbSettings::default_event_poll_ms")]
    pub event_poll_ms: u64,
}

impl UsbSettings {
    fn default_bulk_cancel_grace_ms() -> u64 {
        500
    }

    fn default_event_poll_ms() -> u64 {
        100
    }

    pub fn bulk_cancel_grace(&self) -> Duration {
        Duration::from_millis(self.bulk_cancel_grace_ms)
    }

    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }
}

/// Port role persistence
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortSettings {
    /// File holding the port mode ("host" or "device"); `~` is expanded
    #[serde(default)]
    pub mode_file: Option<String>,
}

/// Gadget function persistence
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionSettings {
    /// File holding the enabled function names; `~` is expanded
    #[serde(default)]
    pub state_file: Option<String>,
}

impl Default for UsbdConfig {
    fn default() -> Self {
        Self {
            service: ServiceSettings {
                log_level: "info".to_string(),
                log_format: LogFormat::Full,
            },
            usb: UsbSettings {
                filters: Vec::new(),
                bulk_cancel_grace_ms: UsbSettings::default_bulk_cancel_grace_ms(),
                event_poll_ms: UsbSettings::default_event_poll_ms(),
            },
            port: PortSettings::default(),
            function: FunctionSettings::default(),
        }
    }
}

impl UsbdConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbd-host/usbd.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: UsbdConfig = toml::from_str(&content)
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
            config_dir.join("usbd-host").join("usbd.toml")
        } else {
            PathBuf::from(".config/usbd-host/usbd.toml")
        }
    }

    /// Service options with persistence paths expanded
    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            bulk_cancel_grace: self.usb.bulk_cancel_grace(),
            port_mode_file: self.port.mode_file.as_deref().map(expand_path),
            function_state_file: self.function.state_file.as_deref().map(expand_path),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.service.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.service.log_level,
                valid_levels.join(", ")
            ));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        if self.usb.event_poll_ms == 0 {
            return Err(anyhow!("event_poll_ms must be greater than 0"));
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
        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| {
                anyhow!(
                    "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                    name,
                    id
                )
            })?;

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

/// Expand a leading `~` in a configured path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
