//! Port role switching
//!
//! Only port 1 exists. A role pair maps onto a mode string that is
//! persisted to the configured mode file, so the role survives restarts and
//! other tooling can read it.

use crate::usb::lock;
use protocol::{PortInfo, Result, UsbdError};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_PORT_ID: i32 = 1;

pub const POWER_ROLE_SOURCE: i32 = 1;
pub const POWER_ROLE_SINK: i32 = 2;

pub const DATA_ROLE_HOST: i32 = 1;
pub const DATA_ROLE_DEVICE: i32 = 2;

pub const PORT_MODE_UFP: i32 = 1;
pub const PORT_MODE_DFP: i32 = 2;

/// Role of the port, as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    Host,
    Device,
}

impl PortMode {
    /// Mode for a (power role, data role) pair
    pub fn from_roles(power_role: i32, data_role: i32) -> Option<Self> {
        match (power_role, data_role) {
            (POWER_ROLE_SOURCE, DATA_ROLE_HOST) => Some(PortMode::Host),
            (POWER_ROLE_SINK, DATA_ROLE_DEVICE) => Some(PortMode::Device),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortMode::Host => "host",
            PortMode::Device => "device",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "host" => Some(PortMode::Host),
            "device" => Some(PortMode::Device),
            _ => None,
        }
    }

    pub fn port_info(self) -> PortInfo {
        match self {
            PortMode::Host => PortInfo {
                port_id: DEFAULT_PORT_ID,
                power_role: POWER_ROLE_SOURCE,
                data_role: DATA_ROLE_HOST,
                mode: PORT_MODE_DFP,
            },
            PortMode::Device => PortInfo {
                port_id: DEFAULT_PORT_ID,
                power_role: POWER_ROLE_SINK,
                data_role: DATA_ROLE_DEVICE,
                mode: PORT_MODE_UFP,
            },
        }
    }
}

/// Port role state
pub struct UsbdPort {
    mode_file: Option<PathBuf>,
    current: Mutex<PortMode>,
}

impl UsbdPort {
    /// Load the persisted mode, defaulting to device (sink, UFP)
    pub fn new(mode_file: Option<PathBuf>) -> Self {
        let current = mode_file
            .as_ref()
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|content| PortMode::parse(&content))
            .unwrap_or(PortMode::Device);

        Self {
            mode_file,
            current: Mutex::new(current),
        }
    }

    /// Switch roles and persist the new mode
    pub fn set_port_role(&self, port_id: i32, power_role: i32, data_role: i32) -> Result<PortInfo> {
        if port_id != DEFAULT_PORT_ID {
            warn!("Unknown port {}", port_id);
            return Err(UsbdError::InvalidParam);
        }
        let mode = PortMode::from_roles(power_role, data_role).ok_or_else(|| {
            warn!(
                "Unsupported role pair: power {} data {}",
                power_role, data_role
            );
            UsbdError::InvalidParam
        })?;

        if let Some(path) = &self.mode_file {
            fs::write(path, mode.as_str()).map_err(|e| {
                warn!("Failed to write port mode to {}: {}", path.display(), e);
                UsbdError::Io
            })?;
        }

        *lock(&self.current) = mode;
        info!("Port {} switched to {} mode", port_id, mode.as_str());
        Ok(mode.port_info())
    }

    /// Current roles, re-read from the mode file when there is one
    pub fn query_port(&self) -> PortInfo {
        let mut current = lock(&self.current);
        if let Some(persisted) = self
            .mode_file
            .as_ref()
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|content| PortMode::parse(&content))
        {
            *current = persisted;
        }
        debug!("Port {} in {} mode", DEFAULT_PORT_ID, current.as_str());
        current.port_info()
    }
}
