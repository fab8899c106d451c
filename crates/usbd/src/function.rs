//! Gadget function selection
//!
//! Functions are a bitmask. The enabled set is persisted as a
//! comma-separated list of function names.

use crate::usb::lock;
use protocol::{Result, UsbdError};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

pub const FUNCTION_NONE: u32 = 0;
pub const FUNCTION_ACM: u32 = 1;
pub const FUNCTION_ECM: u32 = 1 << 1;
pub const FUNCTION_HDC: u32 = 1 << 2;
pub const FUNCTION_MTP: u32 = 1 << 3;
pub const FUNCTION_PTP: u32 = 1 << 4;
pub const FUNCTION_RNDIS: u32 = 1 << 5;
pub const FUNCTION_STORAGE: u32 = 1 << 9;

const FUNCTION_NAMES: [(u32, &str); 7] = [
    (FUNCTION_ACM, "acm"),
    (FUNCTION_ECM, "ecm"),
    (FUNCTION_HDC, "hdc"),
    (FUNCTION_MTP, "mtp"),
    (FUNCTION_PTP, "ptp"),
    (FUNCTION_RNDIS, "rndis"),
    (FUNCTION_STORAGE, "storage"),
];

const FUNCTION_ALL: u32 = FUNCTION_ACM
    | FUNCTION_ECM
    | FUNCTION_HDC
    | FUNCTION_MTP
    | FUNCTION_PTP
    | FUNCTION_RNDIS
    | FUNCTION_STORAGE;

pub const DEFAULT_FUNCTIONS: u32 = FUNCTION_HDC;

/// Check a function mask
pub fn validate_functions(funcs: u32) -> Result<()> {
    if funcs & !FUNCTION_ALL != 0 {
        return Err(UsbdError::InvalidParam);
    }
    if funcs & FUNCTION_MTP != 0 && funcs & FUNCTION_PTP != 0 {
        return Err(UsbdError::InvalidParam);
    }
    Ok(())
}

/// Comma-separated names of the functions in `funcs`
pub fn functions_to_string(funcs: u32) -> String {
    FUNCTION_NAMES
        .iter()
        .filter(|(bit, _)| funcs & bit != 0)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(",")
}

/// Mask of a comma-separated name list; unknown names are rejected
pub fn functions_from_str(value: &str) -> Option<u32> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .try_fold(FUNCTION_NONE, |mask, name| {
            FUNCTION_NAMES
                .iter()
                .find(|(_, known)| *known == name)
                .map(|(bit, _)| mask | bit)
        })
}

/// Enabled gadget functions
pub struct UsbdFunction {
    state_file: Option<PathBuf>,
    current: Mutex<u32>,
}

impl UsbdFunction {
    /// Load the persisted function list, defaulting to HDC
    pub fn new(state_file: Option<PathBuf>) -> Self {
        let current = state_file
            .as_ref()
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|content| functions_from_str(&content))
            .unwrap_or(DEFAULT_FUNCTIONS);

        Self {
            state_file,
            current: Mutex::new(current),
        }
    }

    pub fn get_current_functions(&self) -> u32 {
        *lock(&self.current)
    }

    pub fn set_current_functions(&self, funcs: u32) -> Result<()> {
        validate_functions(funcs).inspect_err(|_| warn!("Invalid function mask {:#x}", funcs))?;

        let names = functions_to_string(funcs);
        if let Some(path) = &self.state_file {
            fs::write(path, &names).map_err(|e| {
                warn!("Failed to write functions to {}: {}", path.display(), e);
                UsbdError::Io
            })?;
        }

        *lock(&self.current) = funcs;
        info!("Gadget functions set to [{}]", names);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_functions() {
        let function = UsbdFunction::new(None);
        assert_eq!(function.get_current_functions(), FUNCTION_HDC);
    }

    #[test]
    fn test_validate_functions() {
        assert!(validate_functions(FUNCTION_ACM | FUNCTION_ECM).is_ok());
        assert!(validate_functions(FUNCTION_NONE).is_ok());
        assert_eq!(
            validate_functions(FUNCTION_MTP | FUNCTION_PTP),
            Err(UsbdError::InvalidParam)
        );
        assert_eq!(validate_functions(1 << 6), Err(UsbdError::InvalidParam));
    }

    #[test]
    fn test_name_list() {
        assert_eq!(functions_to_string(FUNCTION_HDC | FUNCTION_ACM), "acm,hdc");
        assert_eq!(
            functions_from_str("hdc, storage"),
            Some(FUNCTION_HDC | FUNCTION_STORAGE)
        );
        assert_eq!(functions_from_str(""), Some(FUNCTION_NONE));
        assert_eq!(functions_from_str("hdc,bogus"), None);
    }

    #[test]
    fn test_functions_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("functions");

        let function = UsbdFunction::new(Some(path.clone()));
        function
            .set_current_functions(FUNCTION_MTP | FUNCTION_HDC)
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hdc,mtp");

        let reloaded = UsbdFunction::new(Some(path));
        assert_eq!(
            reloaded.get_current_functions(),
            FUNCTION_MTP | FUNCTION_HDC
        );
    }

    #[test]
    fn test_rejected_mask_keeps_current() {
        let function = UsbdFunction::new(None);
        assert!(function.set_current_functions(FUNCTION_MTP | FUNCTION_PTP).is_err());
        assert_eq!(function.get_current_functions(), FUNCTION_HDC);
    }
}
