//! Device registry rows and the six-digit device code derived from them.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Number of digits in a device code.
pub const DEVICE_CODE_LEN: usize = 6;

const DEVICE_CODE_MODULUS: u64 = 1_000_000;

/// Errors that can occur when parsing a device code.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeviceCodeError {
    #[error("Invalid device code length: expected 6 digits, got {0}")]
    InvalidLength(usize),

    #[error("Device code must contain only digits: {0}")]
    NotNumeric(String),
}

/// Six-digit address of a device, derived from its globally unique id.
///
/// Used as the key of a peer session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceCode(String);

impl DeviceCode {
    /// Derive the code for a device id: sha256(device_id) reduced mod 10^6.
    pub fn derive(device_id: &str) -> Self {
        let hash = Sha256::digest(device_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash[..8]);
        let value = u64::from_be_bytes(prefix) % DEVICE_CODE_MODULUS;
        Self(format!("{:06}", value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceCode {
    type Err = DeviceCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != DEVICE_CODE_LEN {
            return Err(DeviceCodeError::InvalidLength(s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DeviceCodeError::NotNumeric(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for DeviceCode {
    type Error = DeviceCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceCode> for String {
    fn from(code: DeviceCode) -> Self {
        code.0
    }
}

impl fmt::Display for DeviceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A row of the `devices` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub device_id: String,
    pub device_code: String,
    pub created_at: i64,
    pub is_current: bool,
}

impl Device {
    /// Create a fresh identity for this machine. The local id is assigned on insert.
    pub fn generate() -> Self {
        let device_id = Uuid::new_v4().to_string();
        Self {
            id: 0,
            device_code: DeviceCode::derive(&device_id).to_string(),
            device_id,
            created_at: Utc::now().timestamp(),
            is_current: true,
        }
    }

    /// The device code as a typed address.
    pub fn code(&self) -> DeviceCode {
        DeviceCode::derive(&self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_code_is_deterministic() {
        let id = "6a1f4a0e-51d3-4c1e-9a59-2f5f3c8d6b71";
        let code1 = DeviceCode::derive(id);
        let code2 = DeviceCode::derive(id);
        assert_eq!(code1, code2);
        assert_eq!(code1.as_str().len(), DEVICE_CODE_LEN);
        assert!(code1.as_str().bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn test_device_code_differs_between_ids() {
        let a = DeviceCode::derive("device-a");
        let b = DeviceCode::derive("device-b");
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_device_code() {
        let code: DeviceCode = "004211".parse().unwrap();
        assert_eq!(code.to_string(), "004211");

        assert_eq!(
            "12345".parse::<DeviceCode>(),
            Err(DeviceCodeError::InvalidLength(5))
        );
        assert!(matches!(
            "12a456".parse::<DeviceCode>(),
            Err(DeviceCodeError::NotNumeric(_))
        ));
    }

    #[test]
    fn test_generated_device_matches_code() {
        let device = Device::generate();
        assert!(device.is_current);
        assert_eq!(device.device_code, device.code().to_string());
        assert!(Uuid::parse_str(&device.device_id).is_ok());
    }

    #[test]
    fn test_device_code_serde_validates() {
        let code = DeviceCode::derive("x");
        let json = serde_json::to_string(&code).unwrap();
        let back: DeviceCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);

        assert!(serde_json::from_str::<DeviceCode>("\"abc\"").is_err());
    }
}
