//! Error types for wingman-bus

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error reported by a device in the error byte of its status packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// The device failed to process the instruction
    ResultFail,
    /// Undefined instruction, or action without reg write
    Instruction,
    /// The packet CRC did not match
    Crc,
    /// Data to write is outside the register's address range
    DataRange,
    /// Data shorter than the register width
    DataLength,
    /// Value outside the register's permitted limits
    DataLimit,
    /// Write to a read-only register, or a locked register with torque on
    Access,
    Unknown(u8),
}

impl DeviceError {
    /// Bit 7 of the error byte flags a hardware alert, independent of the error code
    pub const ALERT_BIT: u8 = 0x80;

    /// Decode the error code from a status error byte; `None` when the
    /// instruction succeeded.
    pub fn from_status(error: u8) -> Option<Self> {
        match error & !Self::ALERT_BIT {
            0 => None,
            1 => Some(DeviceError::ResultFail),
            2 => Some(DeviceError::Instruction),
            3 => Some(DeviceError::Crc),
            4 => Some(DeviceError::DataRange),
            5 => Some(DeviceError::DataLength),
            6 => Some(DeviceError::DataLimit),
            7 => Some(DeviceError::Access),
            other => Some(DeviceError::Unknown(other)),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DeviceError::ResultFail => 1,
            DeviceError::Instruction => 2,
            DeviceError::Crc => 3,
            DeviceError::DataRange => 4,
            DeviceError::DataLength => 5,
            DeviceError::DataLimit => 6,
            DeviceError::Access => 7,
            DeviceError::Unknown(code) => code & !Self::ALERT_BIT,
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::ResultFail => write!(f, "result fail"),
            DeviceError::Instruction => write!(f, "instruction error"),
            DeviceError::Crc => write!(f, "CRC error"),
            DeviceError::DataRange => write!(f, "data range error"),
            DeviceError::DataLength => write!(f, "data length error"),
            DeviceError::DataLimit => write!(f, "data limit error"),
            DeviceError::Access => write!(f, "access error"),
            DeviceError::Unknown(code) => write!(f, "unknown error code {}", code),
        }
    }
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Bus communication error: {0}")]
    Comm(String),

    #[error("Bus timeout after {after:?} waiting for {waiting_for}")]
    Timeout { after: Duration, waiting_for: String },

    #[error("Device {id} reported {error}")]
    Protocol { id: u8, error: DeviceError },

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "serial-transport")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl BusError {
    /// The device answered, but with an error code
    pub fn is_protocol(&self) -> bool {
        matches!(self, BusError::Protocol { .. })
    }

    /// The transaction did not complete
    pub fn is_comm(&self) -> bool {
        !self.is_protocol() && !matches!(self, BusError::InvalidRequest(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_decoding() {
        assert_eq!(DeviceError::from_status(0), None);
        assert_eq!(DeviceError::from_status(0x80), None);
        assert_eq!(DeviceError::from_status(6), Some(DeviceError::DataLimit));
        assert_eq!(DeviceError::from_status(0x87), Some(DeviceError::Access));
        assert_eq!(DeviceError::from_status(0x12), Some(DeviceError::Unknown(0x12)));
    }

    #[test]
    fn test_device_error_code_roundtrip() {
        for code in 1..=7u8 {
            let error = DeviceError::from_status(code).unwrap();
            assert_eq!(error.code(), code);
        }
    }

    #[test]
    fn test_bus_error_classification() {
        let protocol = BusError::Protocol {
            id: 1,
            error: DeviceError::DataLimit,
        };
        assert!(protocol.is_protocol());
        assert!(!protocol.is_comm());

        let timeout = BusError::Timeout {
            after: Duration::from_millis(20),
            waiting_for: "status from 1".to_string(),
        };
        assert!(timeout.is_comm());
        assert!(timeout.to_string().contains("status from 1"));

        assert!(!BusError::InvalidRequest("dup".to_string()).is_comm());
    }

    #[test]
    fn test_bus_error_display() {
        let err = BusError::Protocol {
            id: 2,
            error: DeviceError::DataLimit,
        };
        assert_eq!(err.to_string(), "Device 2 reported data limit error");
    }
}
