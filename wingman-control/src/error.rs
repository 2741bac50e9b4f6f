//! Error types for wingman-control

use thiserror::Error;
use wingman_bus::BusError;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Perception unavailable: {0}")]
    PerceptionUnavailable(String),

    #[error("Control loop is not running")]
    Stopped,

    #[error("Core error: {0}")]
    Core(#[from] wingman_core::Error),
}

impl ControlError {
    /// Errors that end the control loop
    pub fn is_fatal(&self) -> bool {
        matches!(self, ControlError::PerceptionUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
