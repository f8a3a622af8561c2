//! Unified error type for the rtlprobe-lib crate.
//!
//! [`RtlprobeError`] wraps the module errors (`DeviceError`, `TunerError`)
//! plus I/O and configuration failures, so `?` crosses module boundaries.

use std::fmt;

use crate::tuner::TunerError;
use crate::usb::{DeviceError, TransferError};

#[derive(Debug)]
pub enum RtlprobeError {
    /// USB, bring-up or session error.
    Device(DeviceError),
    /// Tuner driver error; carries a result code.
    Tuner(TunerError),
    /// Standard I/O error (config persistence).
    Io(std::io::Error),
    /// Configuration validation error.
    Config(String),
}

impl fmt::Display for RtlprobeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtlprobeError::Device(e) => write!(f, "{e}"),
            RtlprobeError::Tuner(e) => write!(f, "Tuner error ({}): {e}", e.code()),
            RtlprobeError::Io(e) => write!(f, "I/O error: {e}"),
            RtlprobeError::Config(e) => write!(f, "Config error: {e}"),
        }
    }
}

impl std::error::Error for RtlprobeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RtlprobeError::Device(e) => Some(e),
            RtlprobeError::Tuner(e) => Some(e),
            RtlprobeError::Io(e) => Some(e),
            RtlprobeError::Config(_) => None,
        }
    }
}

impl From<DeviceError> for RtlprobeError {
    fn from(e: DeviceError) -> Self {
        RtlprobeError::Device(e)
    }
}

impl From<TransferError> for RtlprobeError {
    fn from(e: TransferError) -> Self {
        RtlprobeError::Device(DeviceError::Transfer(e))
    }
}

impl From<TunerError> for RtlprobeError {
    fn from(e: TunerError) -> Self {
        RtlprobeError::Tuner(e)
    }
}

impl From<std::io::Error> for RtlprobeError {
    fn from(e: std::io::Error) -> Self {
        RtlprobeError::Io(e)
    }
}

/// Crate-level Result alias using [`RtlprobeError`].
pub type Result<T> = std::result::Result<T, RtlprobeError>;
