//! Tuner abstraction and I2C discovery.
//!
//! A tuner driver implements [`Tuner`]. It never holds a reference to the
//! session: every operation receives a [`TunerDelegate`], the narrow
//! capability onto the demodulator that the driver needs (I2C access through
//! the repeater, plus a few demodulator side effects).
//!
//! Discovery walks [`KNOWN_TUNERS`] in priority order with the repeater open,
//! comparing each candidate's identification register.

pub mod r82xx;

use std::fmt;

use log::{debug, info};

use crate::usb::TransferError;

// ── Delegate ──

/// What a tuner driver may ask of the host demodulator.
pub trait TunerDelegate {
    fn set_i2c_repeater(&self, enabled: bool) -> Result<(), TransferError>;
    fn i2c_write(&self, i2c_addr: u8, data: &[u8]) -> Result<(), TransferError>;
    fn i2c_read_reg(&self, i2c_addr: u8, reg: u8) -> Result<u8, TransferError>;

    fn disable_zero_if(&self) -> Result<(), TransferError>;
    fn enable_in_phase_adc_only(&self) -> Result<(), TransferError>;
    fn set_if_frequency(&self, if_hz: u32) -> Result<(), TransferError>;
    fn enable_spectrum_inversion(&self) -> Result<(), TransferError>;
}

/// Run `f` with the I2C repeater open. The repeater is closed afterwards on
/// every path; a close failure is reported only when `f` itself succeeded.
pub fn with_repeater<R, E>(
    bus: &dyn TunerDelegate,
    f: impl FnOnce(&dyn TunerDelegate) -> Result<R, E>,
) -> Result<R, E>
where
    E: From<TransferError>,
{
    bus.set_i2c_repeater(true)?;
    let result = f(bus);
    let closed = bus.set_i2c_repeater(false);
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), _) => Err(e),
    }
}

// ── Errors ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunerError {
    InvalidParameter(String),
    I2c(TransferError),
    NotInitialized,
    Unsupported(&'static str),
}

impl TunerError {
    /// Signed status code: `-EINVAL`, `-EIO`, `-1`, `-EOPNOTSUPP`.
    pub fn code(&self) -> i32 {
        match self {
            TunerError::InvalidParameter(_) => -22,
            TunerError::I2c(_) => -5,
            TunerError::NotInitialized => -1,
            TunerError::Unsupported(_) => -95,
        }
    }
}

impl fmt::Display for TunerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunerError::InvalidParameter(e) => write!(f, "Invalid tuner parameter: {e}"),
            TunerError::I2c(e) => write!(f, "Tuner I2C error: {e}"),
            TunerError::NotInitialized => write!(f, "Tuner not initialized"),
            TunerError::Unsupported(op) => write!(f, "Tuner operation not supported: {op}"),
        }
    }
}

impl std::error::Error for TunerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TunerError::I2c(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransferError> for TunerError {
    fn from(e: TransferError) -> Self {
        TunerError::I2c(e)
    }
}

pub type Result<T, E = TunerError> = std::result::Result<T, E>;

/// Collapse a tuner result into the `0` / negative status-code contract.
pub fn status_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

// ── Capability ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TunerKind {
    R820T,
    R828D,
}

impl fmt::Display for TunerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunerKind::R820T => write!(f, "Rafael Micro R820T"),
            TunerKind::R828D => write!(f, "Rafael Micro R828D"),
        }
    }
}

/// Gain control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainMode {
    Auto,
    Manual,
}

/// Operations every tuner driver provides.
///
/// The caller is responsible for opening the I2C repeater around each call
/// (see [`with_repeater`]).
pub trait Tuner: fmt::Debug {
    fn kind(&self) -> TunerKind;
    fn i2c_addr(&self) -> u8;

    fn init(&mut self, bus: &dyn TunerDelegate) -> Result<()>;
    fn exit(&mut self, bus: &dyn TunerDelegate) -> Result<()>;
    fn set_frequency(&mut self, bus: &dyn TunerDelegate, freq_hz: u32) -> Result<()>;
    /// Apply a bandwidth; returns the IF frequency the demodulator was set to.
    fn set_bandwidth(&mut self, bus: &dyn TunerDelegate, bandwidth_hz: u32) -> Result<u32>;
    /// Gain in tenths of a dB.
    fn set_gain(&mut self, bus: &dyn TunerDelegate, gain: i32) -> Result<()>;
    fn set_if_gain(&mut self, bus: &dyn TunerDelegate, stage: i32, gain: i32) -> Result<()>;
    fn set_gain_mode(&mut self, bus: &dyn TunerDelegate, mode: GainMode) -> Result<()>;
}

// ── Discovery ──

type Constructor = fn(TunerKind, u8, &dyn TunerDelegate) -> Result<Box<dyn Tuner>>;

/// One probe candidate.
pub struct TunerDescriptor {
    pub kind: TunerKind,
    pub i2c_addr: u8,
    pub check_reg: u8,
    pub check_value: u8,
    pub construct: Constructor,
}

/// Probe order. First match wins.
pub static KNOWN_TUNERS: &[TunerDescriptor] = &[
    TunerDescriptor {
        kind: TunerKind::R820T,
        i2c_addr: r82xx::R820T_I2C_ADDR,
        check_reg: r82xx::CHECK_REG,
        check_value: r82xx::CHECK_VALUE,
        construct: r82xx::R82xx::boxed,
    },
    TunerDescriptor {
        kind: TunerKind::R828D,
        i2c_addr: r82xx::R828D_I2C_ADDR,
        check_reg: r82xx::CHECK_REG,
        check_value: r82xx::CHECK_VALUE,
        construct: r82xx::R82xx::boxed,
    },
];

/// Outcome of probing the bus, before any driver is constructed.
pub fn probe(bus: &dyn TunerDelegate) -> Result<Option<&'static TunerDescriptor>, TransferError> {
    with_repeater(bus, |bus| {
        for candidate in KNOWN_TUNERS {
            // An absent chip NACKs; that is a mismatch, not a fault.
            match bus.i2c_read_reg(candidate.i2c_addr, candidate.check_reg) {
                Ok(v) if v == candidate.check_value => return Ok(Some(candidate)),
                Ok(v) => debug!(
                    "Tuner probe {}: 0x{:02X} at 0x{:02X} (expected 0x{:02X})",
                    candidate.kind, v, candidate.i2c_addr, candidate.check_value
                ),
                Err(e) => debug!("Tuner probe {}: {e}", candidate.kind),
            }
        }
        Ok(None)
    })
}

/// Find the tuner on the bus and construct its driver.
pub fn discover_tuner(bus: &dyn TunerDelegate) -> crate::usb::Result<Box<dyn Tuner>> {
    let Some(found) = probe(bus)? else {
        return Err(crate::usb::DeviceError::TunerNotFound);
    };
    info!("Found {} at I2C 0x{:02X}", found.kind, found.i2c_addr);
    (found.construct)(found.kind, found.i2c_addr, bus).map_err(|e| match e {
        TunerError::I2c(t) => crate::usb::DeviceError::Transfer(t),
        _ => crate::usb::DeviceError::TunerNotFound,
    })
}
