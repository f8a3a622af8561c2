//! Application configuration: TOML-based, platform-aware paths.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::baseband::{DEFAULT_FIR, FIR_LEN, FirCoefficients};
use crate::protocol::{CTRL_TIMEOUT_MS, DEFAULT_RTL_XTAL_HZ};
use crate::session::SessionConfig;

/// Header comment prepended to saved config files.
const CONFIG_HEADER: &str =
    "# rtlprobe configuration\n\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Demodulator reference crystal in Hz. Default: 28.8 MHz.
    #[serde(default = "default_rtl_xtal_hz")]
    pub rtl_xtal_hz: u32,

    /// Timeout for each USB control transfer, in milliseconds.
    #[serde(default = "default_usb_timeout_ms")]
    pub usb_timeout_ms: u64,

    /// Baseband FIR coefficients: 8 in -128..=127 then 8 in -2048..=2047.
    #[serde(default = "default_fir")]
    pub fir: Vec<i32>,

    /// Preferred dongle serial number. Empty = every known dongle.
    #[serde(default)]
    pub device_serial: String,
}

fn default_rtl_xtal_hz() -> u32 {
    DEFAULT_RTL_XTAL_HZ
}
fn default_usb_timeout_ms() -> u64 {
    CTRL_TIMEOUT_MS
}
fn default_fir() -> Vec<i32> {
    DEFAULT_FIR.to_vec()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rtl_xtal_hz: default_rtl_xtal_hz(),
            usb_timeout_ms: default_usb_timeout_ms(),
            fir: default_fir(),
            device_serial: String::new(),
        }
    }
}

/// Validation errors that [`Config::validate`] can return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    ZeroCrystal,
    ZeroTimeout,
    /// `fir` does not hold exactly 16 values.
    FirLength(usize),
    FirOutOfRange { index: usize, value: i32 },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::ZeroCrystal => write!(f, "rtl_xtal_hz must be non-zero"),
            ValidationError::ZeroTimeout => write!(f, "usb_timeout_ms must be non-zero"),
            ValidationError::FirLength(n) => {
                write!(f, "fir must have {FIR_LEN} coefficients, got {n}")
            }
            ValidationError::FirOutOfRange { index, value } => {
                let range = if *index < 8 { "-128..=127" } else { "-2048..=2047" };
                write!(f, "fir[{index}] = {value} is outside {range}")
            }
        }
    }
}

impl Config {
    /// Platform-specific config directory.
    pub fn dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("rtlprobe"))
    }

    /// Full path to config file.
    pub fn path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("config.toml"))
    }

    /// Save config to an arbitrary path atomically (write to temp file, then rename).
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let serialized = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        let contents = format!("{CONFIG_HEADER}{serialized}");
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, &contents)?;
        match std::fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Rename can fail across filesystems; fall back to direct write + cleanup
                let result = std::fs::write(path, &contents);
                let _ = std::fs::remove_file(&tmp);
                result
            }
        }
    }

    /// Load config from an arbitrary path, returning the config and any parse warnings.
    ///
    /// Returns `(defaults, [])` if the file doesn't exist.
    /// Returns `(defaults, [warning])` if the file exists but can't be parsed.
    pub fn load_from(path: &Path) -> (Self, Vec<String>) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, vec![]),
                Err(e) => {
                    let warning = format!(
                        "config parse error ({}), using defaults: {e}",
                        path.display()
                    );
                    (Self::default(), vec![warning])
                }
            },
            Err(_) => (Self::default(), vec![]),
        }
    }

    /// Load config from the default path, returning the config and any parse warnings.
    pub fn load_with_warnings() -> (Self, Vec<String>) {
        let Some(path) = Self::path() else {
            return (Self::default(), vec![]);
        };
        Self::load_from(&path)
    }

    /// Validate the entire config, collecting all errors.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.rtl_xtal_hz == 0 {
            errors.push(ValidationError::ZeroCrystal);
        }
        if self.usb_timeout_ms == 0 {
            errors.push(ValidationError::ZeroTimeout);
        }

        if self.fir.len() != FIR_LEN {
            errors.push(ValidationError::FirLength(self.fir.len()));
        } else {
            for (index, &value) in self.fir.iter().enumerate() {
                let limit = if index < 8 { 128 } else { 2048 };
                if !(-limit..limit).contains(&value) {
                    errors.push(ValidationError::FirOutOfRange { index, value });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Build session settings, rejecting an unusable FIR set.
    pub fn session_config(&self) -> crate::error::Result<SessionConfig> {
        if self.rtl_xtal_hz == 0 {
            return Err(crate::RtlprobeError::Config(
                ValidationError::ZeroCrystal.to_string(),
            ));
        }
        Ok(SessionConfig {
            rtl_xtal_hz: self.rtl_xtal_hz,
            fir: FirCoefficients::from_slice(&self.fir)?,
        })
    }
}
