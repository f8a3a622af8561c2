//! rtlprobe: control plane for RTL2832U-based SDR dongles.
//!
//! Discovers dongles, brings up the demodulator, finds the tuner behind the
//! I2C repeater and hands back a ready [`session::DeviceSession`].

pub mod baseband;
pub mod config;
pub mod error;
pub mod known_devices;
pub mod protocol;
pub mod register;
pub mod registry;
pub mod session;
pub mod tuner;
pub mod usb;

pub use error::RtlprobeError;
pub use registry::{DeviceRegistry, Resolution};
pub use session::{DeviceSession, SessionConfig, SessionState};
