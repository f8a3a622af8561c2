//! CLI subcommands.

mod config_cmd;
mod devices;
mod probe;

use std::path::Path;

use clap::Subcommand;
use serde::Serialize;

pub(super) use rtlprobe_lib::config::Config;
pub(super) use rtlprobe_lib::error::Result;
pub(super) use rtlprobe_lib::known_devices;
pub(super) use rtlprobe_lib::usb::{DeviceIdentity, PlatformTransport, UsbTransport};

const PADDING: usize = 2;

/// Compute alignment width for a command's key-value output.
/// Ensures at least PADDING spaces after the longest key in either level,
/// with top-level and indent values aligned to the same column.
pub(super) fn kv_width(top: &[&str], indent: &[&str]) -> usize {
    let top_max = top.iter().map(|k| k.len()).max().unwrap_or(0);
    let indent_max = indent.iter().map(|k| k.len()).max().unwrap_or(0);
    let top_need = if top.is_empty() { 0 } else { top_max + PADDING };
    // Indent keys lose 2 chars of inner width to the "  " prefix
    let indent_need = if indent.is_empty() {
        0
    } else {
        indent_max + PADDING + 2
    };
    top_need.max(indent_need)
}

pub(super) fn format_kv(key: &str, value: impl std::fmt::Display, w: usize) -> String {
    format!("{key:<width$}{value}", width = w)
}

pub(super) fn kv(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("{}", format_kv(key, value, w));
}

pub(super) fn kv_indent(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("  {key:<width$}{value}", width = w - 2);
}

pub(super) fn print_json(value: &impl Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    println!("{text}");
    Ok(())
}

/// Load config from `custom_path` or the platform default, logging parse warnings.
pub(super) fn load_config(custom_path: Option<&Path>) -> Config {
    let (config, warnings) = match custom_path {
        Some(p) => Config::load_from(p),
        None => Config::load_with_warnings(),
    };
    for w in &warnings {
        log::warn!("{w}");
    }
    config
}

pub(super) fn transport(config: &Config) -> PlatformTransport {
    PlatformTransport::new(config.usb_timeout_ms)
}

// ── JSON output structs ──

#[derive(Serialize)]
pub(super) struct DeviceJson {
    #[serde(flatten)]
    pub identity: DeviceIdentity,
    pub usb_id: String,
    pub known: bool,
    pub known_name: Option<&'static str>,
}

impl DeviceJson {
    pub fn new(identity: DeviceIdentity) -> Self {
        let known = known_devices::lookup(identity.vendor_id, identity.product_id);
        DeviceJson {
            usb_id: identity.usb_id(),
            known: known.is_some(),
            known_name: known.map(|k| k.name),
            identity,
        }
    }
}

#[derive(Serialize)]
pub(super) struct DevicesOutput {
    pub count: usize,
    pub devices: Vec<DeviceJson>,
}

#[derive(Serialize)]
pub(super) struct ProbeJson {
    pub device: DeviceJson,
    pub state: Option<String>,
    pub interface: Option<u8>,
    pub endpoint: Option<String>,
    pub tuner: Option<String>,
    pub if_hz: Option<u32>,
    pub error: Option<String>,
}

#[derive(Serialize)]
pub(super) struct ProbeOutput {
    pub count: usize,
    pub ready: usize,
    pub devices: Vec<ProbeJson>,
}

#[derive(Serialize)]
pub(super) struct ConfigOutput {
    pub config_file: Option<String>,
    pub config_file_exists: bool,
    pub settings: Config,
    pub problems: Vec<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// List attached USB devices and flag supported RTL2832U dongles
    Devices {
        /// Show every USB device, not just supported ones
        #[arg(long)]
        all: bool,
    },

    /// Probe every supported dongle: bring up the demodulator and find the tuner
    Probe {
        /// Only probe the dongle with this serial number (overrides config)
        #[arg(long)]
        serial: Option<String>,
        /// Program this IF filter bandwidth (Hz) once the tuner is up
        #[arg(long)]
        bandwidth: Option<u32>,
    },

    /// Show current configuration and file paths
    Config {
        /// Write a default config file if none exists yet
        #[arg(long)]
        init: bool,
    },
}

pub fn run(cmd: Command, json: bool, config_path: Option<&Path>) -> Result<()> {
    match cmd {
        Command::Devices { all } => devices::cmd_devices(json, all, config_path),
        Command::Probe { serial, bandwidth } => {
            probe::cmd_probe(json, serial, bandwidth, config_path)
        }
        Command::Config { init } => config_cmd::cmd_config(json, init, config_path),
    }
}
