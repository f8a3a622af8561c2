//! `devices` subcommand: list attached USB devices.

use std::path::Path;

use super::{DeviceJson, DevicesOutput, Result, UsbTransport, load_config, print_json, transport};

pub(super) fn cmd_devices(json: bool, all: bool, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path);
    let transport = transport(&config);

    let mut devices = Vec::new();
    for id in transport.list_devices()? {
        match transport.identify(&id) {
            Ok(identity) => devices.push(DeviceJson::new(identity)),
            // unplugged between enumeration and the descriptor read
            Err(e) => log::debug!("{id}: {e}"),
        }
    }
    if !all {
        devices.retain(|d| d.known);
    }

    if json {
        return print_json(&DevicesOutput {
            count: devices.len(),
            devices,
        });
    }

    let noun = if all { "USB device" } else { "RTL2832U dongle" };
    if devices.is_empty() {
        println!("No {noun}s found.");
        return Ok(());
    }

    println!(
        "Found {} {noun}{}:",
        devices.len(),
        if devices.len() == 1 { "" } else { "s" }
    );
    println!();

    for (i, dev) in devices.iter().enumerate() {
        let id = &dev.identity;
        let marker = if dev.known { "*" } else { " " };
        println!(
            "  [{}]{marker}{}  {}  {} {}",
            i + 1,
            id.registry_id,
            dev.usb_id,
            id.vendor_name,
            id.product_name
        );
        if let Some(name) = dev.known_name {
            println!("       Known as: {name}");
        }
        if !id.serial.is_empty() {
            println!("       Serial:   {}", id.serial);
        }
    }
    if all {
        println!();
        println!("  * supported RTL2832U dongle");
    }

    Ok(())
}
