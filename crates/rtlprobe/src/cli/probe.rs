//! `probe` subcommand: bring up each supported dongle and report what was found.

use std::path::Path;
use std::sync::Arc;

use rtlprobe_lib::registry::{self, DeviceRegistry};

use super::{
    DeviceJson, ProbeJson, ProbeOutput, Result, UsbTransport, known_devices, kv, kv_indent,
    kv_width, load_config, print_json, transport,
};

pub(super) fn cmd_probe(
    json: bool,
    serial: Option<String>,
    bandwidth: Option<u32>,
    config_path: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path);
    let session_config = config.session_config()?;
    let serial = serial.unwrap_or_else(|| config.device_serial.clone());

    let transport = Arc::new(transport(&config));
    let mut registry = DeviceRegistry::new(Arc::clone(&transport), session_config);

    let mut results = Vec::new();
    for id in transport.list_devices()? {
        let Ok(identity) = transport.identify(&id) else {
            continue;
        };
        if !known_devices::is_known_device(identity.vendor_id, identity.product_id) {
            continue;
        }
        if !serial.is_empty() && identity.serial != serial {
            log::debug!("{id}: serial {} does not match {serial}", identity.serial);
            continue;
        }

        let mut entry = ProbeJson {
            device: DeviceJson::new(identity),
            state: None,
            interface: None,
            endpoint: None,
            tuner: None,
            if_hz: None,
            error: None,
        };
        match registry.resolve_device(&id) {
            Ok(resolution) => {
                let mut session = registry::lock(resolution.session());
                if let Some(bw) = bandwidth {
                    match session.set_tuner_bandwidth(bw) {
                        Ok(if_hz) => entry.if_hz = Some(if_hz),
                        Err(e) => entry.error = Some(e.to_string()),
                    }
                }
                entry.state = Some(session.state().to_string());
                entry.interface = session.interface_number();
                entry.endpoint = session.endpoint().map(|ep| format!("0x{:02X}", ep.address()));
                entry.tuner = session.tuner_kind().map(|k| k.to_string());
            }
            Err(e) => entry.error = Some(e.to_string()),
        }
        results.push(entry);
    }
    registry.shutdown();

    let ready = results.iter().filter(|r| r.tuner.is_some()).count();
    if json {
        return print_json(&ProbeOutput {
            count: results.len(),
            ready,
            devices: results,
        });
    }

    if results.is_empty() {
        println!("No RTL2832U dongles found.");
        return Ok(());
    }

    let w = kv_width(
        &["Device:"],
        &["USB ID:", "Serial:", "State:", "Interface:", "Endpoint:", "Tuner:", "IF:", "Error:"],
    );
    for (i, r) in results.iter().enumerate() {
        if i > 0 {
            println!();
        }
        let id = &r.device.identity;
        kv("Device:", &id.registry_id, w);
        kv_indent(
            "USB ID:",
            format_args!("{} ({})", r.device.usb_id, r.device.known_name.unwrap_or("?")),
            w,
        );
        if !id.serial.is_empty() {
            kv_indent("Serial:", &id.serial, w);
        }
        if let Some(state) = &r.state {
            kv_indent("State:", state, w);
        }
        if let Some(n) = r.interface {
            kv_indent("Interface:", n, w);
        }
        if let Some(ep) = &r.endpoint {
            kv_indent("Endpoint:", format_args!("{ep} (bulk IN)"), w);
        }
        if let Some(tuner) = &r.tuner {
            kv_indent("Tuner:", tuner, w);
        }
        if let Some(if_hz) = r.if_hz {
            kv_indent("IF:", format_args!("{if_hz} Hz"), w);
        }
        if let Some(err) = &r.error {
            kv_indent("Error:", err, w);
        }
    }
    Ok(())
}
