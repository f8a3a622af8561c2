//! `config` subcommand: show current configuration and file paths.

use std::path::Path;

use super::{Config, ConfigOutput, Result, kv, kv_indent, kv_width, load_config, print_json};

pub(super) fn cmd_config(json: bool, init: bool, custom_path: Option<&Path>) -> Result<()> {
    let config_path = custom_path.map(|p| p.to_path_buf()).or_else(Config::path);
    if init {
        match &config_path {
            Some(p) if !p.exists() => {
                Config::default().save_to(p)?;
                log::info!("Wrote default config to {}", p.display());
            }
            Some(p) => log::info!("{} already exists, left untouched", p.display()),
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "No config directory",
                )
                .into());
            }
        }
    }
    let config = load_config(custom_path);
    let config_exists = config_path.as_ref().is_some_and(|p| p.exists());
    let problems: Vec<String> = match config.validate() {
        Ok(()) => vec![],
        Err(errors) => errors.iter().map(ToString::to_string).collect(),
    };

    if json {
        return print_json(&ConfigOutput {
            config_file: config_path.as_ref().map(|p| p.display().to_string()),
            config_file_exists: config_exists,
            settings: config,
            problems,
        });
    }

    // Human-readable output
    let w = kv_width(
        &["Config file:"],
        &["rtl_xtal_hz:", "usb_timeout_ms:", "fir:", "device_serial:"],
    );

    match &config_path {
        Some(p) => {
            if config_exists {
                kv("Config file:", format_args!("{} (loaded)", p.display()), w);
            } else {
                kv(
                    "Config file:",
                    format_args!("{} (not found, using defaults)", p.display()),
                    w,
                );
            }
        }
        None => kv("Config file:", "(no config directory)", w),
    }
    println!();

    println!("Settings:");
    kv_indent("rtl_xtal_hz:", config.rtl_xtal_hz, w);
    kv_indent("usb_timeout_ms:", config.usb_timeout_ms, w);
    let fir: Vec<String> = config.fir.iter().map(ToString::to_string).collect();
    kv_indent("fir:", fir.join(", "), w);
    let serial = if config.device_serial.is_empty() {
        "(any)"
    } else {
        config.device_serial.as_str()
    };
    kv_indent("device_serial:", serial, w);

    if !problems.is_empty() {
        println!();
        println!("Problems:");
        for p in &problems {
            println!("  {p}");
        }
    }
    Ok(())
}
