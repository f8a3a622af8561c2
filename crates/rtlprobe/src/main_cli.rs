//! rtlprobe CLI: find RTL2832U dongles and bring them up.

use std::path::PathBuf;

use clap::Parser;

mod cli;

#[derive(Parser)]
#[command(
    name = "rtlprobe-cli",
    version,
    about = "Probe and bring up RTL2832U software-defined-radio dongles"
)]
struct Args {
    /// Output as JSON (for devices, probe, config)
    #[arg(long, global = true)]
    json: bool,

    /// Use this config file instead of the platform default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log bring-up steps (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: cli::Command,
}

fn main() {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .format_target(false)
        .init();

    if let Err(e) = cli::run(args.command, args.json, args.config.as_deref()) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
