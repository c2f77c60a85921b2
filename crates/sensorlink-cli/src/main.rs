//! Sensorlink command line interface
//!
//! Queries and controls a wearable biosensor device over its serial link.
//!
//! Usage:
//!   sensorlink [OPTIONS] COMMAND
//!
//! Commands:
//!   --get ATTR            Read one attribute (see list below)
//!   --get-all             Read every known attribute
//!   --set-time            Set the device clock to the host clock
//!   --list-files          List files stored on the device
//!   --download-file NAME  Download a file to a temporary path
//!   --list-ports          List candidate serial ports and exit
//!
//! Options:
//!   --port PORT           Serial port or tcp://host:port (default: autodetect)
//!   --baud RATE           Baud rate (default: 115200)
//!   --timeout MS          Response timeout in ms (default: 30000)
//!   --log-level LEVEL     trace|debug|info|warn|error (default: warn)
//!
//! Attributes: serialno, firmware, ble_mac, model, vendor, time, battery,
//! hr, chargestate, temperature

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use sensorlink_core::helpers::SendHelper;
use sensorlink_core::prelude::*;
use sensorlink_core::protocol::serial;

const ATTRIBUTES: &[&str] = &[
    "serialno",
    "firmware",
    "ble_mac",
    "model",
    "vendor",
    "time",
    "battery",
    "hr",
    "chargestate",
    "temperature",
];

enum Command {
    Get(String),
    GetAll,
    SetTime,
    ListFiles,
    DownloadFile(String),
    ListPorts,
}

struct Args {
    port: Option<String>,
    baud: u32,
    timeout_ms: u64,
    log_level: String,
    command: Command,
}

fn parse_args() -> Result<Args> {
    let argv: Vec<String> = std::env::args().skip(1).collect();

    let mut port = None;
    let mut baud = 115_200u32;
    let mut timeout_ms = 30_000u64;
    let mut log_level = "warn".to_string();
    let mut command = None;

    let take_value = |i: &mut usize| -> Result<String> {
        *i += 1;
        argv.get(*i)
            .cloned()
            .with_context(|| format!("{} needs a value", argv[*i - 1]))
    };

    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "--port" | "-p" => port = Some(take_value(&mut i)?),
            "--baud" | "-b" => {
                let value = take_value(&mut i)?;
                baud = value.parse().with_context(|| format!("bad baud rate: {value}"))?;
            }
            "--timeout" | "-t" => {
                let value = take_value(&mut i)?;
                timeout_ms = value.parse().with_context(|| format!("bad timeout: {value}"))?;
            }
            "--log-level" => log_level = take_value(&mut i)?,
            "--get" => command = Some(Command::Get(take_value(&mut i)?)),
            "--get-all" => command = Some(Command::GetAll),
            "--set-time" => command = Some(Command::SetTime),
            "--list-files" => command = Some(Command::ListFiles),
            "--download-file" => command = Some(Command::DownloadFile(take_value(&mut i)?)),
            "--list-ports" => command = Some(Command::ListPorts),
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other} (try --help)"),
        }
        i += 1;
    }

    let command = command.context("no command given (try --help)")?;
    Ok(Args {
        port,
        baud,
        timeout_ms,
        log_level,
        command,
    })
}

fn print_help() {
    println!("sensorlink - biosensor device CLI");
    println!();
    println!("Usage: sensorlink [OPTIONS] COMMAND");
    println!();
    println!("Commands:");
    println!("  --get ATTR            Read one attribute");
    println!("  --get-all             Read every known attribute");
    println!("  --set-time            Set the device clock to the host clock");
    println!("  --list-files          List files stored on the device");
    println!("  --download-file NAME  Download a file to a temporary path");
    println!("  --list-ports          List candidate serial ports and exit");
    println!();
    println!("Options:");
    println!("  --port PORT           Serial port or tcp://host:port (default: autodetect)");
    println!("  --baud RATE           Baud rate (default: 115200)");
    println!("  --timeout MS          Response timeout in ms (default: 30000)");
    println!("  --log-level LEVEL     trace|debug|info|warn|error (default: warn)");
    println!();
    println!("Attributes: {}", ATTRIBUTES.join(", "));
}

fn main() -> Result<()> {
    let args = parse_args()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    if let Command::ListPorts = args.command {
        for port in serial::list_ports() {
            println!(
                "{}  {} {}",
                port.name,
                port.manufacturer.as_deref().unwrap_or("-"),
                port.product.as_deref().unwrap_or("-"),
            );
        }
        return Ok(());
    }

    let address = match args.port {
        Some(port) => port,
        None => serial::find_device_port().context("no answering device found")?,
    };
    tracing::info!(%address, "using device address");

    let config = CommConfig {
        address,
        baud_rate: args.baud,
        default_timeout_ms: args.timeout_ms,
        ..CommConfig::default()
    };
    let comm = Communicator::new(config);
    comm.connect().context("could not connect to device")?;

    let helper = SendHelper::new(&comm, Duration::from_millis(args.timeout_ms));
    let result = run_command(&comm, &helper, &args.command);
    comm.shutdown();
    result
}

fn run_command(comm: &Communicator, helper: &SendHelper, command: &Command) -> Result<()> {
    match command {
        Command::Get(name) => println!("{}", read_attribute(helper, name)?),
        Command::GetAll => {
            for name in ATTRIBUTES {
                match read_attribute(helper, name) {
                    Ok(value) => println!("{name}: {value}"),
                    Err(e) => println!("{name}: <error: {e}>"),
                }
            }
        }
        Command::SetTime => {
            let accepted = helper.set_current_time_now()?;
            println!("set time accepted: {accepted}");
            println!("device time now: {}", helper.get_current_time()?);
        }
        Command::ListFiles => {
            let entries = helper.list_files()?;
            if entries.is_empty() {
                println!("[]");
            }
            for entry in entries {
                println!("{} ({} KiB)", entry.name, entry.size / 1024);
            }
        }
        Command::DownloadFile(name) => download_file(comm, helper, name)?,
        Command::ListPorts => unreachable!("handled before connecting"),
    }
    Ok(())
}

fn read_attribute(helper: &SendHelper, name: &str) -> Result<String> {
    let value = match name {
        "serialno" => format!("{:016X}", helper.get_serial_no()?),
        "firmware" => helper.get_firmware_version()?,
        "ble_mac" => helper.get_bluetooth_mac()?,
        "model" => helper.get_model()?,
        "vendor" => helper.get_vendor()?,
        "time" => helper.get_current_time()?.to_rfc3339(),
        "battery" => format!("{}%", helper.get_battery_level()?),
        "hr" => format!("{} bpm", helper.get_heart_rate()?),
        "chargestate" => helper.get_charge_state()?.to_string(),
        "temperature" => format!("{:.2} °C", helper.get_temperature()?),
        other => bail!("unknown attribute: {other} (known: {})", ATTRIBUTES.join(", ")),
    };
    Ok(value)
}

struct PrintProgress;

impl FileDownloadListener for PrintProgress {
    fn on_progress(&self, file: &str, _size: u64, percent: u32, kibps: f64) {
        println!("{file}: {percent}% ({kibps:.1} KiB/s)");
    }

    fn on_complete(&self, file: &str, path: &Path, kibps: f64) {
        println!("{file} downloaded to {} ({kibps:.1} KiB/s)", path.display());
    }

    fn on_failed(&self, file: &str, reason: &str) {
        eprintln!("{file} download failed: {reason}");
    }
}

fn download_file(comm: &Communicator, helper: &SendHelper, name: &str) -> Result<()> {
    let entries = helper.list_files()?;
    let entry = entries
        .iter()
        .find(|e| e.name == *name)
        .with_context(|| format!("no such file on device: {name}"))?;

    comm.download_file(
        name,
        u64::from(entry.size),
        Some(Arc::new(PrintProgress)),
        Duration::from_secs(300),
    )?;
    Ok(())
}
