//! Rig probe
//!
//! Lists serial ports, connects to a configured board and asks which sketch
//! it is running.
//!
//! Usage:
//!   cargo run --example rig_probe -- [OPTIONS]
//!
//! Options:
//!   --config PATH     Rig configuration (default: rig.json)
//!   --board KEY       Board key (default: board1)
//!   --port KEY        Port key (default: port1)
//!   --list            Only list serial ports
//!
//! Set RUST_LOG=debug to see every command and reply.

use anyhow::Context;
use rigbridge_core::config::RigConfig;
use rigbridge_core::protocol::{list_ports, DeviceSession};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config_path = "rig.json".to_string();
    let mut board_key = "board1".to_string();
    let mut port_key = "port1".to_string();
    let mut list_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = args[i].clone();
                }
            }
            "--board" | "-b" => {
                i += 1;
                if i < args.len() {
                    board_key = args[i].clone();
                }
            }
            "--port" | "-p" => {
                i += 1;
                if i < args.len() {
                    port_key = args[i].clone();
                }
            }
            "--list" | "-l" => list_only = true,
            other => eprintln!("ignoring unknown argument {}", other),
        }
        i += 1;
    }

    println!("Serial ports:");
    for port in list_ports() {
        match port.usb_id {
            Some((vid, pid)) => println!("  {} [{:04x}:{:04x}]", port.name, vid, pid),
            None => println!("  {}", port.name),
        }
    }
    if list_only {
        return Ok(());
    }

    let config = RigConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path))?;
    let mut device = DeviceSession::open(&config, &board_key, &port_key)
        .with_context(|| format!("opening {}/{}", board_key, port_key))?;

    match device.request_protocol_name() {
        Some(name) => println!("{} on {} runs '{}'", device.board(), device.port_name(), name),
        None => println!("{} on {} did not answer", device.board(), device.port_name()),
    }
    Ok(())
}
