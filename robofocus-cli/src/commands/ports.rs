//! Port listing and discovery command implementations.

use {
    super::print_json,
    crate::{Cli, config::Config},
    anyhow::Result,
    console::style,
    robofocus::device,
    serde_json::json,
    std::time::Duration,
};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(cli: &Cli, config: &Config, all: bool) -> Result<()> {
    let ports = device::list_available_ports(all || config.serial.include_bluetooth)?;

    if cli.json {
        return print_json(json!({ "ports": ports }));
    }

    eprintln!("{}", style("Serial ports").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }
    for line in device::format_port_list(&ports) {
        println!("{line}");
    }
    Ok(())
}

/// Scan command implementation: handshake every port.
pub(crate) fn cmd_scan(cli: &Cli, config: &Config, all: bool) -> Result<()> {
    let timeout = Duration::from_secs_f64(config.serial.scan_timeout_secs.max(0.1));
    let found =
        device::scan_for_devices(timeout, &[], all || config.serial.include_bluetooth)?;

    if cli.json {
        return print_json(json!({ "devices": found }));
    }

    if found.is_empty() {
        if !cli.quiet {
            eprintln!(
                "{} No RoboFocus answered on any serial port",
                style("⚠").yellow()
            );
        }
        return Ok(());
    }
    for device in &found {
        println!("{}\tfirmware {}", device.port, device.firmware_version);
    }
    Ok(())
}
