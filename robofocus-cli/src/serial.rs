//! Serial port resolution.
//!
//! A port is taken, in order, from:
//! - the `--port` argument (or `ROBOFOCUS_PORT`)
//! - the `[serial] port` config key
//! - a handshake scan of every serial port
//!
//! A scan that finds several focusers prompts for one when a terminal is
//! attached and is a usage error otherwise.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    robofocus::{DiscoveredDevice, device},
    std::{cmp::Ordering, io::IsTerminal, time::Duration},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if several focusers answer).
    pub non_interactive: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Resolve the port to connect to.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<String> {
    if let Some(port_name) = &options.port {
        return Ok(port_name.clone());
    }

    if let Some(port_name) = &config.serial.port {
        debug!("Using port from config: {port_name}");
        return Ok(port_name.clone());
    }

    let found = device::scan_for_devices(
        Duration::from_secs_f64(config.serial.scan_timeout_secs),
        &[],
        config.serial.include_bluetooth,
    )?;
    choose_device(found, options.non_interactive)
}

/// Pick one focuser out of a scan result.
fn choose_device(found: Vec<DiscoveredDevice>, non_interactive: bool) -> Result<String> {
    match found.len().cmp(&1) {
        Ordering::Less => Err(usage_err(
            "no RoboFocus answered on any serial port; pass --port or use --simulator",
        )),
        Ordering::Equal => {
            let device = found
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("scan result vanished"))?;
            info!(
                "Auto-selected port: {} (firmware {})",
                device.port, device.firmware_version
            );
            Ok(device.port)
        },
        Ordering::Greater if non_interactive => Err(usage_err(
            "several RoboFocus devices found; pass --port to choose one",
        )),
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_device_interactive(found)
        },
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "several RoboFocus devices found and no terminal to ask on; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("port selection cancelled".to_string()).into()
            } else {
                CliError::Usage(format!("port prompt failed: {io_err}")).into()
            }
        },
    }
}

/// Label shown for one device in the selection list.
fn device_label(device: &DiscoveredDevice) -> String {
    let mut label = format!(
        "{} [firmware {}]",
        style(&device.port).bold(),
        style(&device.firmware_version).yellow()
    );
    if !device.description.is_empty() {
        label.push_str(&format!(" - {}", style(&device.description).dim()));
    }
    label
}

fn select_device_interactive(found: Vec<DiscoveredDevice>) -> Result<String> {
    eprintln!(
        "{} Found {} RoboFocus devices",
        style("ℹ").blue(),
        found.len()
    );

    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = found
        .iter()
        .map(|d| console::truncate_str(&device_label(d), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select focuser")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => found
            .into_iter()
            .nth(index)
            .map(|d| d.port)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("port selection cancelled".to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use console::measure_text_width;

    fn device(port: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            port: port.to_string(),
            firmware_version: "002100".to_string(),
            description: "USB serial".to_string(),
        }
    }

    fn assert_usage(result: Result<String>) {
        let err = result.expect_err("expected error");
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_explicit_port_wins_over_config() {
        let mut config = Config::default();
        config.serial.port = Some("/dev/ttyS1".to_string());
        let options = SerialOptions {
            port: Some("/dev/ttyUSB0".to_string()),
            non_interactive: true,
        };
        assert_eq!(select_serial_port(&options, &config).unwrap(), "/dev/ttyUSB0");
    }

    #[test]
    fn test_config_port_used_without_scan() {
        let mut config = Config::default();
        config.serial.port = Some("COM3".to_string());
        let options = SerialOptions::default();
        assert_eq!(select_serial_port(&options, &config).unwrap(), "COM3");
    }

    #[test]
    fn test_single_device_is_auto_selected() {
        let port = choose_device(vec![device("/dev/ttyUSB0")], true).unwrap();
        assert_eq!(port, "/dev/ttyUSB0");
    }

    #[test]
    fn test_no_device_is_usage_error() {
        assert_usage(choose_device(vec![], false));
    }

    #[test]
    fn test_several_devices_non_interactive_is_usage_error() {
        assert_usage(choose_device(
            vec![device("/dev/ttyUSB0"), device("/dev/ttyUSB1")],
            true,
        ));
    }

    #[test]
    fn test_device_label_mentions_firmware() {
        console::set_colors_enabled(false);
        let label = device_label(&device("COM4"));
        assert_eq!(label, "COM4 [firmware 002100] - USB serial");
        assert_eq!(measure_text_width(&label), label.len());
    }
}
