//! Command implementations.
//!
//! Each group of subcommands lives in its own module; this module holds the
//! pieces they share: opening a connected controller and printing results.

pub(crate) mod completions;
pub(crate) mod focuser;
pub(crate) mod ports;

use {
    crate::{
        Cli, CliError,
        config::{Config, TomlSettingsStore},
        serial::{SerialOptions, select_serial_port},
    },
    anyhow::{Context, Result},
    log::debug,
    robofocus::{
        EngineConfig, FocuserController, FocuserEngine, HardwareEngine, RetryPolicy,
        SimulatorEngine,
    },
    serde_json::{Value, json},
    std::{sync::Arc, time::Duration},
};

/// Per-command response timeout from the CLI or config.
fn response_timeout(cli: &Cli, config: &Config) -> Result<Duration> {
    let secs = cli.timeout.unwrap_or(config.serial.timeout_secs);
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| {
            CliError::Usage(format!(
                "timeout must be a positive number of seconds, got {secs}"
            ))
            .into()
        })
}

/// Build the engine selected by `--simulator` or the config.
fn build_engine(cli: &Cli, config: &Config) -> Result<Arc<dyn FocuserEngine>> {
    let timeout = response_timeout(cli, config)?;

    if cli.simulator || config.simulator.enabled {
        debug!("Using simulator engine");
        let engine = SimulatorEngine::new(config.simulator.engine_config(RetryPolicy::default()));
        return Ok(Arc::new(engine));
    }

    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };
    let port = select_serial_port(&options, config)?;
    Ok(Arc::new(HardwareEngine::new(
        EngineConfig::new(port).with_timeout(timeout),
    )))
}

/// Open a connected controller backed by the persisted settings.
pub(crate) fn open_controller(cli: &Cli, config: &Config) -> Result<FocuserController> {
    let engine = build_engine(cli, config)?;
    let path = cli
        .settings
        .clone()
        .unwrap_or_else(Config::default_settings_path);
    debug!("Focuser settings at {}", path.display());
    let store = Arc::new(TomlSettingsStore::new(path, config.focuser.clone()));

    let controller = FocuserController::new(engine, store)?;
    let port = controller.engine().port_name();
    controller
        .connect()
        .with_context(|| format!("Failed to connect to {port}"))?;
    Ok(controller)
}

/// Print `data` inside the JSON success envelope.
pub(crate) fn print_json(data: Value) -> Result<()> {
    let output = json!({
        "ok": true,
        "data": data,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Print a result either as JSON or as a plain line on stdout.
pub(crate) fn report(cli: &Cli, data: Value, text: impl std::fmt::Display) -> Result<()> {
    if cli.json {
        print_json(data)
    } else {
        println!("{text}");
        Ok(())
    }
}
