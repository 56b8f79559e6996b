//! Focuser command implementations.

use {
    super::{open_controller, report},
    crate::{Cli, CliError, config::Config, use_fancy_output},
    anyhow::Result,
    console::style,
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    log::{debug, warn},
    robofocus::FocuserController,
    serde_json::json,
    std::{
        sync::atomic::{AtomicBool, Ordering},
        thread,
        time::Duration,
    },
};

/// Set by the Ctrl+C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        warn!("Could not install Ctrl+C handler: {e}");
    }
}

fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config) -> Result<()> {
    let controller = open_controller(cli, config)?;
    let engine = controller.engine();
    let position = controller.get_position()?;
    let backlash = controller.get_backlash()?;
    let max_travel = controller.get_max_travel()?;
    let temperature = controller
        .get_temperature()
        .map_err(|e| warn!("Temperature unavailable: {e}"))
        .ok();
    let settings = controller.settings();

    if cli.json {
        return super::print_json(json!({
            "port": engine.port_name(),
            "firmware_version": controller.firmware_version(),
            "position": position,
            "temperature_celsius": temperature,
            "backlash": backlash,
            "max_travel": max_travel,
            "zero_offset": settings.zero_offset,
            "min_step": settings.min_step,
            "max_increment": settings.max_increment,
        }));
    }

    let firmware = controller.firmware_version().unwrap_or_else(|| "?".into());
    let temperature = temperature.map_or_else(|| "n/a".to_string(), |t| format!("{t:.1} °C"));
    println!("{}", style("RoboFocus").bold().underlined());
    println!("  Port:          {}", engine.port_name());
    println!("  Firmware:      {firmware}");
    println!("  Position:      {position}");
    println!("  Temperature:   {temperature}");
    println!("  Backlash:      {}", describe_backlash(backlash));
    println!("  Max travel:    {max_travel}");
    println!("  Zero offset:   {}", settings.zero_offset);
    println!(
        "  Move range:    [{}, {}], at most {} per move",
        settings.min_step,
        settings.logical_max(),
        settings.max_increment
    );
    Ok(())
}

fn describe_backlash(value: i32) -> String {
    match value {
        0 => "off".to_string(),
        v if v > 0 => format!("{v} steps on OUT motion"),
        v => format!("{} steps on IN motion", v.unsigned_abs()),
    }
}

/// Position command implementation.
pub(crate) fn cmd_position(cli: &Cli, config: &Config) -> Result<()> {
    let controller = open_controller(cli, config)?;
    let position = controller.get_position()?;
    report(cli, json!({ "position": position }), position)
}

/// Move command implementation.
pub(crate) fn cmd_move(cli: &Cli, config: &Config, target: i32, no_wait: bool) -> Result<()> {
    let controller = open_controller(cli, config)?;
    let start = controller.get_position()?;
    install_interrupt_handler();

    controller.move_to(target)?;
    if no_wait {
        return report(
            cli,
            json!({ "target": target, "moving": true }),
            format!("Moving to {target}"),
        );
    }

    let position = wait_for_move(cli, &controller, start, target)?;
    report(cli, json!({ "position": position }), position)
}

/// Follow a move until it ends; Ctrl+C halts the motor.
fn wait_for_move(
    cli: &Cli,
    controller: &FocuserController,
    start: i32,
    target: i32,
) -> Result<i32> {
    let distance = u64::from(start.abs_diff(target));
    let pb = if cli.quiet || cli.json || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(distance);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb
    };

    while controller.is_moving() {
        if was_interrupted() {
            pb.abandon_with_message("interrupted");
            controller.halt()?;
            let stopped = controller.get_position()?;
            if !cli.quiet {
                eprintln!("{} Halted at {stopped}", style("■").yellow());
            }
            return Err(CliError::Cancelled(format!("move to {target} interrupted")).into());
        }
        let current = controller.get_position()?;
        pb.set_position(u64::from(start.abs_diff(current)));
        pb.set_message(format!("{current} → {target}"));
        thread::sleep(POLL_INTERVAL);
    }

    let position = controller.get_position()?;
    pb.finish_and_clear();
    debug!("Move finished at {position}");
    if position != target {
        warn!("Move ended at {position}, short of target {target}");
    }
    Ok(position)
}

/// Halt command implementation.
pub(crate) fn cmd_halt(cli: &Cli, config: &Config) -> Result<()> {
    let controller = open_controller(cli, config)?;
    controller.halt()?;
    let position = controller.get_position()?;
    report(
        cli,
        json!({ "position": position }),
        format!("Halted at {position}"),
    )
}

/// Temperature command implementation.
pub(crate) fn cmd_temperature(cli: &Cli, config: &Config) -> Result<()> {
    let controller = open_controller(cli, config)?;
    let celsius = controller.get_temperature()?;
    report(
        cli,
        json!({ "temperature_celsius": celsius }),
        format!("{celsius:.1}"),
    )
}

/// Backlash command implementation.
pub(crate) fn cmd_backlash(cli: &Cli, config: &Config, value: Option<i32>) -> Result<()> {
    let controller = open_controller(cli, config)?;
    if let Some(value) = value {
        controller.set_backlash(value)?;
    }
    let backlash = controller.get_backlash()?;
    report(cli, json!({ "backlash": backlash }), describe_backlash(backlash))
}

/// Max travel command implementation.
pub(crate) fn cmd_max_travel(cli: &Cli, config: &Config, value: Option<u32>) -> Result<()> {
    let controller = open_controller(cli, config)?;
    if let Some(value) = value {
        controller.set_max_travel(value)?;
    }
    let max_travel = controller.get_max_travel()?;
    report(cli, json!({ "max_travel": max_travel }), max_travel)
}

/// Zero command implementation.
pub(crate) fn cmd_zero(cli: &Cli, config: &Config) -> Result<()> {
    let controller = open_controller(cli, config)?;
    controller.set_zero_here()?;
    let zero_offset = controller.settings().zero_offset;
    if !cli.quiet && !cli.json {
        eprintln!(
            "{} Logical zero set at physical step {zero_offset}",
            style("✓").green()
        );
    }
    report(cli, json!({ "zero_offset": zero_offset }), zero_offset)
}
