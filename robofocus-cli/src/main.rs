//! robofocus CLI - command-line control for RoboFocus focusers.
//!
//! ## Features
//!
//! - Discover focusers on any serial port
//! - Move, halt and query position and temperature
//! - Read and write backlash and travel limit
//! - Calibrate logical zero with persisted settings
//! - A built-in simulator for use without hardware
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;

mod commands;
mod config;
mod serial;

use commands::completions::{cmd_completions, cmd_completions_install};
use commands::focuser::{
    cmd_backlash, cmd_halt, cmd_info, cmd_max_travel, cmd_move, cmd_position, cmd_temperature,
    cmd_zero,
};
use commands::ports::{cmd_list_ports, cmd_scan};
use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Errors that map to dedicated exit codes.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Bad invocation or a setup problem the user must resolve.
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// robofocus - control a RoboFocus focuser over RS-232.
///
/// Environment variables:
///   ROBOFOCUS_PORT              - Serial port to use
///   ROBOFOCUS_TIMEOUT           - Response timeout in seconds
///   ROBOFOCUS_SIMULATOR         - Use the simulator instead of hardware
///   ROBOFOCUS_SETTINGS          - Path of the persisted focuser settings
///   ROBOFOCUS_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "robofocus")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (scanned for if not specified).
    #[arg(short, long, global = true, env = "ROBOFOCUS_PORT")]
    pub port: Option<String>,

    /// Response timeout in seconds.
    #[arg(short, long, global = true, env = "ROBOFOCUS_TIMEOUT")]
    pub timeout: Option<f64>,

    /// Drive the built-in simulator instead of hardware.
    #[arg(long, global = true, env = "ROBOFOCUS_SIMULATOR")]
    pub simulator: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    /// Path of the persisted focuser settings.
    #[arg(long, global = true, value_name = "PATH", env = "ROBOFOCUS_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Print results as JSON on stdout.
    #[arg(long, global = true)]
    pub json: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "ROBOFOCUS_NON_INTERACTIVE")]
    pub non_interactive: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List serial ports.
    ListPorts {
        /// Include Bluetooth serial ports.
        #[arg(long)]
        all: bool,
    },

    /// Probe every serial port for a RoboFocus.
    Scan {
        /// Include Bluetooth serial ports.
        #[arg(long)]
        all: bool,
    },

    /// Show device and settings summary.
    Info,

    /// Print the logical position.
    Position,

    /// Move to a logical position.
    Move {
        /// Target position.
        #[arg(allow_negative_numbers = true)]
        target: i32,

        /// Return once the move has started.
        #[arg(long)]
        no_wait: bool,
    },

    /// Stop the motor.
    Halt,

    /// Print the temperature in Celsius.
    Temperature,

    /// Show or set backlash compensation (positive OUT, negative IN, 0 off).
    Backlash {
        /// New value.
        #[arg(allow_negative_numbers = true)]
        value: Option<i32>,
    },

    /// Show or set the hardware travel limit.
    MaxTravel {
        /// New limit (1-65535).
        value: Option<u32>,
    },

    /// Make the current position logical zero.
    Zero,

    /// Generate or install shell completions.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install into the shell's completion directory.
        #[arg(long)]
        install: bool,
    },
}

/// Exit code for an error that reached `main`.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<robofocus::Error>() {
        Some(robofocus::Error::Config(_)) => 3,
        Some(robofocus::Error::PortNotFound(_) | robofocus::Error::Handshake(_)) => 4,
        _ => 1,
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = Config::load(cli.config_path.as_deref());

    match &cli.command {
        Commands::ListPorts { all } => cmd_list_ports(cli, &config, *all),
        Commands::Scan { all } => cmd_scan(cli, &config, *all),
        Commands::Info => cmd_info(cli, &config),
        Commands::Position => cmd_position(cli, &config),
        Commands::Move { target, no_wait } => cmd_move(cli, &config, *target, *no_wait),
        Commands::Halt => cmd_halt(cli, &config),
        Commands::Temperature => cmd_temperature(cli, &config),
        Commands::Backlash { value } => cmd_backlash(cli, &config, *value),
        Commands::MaxTravel { value } => cmd_max_travel(cli, &config, *value),
        Commands::Zero => cmd_zero(cli, &config),
        Commands::Completions { shell, install } => {
            if *install {
                cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g. `robofocus completions bash`, \
                         or use `robofocus completions --install`"
                            .to_string(),
                    )
                })?;
                cmd_completions(shell);
                Ok(())
            }
        },
    }
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "robofocus v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}
