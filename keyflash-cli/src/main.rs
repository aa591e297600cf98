//! keyflash CLI - Command-line tool for updating keyboard firmware.
//!
//! ## Features
//!
//! - Update firmware from the bundled default/experimental image or a file
//! - Countdown for keyboards that need a key held during the reset
//! - Settings backup before the reset, restore if flashing fails
//! - Manual settings backup and restore
//! - Intel HEX image inspection
//! - Shell completion generation
//! - Environment variable support

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;

mod commands;
mod config;
mod serial;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or an environment that cannot satisfy it (exit 2).
    #[error("{0}")]
    Usage(String),
    /// The user backed out (exit 130).
    #[error("{0}")]
    Cancelled(String),
    /// The update ran and failed (exit 1).
    #[error("{0}")]
    Failed(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
            Self::Failed(_) => 1,
        }
    }
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<CliError>()
        .map_or(1, CliError::exit_code)
}

/// keyflash - Firmware updates for USB programmable keyboards.
///
/// Environment variables:
///   KEYFLASH_PORT              - Serial port of the keyboard
///   KEYFLASH_FIRMWARE_DIR      - Directory holding bundled firmware images
///   KEYFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "keyflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "For more information, visit: https://github.com/keyflash/keyflash")]
struct Cli {
    /// Serial port of the keyboard (auto-detected if not specified).
    #[arg(short, long, global = true, env = "KEYFLASH_PORT")]
    port: Option<String>,

    /// Directory holding bundled firmware (<vendor>/<product>/default.hex).
    #[arg(long, global = true, env = "KEYFLASH_FIRMWARE_DIR", value_name = "DIR")]
    firmware_dir: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "KEYFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Update the keyboard firmware.
    Flash {
        /// Use the bundled experimental image instead of the default one.
        #[arg(long, conflicts_with = "custom")]
        experimental: bool,

        /// Flash an Intel HEX file instead of a bundled image.
        #[arg(long, value_name = "PATH")]
        custom: Option<PathBuf>,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,

        /// Skip read-back and boot verification.
        #[arg(long)]
        no_verify: bool,
    },

    /// Show the firmware version running on the keyboard.
    Version,

    /// List which firmware sources are available.
    Sources {
        /// Keyboard family (raise, model01) instead of the connected keyboard.
        #[arg(long)]
        family: Option<String>,

        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List serial ports and any keyboards behind them.
    ListDevices {
        /// Output device list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show information about an Intel HEX image.
    Info {
        /// Path to the image.
        image: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Save the keyboard settings to a file.
    Backup {
        /// Output file (defaults to the backup directory).
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Write saved settings back to the keyboard.
    Restore {
        /// Backup file written by `keyflash backup`.
        file: PathBuf,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
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
        "keyflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            experimental,
            custom,
            yes,
            no_verify,
        } => {
            let source = commands::flash::source_from_args(*experimental, custom.as_ref());
            commands::flash::cmd_flash(cli, &config, source, *yes, *no_verify)
        },
        Commands::Version => commands::device::cmd_version(cli, &config),
        Commands::Sources { family, json } => {
            commands::device::cmd_sources(cli, &config, family.as_deref(), *json)
        },
        Commands::ListDevices { json } => commands::device::cmd_list_devices(*json),
        Commands::Info { image, json } => commands::info::cmd_info(image, *json),
        Commands::Backup { output } => commands::backup::cmd_backup(cli, &config, output.as_ref()),
        Commands::Restore { file } => commands::backup::cmd_restore(cli, &config, file),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}
