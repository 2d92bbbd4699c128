//! uartfw CLI - Command-line uploader for devices running a UART bootloader.
//!
//! ## Features
//!
//! - Flash application images and firmware packages
//! - Store, fetch, list and delete files on the device
//! - Built-in YMODEM engine or lrzsz (`sb`/`rb`) as transfer agent
//! - Environment variable and TOML configuration support

use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

mod commands;
mod config;
mod package;
mod session;

use commands::{ports, query, transfer};
use config::Config;

/// uartfw - Upload firmware and files to a UART bootloader.
///
/// Environment variables:
///   UARTFW_DEVICE   - Serial device (default: ttl232r-3v3-0)
///   UARTFW_BAUD     - Baud rate (default: 115200)
///   UARTFW_AGENT    - Transfer agent (builtin, lrzsz)
#[derive(Parser)]
#[command(name = "uartfw")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial device; a bare name is looked up under /dev.
    #[arg(short, long, global = true, env = "UARTFW_DEVICE")]
    device: Option<String>,

    /// Baud rate of the bootloader link.
    #[arg(short, long, global = true, env = "UARTFW_BAUD")]
    baud: Option<u32>,

    /// Program moving files over YMODEM.
    #[arg(long, global = true, env = "UARTFW_AGENT", value_enum)]
    agent: Option<AgentArg>,

    /// Block check used by the built-in agent.
    #[arg(long = "check", global = true, value_enum, value_name = "CHECK")]
    block_check: Option<CheckArg>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Transfer agents.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum AgentArg {
    /// Built-in YMODEM engine (default).
    Builtin,
    /// lrzsz `sb`/`rb` bridged to the serial device.
    Lrzsz,
}

/// Block checks of the built-in agent.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum CheckArg {
    /// Two zero bytes, as the bootloader expects (default).
    Placeholder,
    /// CRC16-XMODEM.
    Crc16,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash an application image (app*.bin) or a firmware package (package*.zip).
    Flash {
        /// Image or package to flash.
        #[arg(value_name = "FIRMWARE")]
        firmware: PathBuf,

        /// Boot the application after a successful flash.
        #[arg(long)]
        boot: bool,
    },

    /// Store files on the device.
    Write {
        /// Files to store.
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },

    /// Copy files from the device.
    Read {
        /// Names of the files on the device.
        #[arg(required = true, value_name = "NAME")]
        names: Vec<String>,

        /// Directory receiving the files.
        #[arg(short = 'o', long, default_value = ".", value_name = "DIR")]
        dest: PathBuf,
    },

    /// Delete files from the device.
    Remove {
        /// Names of the files on the device.
        #[arg(required = true, value_name = "NAME")]
        names: Vec<String>,
    },

    /// Replace the application with an empty stub.
    RemoveApp,

    /// List files stored on the device.
    List {
        /// Output the listing as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show flash storage information.
    Info,

    /// Run the flash storage consistency check.
    Check,

    /// Leave the bootloader and start the application.
    Boot,

    /// Keep the device in the bootloader.
    Hold,

    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

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
        "uartfw v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let success = match run(&cli, &config) {
        Ok(success) => success,
        Err(e) => {
            commands::conclude(&cli, false);
            return Err(e);
        },
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

fn run(cli: &Cli, config: &Config) -> Result<bool> {
    Ok(match &cli.command {
        Commands::ListPorts { json } => {
            ports::cmd_list_ports(cli, *json)?;
            true
        },
        Commands::Flash { firmware, boot } => transfer::cmd_flash(cli, config, firmware, *boot)?,
        Commands::Write { files } => transfer::cmd_write(cli, config, files)?,
        Commands::Read { names, dest } => transfer::cmd_read(cli, config, names, dest)?,
        Commands::RemoveApp => transfer::cmd_remove_app(cli, config)?,
        Commands::Remove { names } => query::cmd_remove(cli, config, names)?,
        Commands::List { json } => query::cmd_list(cli, config, *json)?,
        Commands::Info => query::cmd_query(cli, config, query::Query::Info)?,
        Commands::Check => query::cmd_query(cli, config, query::Query::Check)?,
        Commands::Hold => query::cmd_query(cli, config, query::Query::Hold)?,
        Commands::Boot => query::cmd_boot(cli, config)?,
    })
}

/// Reject configuration values clap cannot validate for us.
fn parse_config_name<T>(
    kind: &str,
    value: Option<&str>,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>> {
    match value {
        None => Ok(None),
        Some(name) => match parse(name) {
            Some(parsed) => Ok(Some(parsed)),
            None => bail!("Unknown {kind} \"{name}\" in configuration"),
        },
    }
}
