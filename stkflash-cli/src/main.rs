//! stkflash CLI - Command-line tool for flashing AVR boards through a
//! serial-over-TCP bridge.
//!
//! ## Features
//!
//! - Flash Intel HEX images through an STK500v1 bootloader
//! - Reset the target through the bridge's AT control port
//! - Read-back verification
//! - Page plan preview (text or JSON)
//! - Configuration files and environment variable support

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use env_logger::Env;
use log::debug;
use stkflash::{Device, FlashConfig, MemoryImage, image};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod commands;
mod config;

use commands::{flash::cmd_flash, plan::cmd_plan};
use config::Config;

/// Default bridge port forwarded to the target UART.
const DEFAULT_DATA_PORT: u16 = 8880;
/// Default bridge port accepting AT commands.
const DEFAULT_CONTROL_PORT: u16 = 8881;
/// Default delay between reset and sync.
const DEFAULT_SETTLE_MS: u64 = 400;
/// Default connect timeout.
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// stkflash - Flash AVR boards through a serial-over-TCP bridge.
///
/// Environment variables:
///   STKFLASH_HOST          - Bridge host
///   STKFLASH_DATA_PORT     - Bridge data port (default: 8880)
///   STKFLASH_CONTROL_PORT  - Bridge control port (default: 8881)
///   STKFLASH_DEVICE        - Target device (default: atmega328p)
#[derive(Parser)]
#[command(name = "stkflash")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "Exit codes: 0 ok, 2 usage, 3 config, 4 image, 5 connection, \
                        6 sync timeout, 7 page write, 8 verify, 9 protocol, 130 cancelled")]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Intel HEX image to flash.
    image: PathBuf,

    /// Bridge host name or address.
    #[arg(long, env = "STKFLASH_HOST")]
    host: Option<String>,

    /// Bridge port forwarded to the target UART.
    #[arg(long, env = "STKFLASH_DATA_PORT")]
    data_port: Option<u16>,

    /// Bridge port accepting AT commands.
    #[arg(long, env = "STKFLASH_CONTROL_PORT")]
    control_port: Option<u16>,

    /// Target device (atmega328p, atmega328, atmega168, atmega8).
    #[arg(short, long, env = "STKFLASH_DEVICE", value_parser = parse_device)]
    device: Option<Device>,

    /// Skip read-back verification.
    #[arg(long)]
    no_verify: bool,

    /// Continue when the device signature does not match.
    #[arg(long)]
    no_signature_check: bool,

    /// Number of sync attempts.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    sync_attempts: Option<u32>,

    /// Write attempts per page.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    page_attempts: Option<u32>,

    /// Delay between reset and sync, in milliseconds.
    #[arg(long, value_name = "MS")]
    settle_ms: Option<u64>,

    /// Print the page plan without connecting.
    #[arg(long)]
    plan: bool,

    /// Print the plan as JSON to stdout.
    #[arg(long, requires = "plan")]
    json: bool,

    /// Path to a configuration file.
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn parse_device(s: &str) -> Result<Device, String> {
    Device::from_name(s).ok_or_else(|| {
        format!("unknown device '{s}' (expected atmega328p, atmega328, atmega168 or atmega8)")
    })
}

/// CLI-level failures that are not library errors.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Missing or invalid configuration.
    #[error("{0}")]
    Config(String),
    /// Interrupted by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// Everything needed to run a session, after merging all sources.
#[derive(Debug)]
pub(crate) struct Settings {
    pub(crate) host: Option<String>,
    pub(crate) data_port: u16,
    pub(crate) control_port: u16,
    pub(crate) settle: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) flash: FlashConfig,
}

/// Merge command-line values over the configuration file.
fn resolve_settings(cli: &Cli, config: &Config) -> Result<Settings> {
    let device = match (cli.device, &config.flash.device) {
        (Some(device), _) => device,
        (None, Some(name)) => Device::from_name(name).ok_or_else(|| {
            CliError::Config(format!("unknown device '{name}' in configuration"))
        })?,
        (None, None) => Device::default(),
    };

    let mut flash = FlashConfig::new(device)
        .with_verify(!cli.no_verify && config.flash.verify.unwrap_or(true))
        .with_signature_check(
            !cli.no_signature_check && config.flash.check_signature.unwrap_or(true),
        );
    if let Some(attempts) = cli.sync_attempts.or(config.flash.sync_attempts) {
        flash = flash.with_sync_attempts(attempts);
    }
    if let Some(attempts) = cli.page_attempts.or(config.flash.page_attempts) {
        flash = flash.with_page_attempts(attempts);
    }
    flash
        .validate()
        .map_err(|e| CliError::Config(e.to_string()))?;

    let bridge = &config.bridge;
    Ok(Settings {
        host: cli.host.clone().or_else(|| bridge.host.clone()),
        data_port: cli
            .data_port
            .or(bridge.data_port)
            .unwrap_or(DEFAULT_DATA_PORT),
        control_port: cli
            .control_port
            .or(bridge.control_port)
            .unwrap_or(DEFAULT_CONTROL_PORT),
        settle: Duration::from_millis(
            cli.settle_ms
                .or(bridge.settle_ms)
                .unwrap_or(DEFAULT_SETTLE_MS),
        ),
        connect_timeout: Duration::from_millis(
            bridge
                .connect_timeout_ms
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        ),
        flash,
    })
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            exit_code(&err)
        },
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
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
        "stkflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };
    let settings = resolve_settings(&cli, &config)?;

    let image = MemoryImage::from_file(&cli.image)
        .with_context(|| format!("Failed to load image {}", cli.image.display()))?;
    image::check_range(&image, settings.flash.device.flash_size())?;
    let pages = image::schedule(&image, settings.flash.page_size)?;
    debug!(
        "{} bytes in {} segment(s), {} page(s)",
        image.len(),
        image.segments().len(),
        pages.len()
    );

    if cli.plan {
        return cmd_plan(&cli.image, &image, &pages, &settings, cli.json);
    }

    if pages.is_empty() {
        if !cli.quiet {
            eprintln!(
                "{} {} contains no data, nothing to flash",
                style("ℹ").blue(),
                cli.image.display()
            );
        }
        return Ok(());
    }

    let host = settings.host.clone().ok_or_else(|| {
        CliError::Config(
            "no bridge host configured (use --host, STKFLASH_HOST or [bridge] host)".into(),
        )
    })?;

    cmd_flash(&cli, &settings, &host, &pages)
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Config(_) => 3,
            CliError::Cancelled(_) => 130,
        };
    }

    if let Some(lib_err) = err.downcast_ref::<stkflash::Error>() {
        use stkflash::Error;
        return match lib_err {
            Error::Io(_) => 1,
            Error::Config(_) => 3,
            Error::Image(_) => 4,
            Error::Connection(_) => 5,
            Error::SyncTimeout { .. } => 6,
            Error::PageWriteFailed { .. } => 7,
            Error::VerifyMismatch { .. } => 8,
            Error::Timeout(_)
            | Error::UnexpectedResponse { .. }
            | Error::PageReadFailed { .. }
            | Error::SignatureMismatch { .. }
            | Error::AddressOutOfRange { .. } => 9,
            Error::Cancelled => 130,
        };
    }

    1
}
