//! Flash command implementation.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use std::thread;
use stkflash::{
    AtBridge, CancelToken, FlashReport, Page, Phase, ResetControl, Stk500Flasher, TcpTransport,
};

use crate::{Cli, CliError, Settings, use_fancy_output};

fn progress_bar(quiet: bool, total: usize) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total as u64);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg:<12} [{bar:40.cyan/blue}] {pos}/{len} pages")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Reset the target, program `pages` and release the bridge.
pub(crate) fn cmd_flash(cli: &Cli, settings: &Settings, host: &str, pages: &[Page]) -> Result<()> {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || token.cancel()) {
        warn!("Failed to install Ctrl-C handler: {e}");
    }

    if !cli.quiet {
        eprintln!(
            "{} Resetting {} via {host}:{}",
            style("🔄").cyan(),
            settings.flash.device,
            settings.control_port
        );
    }
    let mut bridge = AtBridge::connect((host, settings.control_port), settings.connect_timeout)
        .with_context(|| format!("Failed to reach control port {host}:{}", settings.control_port))?;
    bridge.reset().context("Failed to reset the target")?;

    debug!("Waiting {}ms for the bootloader", settings.settle.as_millis());
    thread::sleep(settings.settle);

    let result = if cancel.is_cancelled() {
        Err(CliError::Cancelled("Interrupted before flashing".into()).into())
    } else {
        flash_pages(cli, settings, host, pages, cancel)
    };

    if let Err(e) = bridge.release() {
        warn!("Failed to release the bridge: {e}");
    }

    let report = result?;
    if !cli.quiet {
        print_summary(&report);
    }
    Ok(())
}

fn flash_pages(
    cli: &Cli,
    settings: &Settings,
    host: &str,
    pages: &[Page],
    cancel: CancelToken,
) -> Result<FlashReport> {
    let transport = TcpTransport::connect((host, settings.data_port), settings.connect_timeout)
        .with_context(|| format!("Failed to reach data port {host}:{}", settings.data_port))?;
    if !cli.quiet {
        eprintln!(
            "{} Connected to {}",
            style("🔌").cyan(),
            transport.peer()
        );
    }

    let mut flasher = Stk500Flasher::new(transport, settings.flash.clone()).with_cancel(cancel);
    let pb = progress_bar(cli.quiet, pages.len());
    let mut current = Phase::Idle;

    let result = flasher.flash(pages, |phase, done, total| {
        if phase != current {
            current = phase;
            pb.set_message(phase.to_string());
            pb.set_length(total as u64);
        }
        pb.set_position(done as u64);
    });

    match result {
        Ok(report) => {
            pb.finish_and_clear();
            Ok(report)
        },
        Err(e) => {
            pb.abandon();
            Err(e).context("Flashing failed")
        },
    }
}

fn print_summary(report: &FlashReport) {
    if let Some(signature) = report.info.signature {
        eprintln!(
            "{} Signature {:02X} {:02X} {:02X}",
            style("ℹ").blue(),
            signature[0],
            signature[1],
            signature[2]
        );
    }
    let retried = report.page_attempts.iter().filter(|&&a| a > 1).count();
    if retried > 0 {
        eprintln!(
            "{} {retried} page(s) needed more than one attempt",
            style("⚠").yellow()
        );
    }
    eprintln!(
        "{} {} page(s) written{}",
        style("✓").green().bold(),
        report.pages_written,
        if report.verified { " and verified" } else { "" }
    );
}
