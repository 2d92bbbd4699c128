//! Commands that move files: flash, write, read and remove-app.

use super::{announce, conclude, print_report};
use crate::Cli;
use crate::config::Config;
use crate::session::{Connection, connect};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, firmware: &Path, boot: bool) -> Result<bool> {
    let Connection {
        mut session,
        progress,
    } = connect(cli, config)?;

    announce(cli, &format!("Flashing {}", firmware.display()));
    let report = session.flash(firmware);
    progress.finish_and_clear();
    let report = report.with_context(|| format!("Failed to flash {}", firmware.display()))?;
    print_report(&report);

    if !conclude(cli, report.success()) {
        return Ok(false);
    }
    if !boot {
        return Ok(true);
    }

    announce(cli, "Booting application");
    let report = session.boot().context("Failed to boot")?;
    print_report(&report);
    Ok(conclude(cli, report.success()))
}

/// Write command implementation; stops at the first failed file.
pub(crate) fn cmd_write(cli: &Cli, config: &Config, files: &[PathBuf]) -> Result<bool> {
    let Connection {
        mut session,
        progress,
    } = connect(cli, config)?;

    for file in files {
        announce(cli, &format!("Writing {}", file.display()));
        let report = session
            .write(file)
            .with_context(|| format!("Failed to write {}", file.display()));
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                progress.finish_and_clear();
                return Err(e);
            },
        };
        progress.suspend(|| print_report(&report));
        if !conclude(cli, report.success()) {
            progress.finish_and_clear();
            return Ok(false);
        }
    }

    progress.finish_and_clear();
    Ok(true)
}

/// Read command implementation; stops at the first failed file.
pub(crate) fn cmd_read(cli: &Cli, config: &Config, names: &[String], dest: &Path) -> Result<bool> {
    let Connection {
        mut session,
        progress,
    } = connect(cli, config)?;

    for name in names {
        announce(cli, &format!("Reading {name} into {}", dest.display()));
        let report = session
            .read(name, dest)
            .with_context(|| format!("Failed to read {name}"));
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                progress.finish_and_clear();
                return Err(e);
            },
        };
        progress.suspend(|| print_report(&report));
        if !conclude(cli, report.success()) {
            progress.finish_and_clear();
            return Ok(false);
        }
    }

    progress.finish_and_clear();
    Ok(true)
}

/// Remove-app command implementation.
pub(crate) fn cmd_remove_app(cli: &Cli, config: &Config) -> Result<bool> {
    let Connection {
        mut session,
        progress,
    } = connect(cli, config)?;

    announce(cli, "Replacing the application with an empty stub");
    let report = session.remove_app();
    progress.finish_and_clear();
    let report = report.context("Failed to remove the application")?;
    print_report(&report);
    Ok(conclude(cli, report.success()))
}
