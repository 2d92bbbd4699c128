//! Text commands: list, info, check, hold, boot and remove.

use super::{announce, conclude, print_report};
use crate::Cli;
use crate::config::Config;
use crate::session::connect;
use anyhow::{Context, Result};

/// Status queries answered with a text block.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Query {
    Info,
    Check,
    Hold,
}

impl Query {
    fn command(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Check => "check",
            Self::Hold => "hold",
        }
    }
}

/// Info / check / hold command implementation.
pub(crate) fn cmd_query(cli: &Cli, config: &Config, query: Query) -> Result<bool> {
    let mut session = connect(cli, config)?.session;

    let report = match query {
        Query::Info => session.info(),
        Query::Check => session.check(),
        Query::Hold => session.hold(),
    }
    .with_context(|| format!("Failed to run `{}`", query.command()))?;

    print_report(&report);
    Ok(conclude(cli, report.success()))
}

/// Boot command implementation.
pub(crate) fn cmd_boot(cli: &Cli, config: &Config) -> Result<bool> {
    let mut session = connect(cli, config)?.session;

    announce(cli, "Booting application");
    let report = session.boot().context("Failed to boot")?;
    print_report(&report);
    Ok(conclude(cli, report.success()))
}

/// Remove command implementation; stops at the first failed file.
pub(crate) fn cmd_remove(cli: &Cli, config: &Config, names: &[String]) -> Result<bool> {
    let mut session = connect(cli, config)?.session;

    for name in names {
        announce(cli, &format!("Removing {name}"));
        let report = session
            .remove(name)
            .with_context(|| format!("Failed to remove {name}"))?;
        print_report(&report);
        if !conclude(cli, report.success()) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// List command implementation.
pub(crate) fn cmd_list(cli: &Cli, config: &Config, json: bool) -> Result<bool> {
    let mut session = connect(cli, config)?.session;

    let listing = session.list().context("Failed to list files")?;
    let success = listing.report().success();

    if json {
        let output = serde_json::json!({
            "ok": success,
            "data": {
                "files": listing.files(),
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(success);
    }

    print_report(listing.report());
    Ok(conclude(cli, success))
}
