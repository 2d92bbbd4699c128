//! Command implementations for uartfw CLI.

pub(crate) mod ports;
pub(crate) mod query;
pub(crate) mod transfer;

use crate::Cli;
use console::style;
use uartfw::Report;

/// Print what the device said, one `>>>` line per reply line.
pub(crate) fn print_report(report: &Report) {
    for line in report.lines() {
        println!(">>> {line}");
    }
}

/// Announce an operation on stderr.
pub(crate) fn announce(cli: &Cli, what: &str) {
    if !cli.quiet {
        eprintln!("{} {what}", style("::").cyan().bold());
    }
}

/// Print the closing status line and pass `success` through.
pub(crate) fn conclude(cli: &Cli, success: bool) -> bool {
    if success {
        if !cli.quiet {
            eprintln!("{}", style("...done").green());
        }
    } else {
        eprintln!("{}", style("...FAILED!").red().bold());
    }
    success
}
