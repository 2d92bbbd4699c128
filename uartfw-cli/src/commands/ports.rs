//! Serial port listing.

use crate::Cli;
use anyhow::Result;
use console::style;
use log::debug;
use uartfw::PortInfo;

fn discover_ports() -> Vec<PortInfo> {
    uartfw::list_ports().unwrap_or_else(|e| {
        debug!("Port enumeration failed: {e}");
        Vec::new()
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(cli: &Cli, json: bool) -> Result<()> {
    let ports = discover_ports();

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if !cli.quiet {
        eprintln!("{}", style("Available serial ports").bold().underlined());
    }

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &ports {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port.product.as_deref().unwrap_or("");
        eprintln!(
            "  {} {}{}",
            style(&port.name).green(),
            product,
            style(vid_pid).dim()
        );
    }

    Ok(())
}
