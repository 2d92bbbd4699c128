//! Session construction from command-line flags and configuration.

use crate::config::Config;
use crate::package::ZipPackageExtractor;
use crate::{AgentArg, CheckArg, Cli, parse_config_name, use_fancy_output};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use uartfw::port::BOOTLOADER_BAUD;
use uartfw::{
    AgentCommand, AgentKind, BlockCheck, ChannelConfig, CommandChannel, ExternalAgent,
    InProcessAgent, SerialConfig, Session, TransferAgent, YmodemConfig,
};

/// Device used when neither flags nor configuration name one.
pub const DEFAULT_DEVICE: &str = "ttl232r-3v3-0";

/// An open session plus the progress bar its agent reports to.
pub(crate) struct Connection {
    pub session: Session<SerialConfig>,
    pub progress: ProgressBar,
}

impl From<AgentArg> for AgentKind {
    fn from(agent: AgentArg) -> Self {
        match agent {
            AgentArg::Builtin => AgentKind::InProcess,
            AgentArg::Lrzsz => AgentKind::External,
        }
    }
}

impl From<CheckArg> for BlockCheck {
    fn from(check: CheckArg) -> Self {
        match check {
            CheckArg::Placeholder => BlockCheck::Placeholder,
            CheckArg::Crc16 => BlockCheck::Crc16,
        }
    }
}

/// Serial link settings: flags, then configuration, then defaults.
pub(crate) fn serial_config(cli: &Cli, config: &Config) -> SerialConfig {
    let device = cli
        .device
        .clone()
        .or_else(|| config.connection.device.clone())
        .unwrap_or_else(|| DEFAULT_DEVICE.to_string());
    let baud = cli
        .baud
        .or(config.connection.baud)
        .unwrap_or(BOOTLOADER_BAUD);
    SerialConfig::new(device, baud)
}

fn agent_kind(cli: &Cli, config: &Config) -> Result<AgentKind> {
    if let Some(agent) = cli.agent {
        return Ok(agent.into());
    }
    Ok(
        parse_config_name("transfer agent", config.transfer.agent.as_deref(), AgentKind::from_name)?
            .unwrap_or_default(),
    )
}

fn block_check(cli: &Cli, config: &Config) -> Result<BlockCheck> {
    if let Some(check) = cli.block_check {
        return Ok(check.into());
    }
    Ok(
        parse_config_name("block check", config.transfer.check.as_deref(), BlockCheck::from_name)?
            .unwrap_or_default(),
    )
}

fn agent_command(kind: &str, line: Option<&str>, fallback: &str) -> Result<AgentCommand> {
    match line {
        None => Ok(AgentCommand::new(fallback)),
        Some(line) => AgentCommand::parse(line)
            .with_context(|| format!("Empty {kind} command in configuration")),
    }
}

/// Progress bar for in-process transfers; hidden when quiet or not on a terminal.
fn transfer_progress(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .map_or_else(|_| ProgressStyle::default_bar(), |s| s.progress_chars("#>-"));
    pb.set_style(style);
    pb
}

fn build_agent(
    cli: &Cli,
    config: &Config,
    progress: &ProgressBar,
) -> Result<Box<dyn TransferAgent>> {
    let kind = agent_kind(cli, config)?;
    debug!("Transfer agent: {kind}");

    let agent: Box<dyn TransferAgent> = match kind {
        AgentKind::InProcess => {
            let ymodem = YmodemConfig {
                check: block_check(cli, config)?,
                ..YmodemConfig::default()
            };
            let pb = progress.clone();
            Box::new(
                InProcessAgent::new(ymodem).with_progress(move |name, done, total| {
                    if pb.length() != Some(total) {
                        pb.reset();
                        pb.set_length(total);
                        pb.set_message(name.to_string());
                    }
                    pb.set_position(done);
                }),
            )
        },
        AgentKind::External => {
            let sender = agent_command("sender", config.transfer.sender.as_deref(), "sb")?;
            let receiver = agent_command("receiver", config.transfer.receiver.as_deref(), "rb")?;
            Box::new(ExternalAgent::new(sender, receiver))
        },
    };
    Ok(agent)
}

/// Open a session against the configured device.
///
/// Nothing touches the device here; the link is opened per operation.
pub(crate) fn connect(cli: &Cli, config: &Config) -> Result<Connection> {
    let serial = serial_config(cli, config);
    debug!("Device {} at {} baud", serial.port_name, serial.baud_rate);

    let mut channel = ChannelConfig::default();
    if let Some(timeout) = config.timing.command_timeout() {
        channel.timeout = timeout;
    }

    let progress = transfer_progress(cli);
    let agent = build_agent(cli, config, &progress)?;
    let session = Session::with_channel(CommandChannel::with_config(serial, channel), agent)
        .context("Transfer agent is not usable")?
        .with_extractor(Box::new(ZipPackageExtractor::new()));

    Ok(Connection { session, progress })
}
