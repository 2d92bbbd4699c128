//! Bootloader session: the operations a user runs against one device.
//!
//! A session owns the [`CommandChannel`] (and through it the device opener)
//! and the [`TransferAgent`]. Every operation opens the link only for as long
//! as it needs it:
//!
//! ```text
//! flash / write / read:
//!   "\n"            open, exchange, close    (wake the bootloader)
//!   "flash"         open, exchange, close
//!   <transfer>      open with transfer timeout, agent drives YMODEM,
//!                   drain trailing output, close
//!
//! list / info / check / hold / remove:
//!   "<command>"     open, exchange, close    (retried on "Unknown command")
//! ```
//!
//! No operation reports success without looking at what the device said.

use crate::agent::TransferAgent;
use crate::error::{Error, Result};
use crate::firmware::{self, EMPTY_APP_CONTENTS, EMPTY_APP_NAME, PackageExtractor};
use crate::port::{Port, PortOpener};
use crate::protocol::command::{CommandChannel, Response};
use crate::protocol::listing::{RemoteFile, parse_listing};
use crate::protocol::retry::{Attempt, retry_bounded};
use crate::protocol::ymodem::control;
use log::{debug, info, warn};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Reply that confirms `boot`.
pub const BOOT_MARKER: &str = "booting";

/// Outcome of a session operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    operation: String,
    response: Vec<u8>,
    success: bool,
}

impl Report {
    /// Build a report.
    pub fn new(operation: impl Into<String>, response: Vec<u8>, success: bool) -> Self {
        Self {
            operation: operation.into(),
            response,
            success,
        }
    }

    /// Operation name (the command sent).
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Raw device output.
    pub fn response(&self) -> &[u8] {
        &self.response
    }

    /// Whether the device confirmed the operation.
    pub fn success(&self) -> bool {
        self.success
    }

    /// Device output as text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.response).into_owned()
    }

    /// Device output split into lines.
    pub fn lines(&self) -> Vec<String> {
        self.text().lines().map(str::to_string).collect()
    }
}

/// Parsed `getlist` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    report: Report,
    files: Vec<RemoteFile>,
}

impl Listing {
    /// Files stored on the device.
    pub fn files(&self) -> &[RemoteFile] {
        &self.files
    }

    /// Look up a file by exact name.
    pub fn find(&self, name: &str) -> Option<&RemoteFile> {
        self.files.iter().find(|f| f.name == name)
    }

    /// The underlying report.
    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Consume the listing, keeping the report.
    pub fn into_report(self) -> Report {
        self.report
    }
}

/// Session timing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pause after a transfer before collecting the device's trailing output.
    pub drain_delay: Duration,
    /// `getlist` rounds spent looking up a file before `read` gives up.
    pub size_lookup_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            drain_delay: Duration::from_millis(10),
            size_lookup_attempts: 5,
        }
    }
}

/// One bootloader, one link, one operation at a time.
pub struct Session<O: PortOpener> {
    channel: CommandChannel<O>,
    agent: Box<dyn TransferAgent>,
    extractor: Option<Box<dyn PackageExtractor>>,
    config: SessionConfig,
}

impl<O: PortOpener> Session<O> {
    /// Start a session with default command timing.
    ///
    /// Fails with [`Error::AgentUnavailable`] if the agent cannot run.
    pub fn new(opener: O, agent: Box<dyn TransferAgent>) -> Result<Self> {
        Self::with_channel(CommandChannel::new(opener), agent)
    }

    /// Start a session on an existing channel.
    pub fn with_channel(channel: CommandChannel<O>, agent: Box<dyn TransferAgent>) -> Result<Self> {
        agent.ensure_available()?;
        debug!(
            "Session on {} using {} agent",
            channel.opener().device_name(),
            agent.name()
        );
        Ok(Self {
            channel,
            agent,
            extractor: None,
            config: SessionConfig::default(),
        })
    }

    /// Unpack `package*.zip` bundles with `extractor`.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Box<dyn PackageExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Override session timing.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// The command channel.
    pub fn channel(&self) -> &CommandChannel<O> {
        &self.channel
    }

    /// Name of the transfer agent.
    pub fn agent_name(&self) -> &str {
        self.agent.name()
    }

    fn command_timeout(&self) -> Duration {
        self.channel.config().timeout
    }

    /// Flash an application image (or a package containing one).
    pub fn flash(&mut self, path: &Path) -> Result<Report> {
        let extractor = self
            .extractor
            .as_mut()
            .map(|e| &mut **e as &mut dyn PackageExtractor);
        let image = firmware::resolve_firmware(path, extractor)?;
        self.push_file("flash", &image)
    }

    /// Store an arbitrary file on the device.
    pub fn write(&mut self, path: &Path) -> Result<Report> {
        self.push_file("write", path)
    }

    /// Replace the application with a stub image.
    pub fn remove_app(&mut self) -> Result<Report> {
        let dir = tempfile::Builder::new().prefix("uartfw-").tempdir()?;
        let stub = dir.path().join(EMPTY_APP_NAME);
        fs::write(&stub, EMPTY_APP_CONTENTS)?;
        self.flash(&stub)
    }

    /// Copy `name` from the device into `dest_dir`.
    pub fn read(&mut self, name: &str, dest_dir: &Path) -> Result<Report> {
        if !dest_dir.is_dir() {
            return Err(Error::FileNotFound(dest_dir.to_path_buf()));
        }

        let size = self.remote_size(name)?;
        let timeout = firmware::transfer_timeout(size);
        info!("Reading {name} ({size} bytes, timeout {:.1}s)", timeout.as_secs_f64());

        let command = format!("read {name}");
        let response = self.announce(&command)?;
        if !response.recognized() {
            return Ok(Report::new(command, response.into_bytes(), false));
        }
        let mut response = response.into_bytes();

        let mut port = self.channel.opener().open_port(timeout)?;
        let outcome = self
            .agent
            .receive_file(&mut port, name, size, dest_dir, timeout);
        let trailing = self.finish_transfer(&mut port, outcome.is_ok());
        let transfer = outcome?;
        response.extend(trailing?);

        debug!("{} received {} bytes", transfer.agent, transfer.bytes);
        Ok(Report::new(command, response, true))
    }

    /// Delete `name` from the device.
    pub fn remove(&mut self, name: &str) -> Result<Report> {
        self.query(&format!("remove {name}"))
    }

    /// List stored files.
    pub fn list(&mut self) -> Result<Listing> {
        let response = self.channel.send_with_retry("getlist")?;
        let files = parse_listing(&response.text());
        let success = response.recognized() && !response.is_empty();
        Ok(Listing {
            report: Report::new("getlist", response.into_bytes(), success),
            files,
        })
    }

    /// Leave the bootloader and start the application.
    pub fn boot(&mut self) -> Result<Report> {
        let reply = self.channel.send("boot", self.command_timeout())?;
        let success = Response::new("boot", reply.clone()).contains(BOOT_MARKER);
        Ok(Report::new("boot", reply, success))
    }

    /// Flash storage summary.
    pub fn info(&mut self) -> Result<Report> {
        self.query("info")
    }

    /// Flash storage consistency check.
    pub fn check(&mut self) -> Result<Report> {
        self.query("check")
    }

    /// Keep the device in the bootloader.
    pub fn hold(&mut self) -> Result<Report> {
        self.query("hold")
    }

    fn query(&mut self, command: &str) -> Result<Report> {
        let response = self.channel.send_with_retry(command)?;
        let success = response.recognized() && !response.is_empty();
        Ok(Report::new(command, response.into_bytes(), success))
    }

    /// Size of `name` according to `getlist`, polled a few times.
    fn remote_size(&mut self, name: &str) -> Result<u64> {
        let attempts = self.config.size_lookup_attempts;
        let size = retry_bounded(attempts, |attempt| match self.list() {
            Ok(listing) => match listing.find(name) {
                Some(file) => Attempt::Done(Some(file.size)),
                None => {
                    debug!("{name} not in listing (attempt {attempt}/{attempts})");
                    Attempt::Retry(None)
                },
            },
            Err(Error::CommandTimeout(command)) => {
                debug!("`{command}` timed out (attempt {attempt}/{attempts})");
                Attempt::Retry(None)
            },
            Err(e) => Attempt::Fatal(e),
        })?;
        size.ok_or_else(|| Error::RemoteFileNotFound(name.to_string()))
    }

    /// Wake the bootloader and send a transfer command.
    fn announce(&mut self, command: &str) -> Result<Response> {
        let timeout = self.command_timeout();
        self.channel.send("\n", timeout)?;

        let response = Response::new(command, self.channel.send(command, timeout)?);
        if !response.recognized() {
            warn!("Bootloader rejected `{command}`");
        }
        Ok(response)
    }

    fn push_file(&mut self, command: &str, path: &Path) -> Result<Report> {
        let size = fs::metadata(path)
            .ok()
            .filter(|m| m.is_file())
            .ok_or_else(|| Error::FileNotFound(path.to_path_buf()))?
            .len();
        let timeout = firmware::transfer_timeout(size);
        info!(
            "{command} {} ({size} bytes, timeout {:.1}s)",
            path.display(),
            timeout.as_secs_f64()
        );

        let response = self.announce(command)?;
        if !response.recognized() {
            return Ok(Report::new(command, response.into_bytes(), false));
        }
        let mut response = response.into_bytes();

        let mut port = self.channel.opener().open_port(timeout)?;
        let outcome = self.agent.send_file(&mut port, path, timeout);
        let trailing = self.finish_transfer(&mut port, outcome.is_ok());
        let transfer = outcome?;
        let trailing = trailing?;

        debug!(
            "{} sent {} ({} bytes)",
            transfer.agent, transfer.file_name, transfer.bytes
        );
        // The bootloader confirms a stored file after the transfer ends.
        let trailing = skip_acks(trailing);
        let success = !trailing.is_empty();
        response.extend(trailing);
        Ok(Report::new(command, response, success))
    }

    /// Collect what the device printed after a transfer and close the link.
    fn finish_transfer(&self, port: &mut O::Port, transferred: bool) -> Result<Vec<u8>> {
        let drained = if transferred {
            thread::sleep(self.config.drain_delay);
            drain(port)
        } else {
            Ok(Vec::new())
        };
        let closed = port.close();
        let drained = drained?;
        closed?;
        Ok(drained)
    }
}

/// Drop ACKs a receiver sent for the closing YMODEM block.
fn skip_acks(mut trailing: Vec<u8>) -> Vec<u8> {
    let acks = trailing.iter().take_while(|&&b| b == control::ACK).count();
    trailing.drain(..acks);
    trailing
}

fn drain(port: &mut dyn Port) -> Result<Vec<u8>> {
    let pending = port.bytes_to_read()?;
    let mut buf = vec![0u8; pending];
    let mut filled = 0;
    while filled < pending {
        match port.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}
