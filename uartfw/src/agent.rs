//! Transfer agents: whatever drives the YMODEM wire traffic of a transfer.
//!
//! Two implementations share the [`TransferAgent`] trait:
//!
//! - [`InProcessAgent`] runs [`YmodemTransfer`] directly on the serial link.
//! - [`ExternalAgent`] spawns lrzsz (`sb`, `rb`) and connects it to the link
//!   through a [`TransferBridge`].
//!
//! The session only sees the trait, so the choice is made once by the caller.

use crate::bridge::{BridgeConfig, TransferBridge};
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::ymodem::{YmodemConfig, YmodemTransfer};
use log::{debug, info, warn};
use std::ffi::OsStr;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Serial read timeout used while the in-process engine owns the link.
const ENGINE_POLL: Duration = Duration::from_millis(50);

/// Progress callback: (file name, bytes done, bytes total).
pub type ProgressFn = Box<dyn FnMut(&str, u64, u64) + Send>;

/// Result of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// File name as seen by the device.
    pub file_name: String,
    /// Bytes moved.
    pub bytes: u64,
    /// Agent that performed the transfer.
    pub agent: String,
}

/// Capability to move one file over an already-open link.
pub trait TransferAgent {
    /// Short name used in logs and reports.
    fn name(&self) -> &str;

    /// Fail with [`Error::AgentUnavailable`] if the agent cannot run here.
    fn ensure_available(&self) -> Result<()>;

    /// Send `path` to the device. The device must already expect a file.
    fn send_file(&mut self, port: &mut dyn Port, path: &Path, timeout: Duration) -> Result<TransferReport>;

    /// Receive `name` (announced as `size` bytes) from the device into `dest_dir`.
    fn receive_file(
        &mut self,
        port: &mut dyn Port,
        name: &str,
        size: u64,
        dest_dir: &Path,
        timeout: Duration,
    ) -> Result<TransferReport>;
}

/// Which agent implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentKind {
    /// Built-in YMODEM engine.
    #[default]
    InProcess,
    /// lrzsz `sb`/`rb` through the bridge.
    External,
}

impl AgentKind {
    /// Parse an agent name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "builtin" | "internal" | "in-process" | "inprocess" => Some(Self::InProcess),
            "external" | "lrzsz" => Some(Self::External),
            _ => None,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProcess => write!(f, "builtin"),
            Self::External => write!(f, "lrzsz"),
        }
    }
}

fn display_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::FileNotFound(path.to_path_buf()))
}

/// Agent running the YMODEM engine on the calling thread.
pub struct InProcessAgent {
    config: YmodemConfig,
    progress: Option<ProgressFn>,
}

impl Default for InProcessAgent {
    fn default() -> Self {
        Self::new(YmodemConfig::default())
    }
}

impl InProcessAgent {
    /// Agent with the given engine configuration.
    pub fn new(config: YmodemConfig) -> Self {
        Self {
            config,
            progress: None,
        }
    }

    /// Report progress through `progress`.
    #[must_use]
    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: FnMut(&str, u64, u64) + Send + 'static,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    fn engine_config(&self, timeout: Duration) -> YmodemConfig {
        YmodemConfig {
            start_timeout: timeout,
            ..self.config.clone()
        }
    }
}

impl TransferAgent for InProcessAgent {
    fn name(&self) -> &str {
        "builtin"
    }

    fn ensure_available(&self) -> Result<()> {
        Ok(())
    }

    fn send_file(&mut self, port: &mut dyn Port, path: &Path, timeout: Duration) -> Result<TransferReport> {
        let file_name = display_name(path)?;
        let file = File::open(path).map_err(|_| Error::FileNotFound(path.to_path_buf()))?;
        let size = file.metadata()?.len();
        let mut source = BufReader::new(file);

        port.set_timeout(ENGINE_POLL)?;
        let config = self.engine_config(timeout);
        let progress = &mut self.progress;
        let mut ymodem = YmodemTransfer::with_config(port, config);
        ymodem.send(&file_name, size, &mut source, |done, total| {
            if let Some(progress) = progress.as_mut() {
                progress(&file_name, done, total);
            }
        })?;

        Ok(TransferReport {
            file_name: file_name.clone(),
            bytes: size,
            agent: self.name().to_string(),
        })
    }

    fn receive_file(
        &mut self,
        port: &mut dyn Port,
        name: &str,
        size: u64,
        dest_dir: &Path,
        timeout: Duration,
    ) -> Result<TransferReport> {
        let dest = dest_dir.join(name);
        // Staged next to the destination until the batch completes.
        let mut staging = tempfile::Builder::new()
            .prefix(".uartfw-")
            .tempfile_in(dest_dir)?;

        port.set_timeout(ENGINE_POLL)?;
        let config = self.engine_config(timeout);
        let progress = &mut self.progress;
        let mut sink = BufWriter::new(staging.as_file_mut());
        let mut ymodem = YmodemTransfer::with_config(port, config);
        let received = ymodem.receive(&mut sink, |done, _| {
            if let Some(progress) = progress.as_mut() {
                progress(name, done, size);
            }
        })?;
        sink.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        staging.persist(&dest).map_err(|e| Error::Io(e.error))?;

        if received.name != name {
            warn!("Device sent \"{}\" for \"{name}\"", received.name);
        }
        info!("Saved {} ({} bytes)", dest.display(), received.written);

        Ok(TransferReport {
            file_name: name.to_string(),
            bytes: received.written,
            agent: self.name().to_string(),
        })
    }
}

/// A program plus its leading arguments, e.g. `sb -k`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    program: String,
    args: Vec<String>,
}

impl AgentCommand {
    /// Command running `program` with no extra arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Split a whitespace-separated command line (no quoting).
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let program = words.next()?;
        Some(Self {
            program: program.to_string(),
            args: words.map(str::to_string).collect(),
        })
    }

    /// Append a leading argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Program name or path.
    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

/// Locate `program` the way a shell would: paths as given, names via `PATH`.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

/// Agent delegating the protocol to lrzsz.
pub struct ExternalAgent {
    sender: AgentCommand,
    receiver: AgentCommand,
    bridge: BridgeConfig,
}

impl Default for ExternalAgent {
    fn default() -> Self {
        Self::new(AgentCommand::new("sb"), AgentCommand::new("rb"))
    }
}

impl ExternalAgent {
    /// Agent using `sender` for uploads and `receiver` for downloads.
    pub fn new(sender: AgentCommand, receiver: AgentCommand) -> Self {
        Self {
            sender,
            receiver,
            bridge: BridgeConfig::default(),
        }
    }

    /// Override the bridge timing (the deadline is set per transfer).
    #[must_use]
    pub fn with_bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    fn run(&self, port: &mut dyn Port, mut command: Command, timeout: Duration) -> Result<()> {
        let program = command.get_program().to_string_lossy().into_owned();
        command.stdin(Stdio::piped()).stdout(Stdio::piped());
        if log::log_enabled!(log::Level::Debug) {
            command.stderr(Stdio::inherit());
        } else {
            command.stderr(Stdio::null());
        }

        debug!(
            "Spawning {program} {:?}",
            command.get_args().map(OsStr::to_string_lossy).collect::<Vec<_>>()
        );
        let child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::AgentUnavailable(program.clone()),
            _ => Error::Io(e),
        })?;

        let bridge = TransferBridge::with_config(self.bridge.clone().with_deadline(timeout));
        let report = bridge.run(port, child)?;

        if report.deadline_hit {
            return Err(Error::TransferAborted(format!(
                "{program} did not finish within {}s",
                timeout.as_secs()
            )));
        }
        if !report.agent_success {
            return Err(Error::Agent(format!("{program} reported a failed transfer")));
        }
        Ok(())
    }
}

impl TransferAgent for ExternalAgent {
    fn name(&self) -> &str {
        "lrzsz"
    }

    fn ensure_available(&self) -> Result<()> {
        for command in [&self.sender, &self.receiver] {
            if find_in_path(command.program()).is_none() {
                return Err(Error::AgentUnavailable(command.program().to_string()));
            }
        }
        Ok(())
    }

    fn send_file(&mut self, port: &mut dyn Port, path: &Path, timeout: Duration) -> Result<TransferReport> {
        let file_name = display_name(path)?;
        let size = fs::metadata(path)
            .map_err(|_| Error::FileNotFound(path.to_path_buf()))?
            .len();

        let mut command = self.sender.command();
        command.arg(path);
        self.run(port, command, timeout)?;

        Ok(TransferReport {
            file_name,
            bytes: size,
            agent: self.name().to_string(),
        })
    }

    fn receive_file(
        &mut self,
        port: &mut dyn Port,
        name: &str,
        _size: u64,
        dest_dir: &Path,
        timeout: Duration,
    ) -> Result<TransferReport> {
        let tenths = (timeout.as_secs_f64() * 10.0) as u64;
        let mut command = self.receiver.command();
        command
            .args(["-E", "-t", &tenths.to_string()])
            .current_dir(dest_dir);
        self.run(port, command, timeout)?;

        // rb renames instead of overwriting, so the file may be missing here.
        let bytes = fs::metadata(dest_dir.join(name)).map_or(0, |m| m.len());
        Ok(TransferReport {
            file_name: name.to_string(),
            bytes,
            agent: self.name().to_string(),
        })
    }
}
