//! Duplex byte forwarding between an external transfer agent and the device.
//!
//! The agent (`sb`, `rb`) speaks YMODEM on its stdin/stdout. The bridge
//! connects those pipes to the serial link with two strands:
//!
//! ```text
//!            +--------------------- serial -> agent ---------------------+
//!            |                                                            v
//!   +--------+--------+                                          +--------+--------+
//!   |   Port (clone)  |                                          |  agent stdin    |
//!   +-----------------+                                          +-----------------+
//!   |   Port          | <------------ agent -> serial ---------- |  agent stdout   |
//!   +-----------------+                                          +-----------------+
//! ```
//!
//! Each strand reports how it ended over a channel. The first exit raises a
//! shared stop flag; the second strand gets a grace period, after which the
//! agent is killed so that a strand blocked on the agent's pipe unblocks.

use crate::error::{Error, Result};
use crate::port::Port;
use log::{debug, trace, warn};
use std::io::{ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// Grace period granted to the second strand once the first has ended.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(500);

/// Serial read timeout used by the serial -> agent strand.
pub const DEFAULT_POLL: Duration = Duration::from_millis(50);

const CHUNK_SIZE: usize = 4096;

/// Bridge timing.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Time the second strand gets after the first one ended.
    pub grace: Duration,
    /// Serial read timeout; bounds how fast the serial strand sees a stop.
    pub poll: Duration,
    /// Kill the agent if the transfer runs longer than this.
    pub deadline: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            grace: DEFAULT_GRACE,
            poll: DEFAULT_POLL,
            deadline: None,
        }
    }
}

impl BridgeConfig {
    /// Set the overall deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Forwarding direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strand {
    /// Device output to agent stdin.
    SerialToAgent,
    /// Agent stdout to device input.
    AgentToSerial,
}

/// How a strand ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrandExit {
    /// The source reached end of stream.
    EndOfStream,
    /// A read or write failed (closed pipe, unplugged device).
    Broken(ErrorKind),
    /// The stop flag was raised.
    Stopped,
}

/// Outcome of a bridged transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeReport {
    /// Bytes forwarded from the device to the agent.
    pub to_agent: u64,
    /// Bytes forwarded from the agent to the device.
    pub to_device: u64,
    /// Whether the agent exited successfully.
    pub agent_success: bool,
    /// Whether the overall deadline fired.
    pub deadline_hit: bool,
    /// Whether the agent had to be killed.
    pub killed: bool,
}

struct StrandReport {
    strand: Strand,
    exit: StrandExit,
    bytes: u64,
}

/// Runs an agent process against the serial link.
#[derive(Debug, Clone, Default)]
pub struct TransferBridge {
    config: BridgeConfig,
}

impl TransferBridge {
    /// Bridge with default timing and no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bridge with custom timing.
    pub fn with_config(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Bridge timing.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Forward bytes between `port` and `child` until the agent is done.
    ///
    /// `child` must have been spawned with piped stdin and stdout. The agent
    /// is always reaped before returning.
    pub fn run(&self, port: &mut dyn Port, mut child: Child) -> Result<BridgeReport> {
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Agent("agent stdin/stdout must be piped".into()));
        };

        let reader = port.try_clone_port().and_then(|mut reader| {
            reader.set_timeout(self.config.poll)?;
            Ok(reader)
        });
        let mut reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            },
        };

        let stop = AtomicBool::new(false);
        let started = Instant::now();
        let mut report = BridgeReport::default();

        thread::scope(|s| {
            let (tx, rx) = mpsc::channel::<StrandReport>();
            let stop = &stop;

            let serial_tx = tx.clone();
            s.spawn(move || {
                let (exit, bytes) = serial_to_agent(reader.as_mut(), stdin, stop);
                let _ = serial_tx.send(StrandReport {
                    strand: Strand::SerialToAgent,
                    exit,
                    bytes,
                });
            });

            s.spawn(move || {
                let (exit, bytes) = agent_to_serial(stdout, port, stop);
                let _ = tx.send(StrandReport {
                    strand: Strand::AgentToSerial,
                    exit,
                    bytes,
                });
            });

            let first = match self.config.deadline {
                Some(deadline) => rx.recv_timeout(deadline),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            let mut pending = 2;
            match first {
                Ok(first) => {
                    record(&mut report, &first);
                    pending -= 1;
                },
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "Transfer deadline of {:.1}s reached, stopping agent",
                        started.elapsed().as_secs_f64()
                    );
                    report.deadline_hit = true;
                    report.killed = kill(&mut child);
                },
                Err(RecvTimeoutError::Disconnected) => pending = 0,
            }
            stop.store(true, Ordering::Relaxed);

            if pending == 1 {
                match rx.recv_timeout(self.config.grace) {
                    Ok(second) => {
                        record(&mut report, &second);
                        pending = 0;
                    },
                    Err(_) => {
                        debug!("Second strand still busy after grace period, killing agent");
                        report.killed = kill(&mut child);
                    },
                }
            }

            while pending > 0 {
                match rx.recv() {
                    Ok(late) => {
                        record(&mut report, &late);
                        pending -= 1;
                    },
                    Err(_) => break,
                }
            }
        });

        let status = child.wait()?;
        report.agent_success = status.success() && !report.deadline_hit;
        debug!(
            "Bridge finished in {:?}: {} bytes to agent, {} bytes to device, agent {status}",
            started.elapsed(),
            report.to_agent,
            report.to_device
        );
        Ok(report)
    }
}

fn record(report: &mut BridgeReport, strand: &StrandReport) {
    debug!("{:?} strand ended: {:?}", strand.strand, strand.exit);
    match strand.strand {
        Strand::SerialToAgent => report.to_agent = strand.bytes,
        Strand::AgentToSerial => report.to_device = strand.bytes,
    }
}

fn kill(child: &mut Child) -> bool {
    match child.kill() {
        Ok(()) => true,
        Err(e) => {
            // Already exited.
            trace!("kill: {e}");
            false
        },
    }
}

fn serial_to_agent(port: &mut dyn Port, mut stdin: ChildStdin, stop: &AtomicBool) -> (StrandExit, u64) {
    let mut buf = [0u8; CHUNK_SIZE];
    let mut forwarded = 0u64;

    while !stop.load(Ordering::Relaxed) {
        let n = match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                continue;
            },
            Err(e) => return (StrandExit::Broken(e.kind()), forwarded),
        };

        trace!("serial -> agent: {n} bytes");
        if let Err(e) = stdin.write_all(&buf[..n]).and_then(|()| stdin.flush()) {
            return (StrandExit::Broken(e.kind()), forwarded);
        }
        forwarded += n as u64;
    }

    (StrandExit::Stopped, forwarded)
}

fn agent_to_serial(mut stdout: ChildStdout, port: &mut dyn Port, stop: &AtomicBool) -> (StrandExit, u64) {
    let mut buf = [0u8; CHUNK_SIZE];
    let mut forwarded = 0u64;

    loop {
        let n = match stdout.read(&mut buf) {
            Ok(0) => return (StrandExit::EndOfStream, forwarded),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return (StrandExit::Broken(e.kind()), forwarded),
        };

        if stop.load(Ordering::Relaxed) {
            return (StrandExit::Stopped, forwarded);
        }

        trace!("agent -> serial: {n} bytes");
        if let Err(e) = port.write_all(&buf[..n]).and_then(|()| port.flush()) {
            return (StrandExit::Broken(e.kind()), forwarded);
        }
        forwarded += n as u64;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::port::PortOpener;
    use crate::port::mock::MockDevice;
    use std::process::{Command, Stdio};

    fn spawn(program: &str, args: &[&str]) -> Child {
        Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    fn fast_bridge() -> TransferBridge {
        TransferBridge::with_config(BridgeConfig {
            grace: Duration::from_millis(100),
            poll: Duration::from_millis(5),
            deadline: None,
        })
    }

    #[test]
    fn test_agent_output_reaches_device() {
        let device = MockDevice::new();
        let mut port = device.open_port(Duration::from_millis(5)).unwrap();
        let child = spawn("sh", &["-c", "printf hello"]);

        let start = Instant::now();
        let report = fast_bridge().run(&mut port, child).unwrap();

        assert_eq!(device.tx(), b"hello");
        assert_eq!(report.to_device, 5);
        assert!(report.agent_success);
        assert!(!report.deadline_hit);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_device_output_reaches_agent() {
        let device = MockDevice::new();
        device.push_rx(b"ping\n");
        let mut port = device.open_port(Duration::from_millis(5)).unwrap();
        // Echo the first five bytes of stdin back to the device.
        let child = spawn("head", &["-c", "5"]);

        let report = fast_bridge().run(&mut port, child).unwrap();

        assert_eq!(report.to_agent, 5);
        assert_eq!(report.to_device, 5);
        assert_eq!(device.tx(), b"ping\n");
        assert!(report.agent_success);
    }

    #[test]
    fn test_stalled_strand_is_released_by_kill() {
        let device = MockDevice::new();
        let mut port = device.open_port(Duration::from_millis(5)).unwrap();
        // Agent closes stdin but keeps stdout open.
        let child = spawn("sh", &["-c", "exec 0<&-; exec sleep 5"]);
        // Device output arriving after that breaks the serial -> agent strand.
        let feeder = device.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            feeder.push_rx(b"x");
        });

        let start = Instant::now();
        let report = fast_bridge().run(&mut port, child).unwrap();

        assert!(report.killed);
        assert!(!report.agent_success);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_deadline_kills_silent_agent() {
        let device = MockDevice::new();
        let mut port = device.open_port(Duration::from_millis(5)).unwrap();
        let child = spawn("sh", &["-c", "exec sleep 5"]);
        let bridge = TransferBridge::with_config(BridgeConfig {
            grace: Duration::from_millis(100),
            poll: Duration::from_millis(5),
            deadline: Some(Duration::from_millis(200)),
        });

        let start = Instant::now();
        let report = bridge.run(&mut port, child).unwrap();

        assert!(report.deadline_hit);
        assert!(report.killed);
        assert!(!report.agent_success);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_unpiped_agent_is_rejected() {
        let device = MockDevice::new();
        let mut port = device.open_port(Duration::from_millis(5)).unwrap();
        let child = Command::new("sh")
            .args(["-c", "exit 0"])
            .stdout(Stdio::null())
            .spawn()
            .unwrap();

        let result = fast_bridge().run(&mut port, child);
        assert!(matches!(result, Err(Error::Agent(_))));
    }
}
